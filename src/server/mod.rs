//! TCP acceptor.

pub mod listener;

pub use listener::{ListenerError, Server, ShutdownHandle};
