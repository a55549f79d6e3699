//! Quay - HTTP/1.1 transport core
//!
//! Accepts TCP connections, receives one request per connection (JSON,
//! URL-encoded or multipart bodies, with uploads streamed to disk) and
//! transmits a single response before closing.

pub mod config;
pub mod http;
pub mod server;

pub use config::Config;
pub use http::handler::{Handler, Welcome};
pub use http::request::{Body, FileDescriptor, Method, Request};
pub use http::response::{Response, ResponseError, StatusCode};
pub use server::{Server, ShutdownHandle};
