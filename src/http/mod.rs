//! HTTP protocol implementation.
//!
//! Every connection carries exactly one request and one response and is
//! closed afterwards.
//!
//! # Architecture
//!
//! - **`connection`**: Drives one connection through the state machine below
//! - **`receiver`**: Incremental request parser fed with raw socket blocks
//! - **`multipart`**: Streams `multipart/form-data` parts to fields and upload files
//! - **`fields`**: Bracket-notation decoding of field names (`a[b][]`)
//! - **`request`**: Parsed request representation
//! - **`response`**: Response handle carrying a body or a file
//! - **`handler`**: Application hook invoked with each request
//! - **`writer`**: Serializes the response head and writes blocks
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Feed blocks to the receiver
//!        └──────┬──────┘
//!               │
//!       ┌───────┴────────┐
//!       │ complete       │ receive error
//!       ▼                ▼
//! ┌────────────┐   ┌────────────┐
//! │ Processing │   │ Rejecting  │ ← 409 with the error message
//! └─────┬──────┘   └─────┬──────┘
//!       │ response sent  │
//!       └───────┬────────┘
//!               ▼
//!        ┌─────────────┐
//!        │   Closed    │
//!        └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use quay::{Config, Server, Welcome};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(Config::default())?;
//!     server.run(Welcome).await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod fields;
pub mod handler;
pub mod mime;
pub mod multipart;
pub mod receiver;
pub mod request;
pub mod response;
pub mod writer;
