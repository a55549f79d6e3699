//! Response handle given to handlers.
//!
//! A response carries either a buffered body or a file, never both:
//!
//! ```text
//! Idle ──add_body──▶ Body ──┐
//!   │                       ├──end──▶ Sent
//!   └────set_file──▶ File ──┘
//! ```
//!
//! Mixing the two is a contract violation. It is reported as an error and
//! aborts the response, so nothing is transmitted.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::http::mime;
use crate::http::writer::{serialize_head, write_block};

/// Payloads at or below this size are never compressed.
const GZIP_MIN_SIZE: usize = 96;
const SERVER_NAME: &str = "quay";

/// Write side of the client connection.
pub type Transport = Box<dyn AsyncWrite + Send + Unpin>;

/// HTTP status codes with a reason phrase.
///
/// Codes outside this table are sent as `200 OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 206 Partial Content
    PartialContent,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 409 Conflict
    Conflict,
    /// 500 Internal Server Error
    InternalServerError,
}

impl StatusCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            206 => StatusCode::PartialContent,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            409 => StatusCode::Conflict,
            500 => StatusCode::InternalServerError,
            _ => StatusCode::Ok,
        }
    }

    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use quay::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::Conflict.as_u16(), 409);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::PartialContent => 206,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::Conflict => 409,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::Conflict => "Conflict",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("Can't add body to a Response that contains a file.")]
    BodyWithFile,
    #[error("Can't add an attachment to a Response that contains a body.")]
    FileWithBody,
    #[error("response was already sent")]
    AlreadySent,
    #[error("response was aborted")]
    Aborted,
    #[error("failed to write response: {0}")]
    Io(#[from] std::io::Error),
}

enum State {
    Idle,
    Body(Vec<u8>),
    File { path: PathBuf, is_static: bool },
    Sent,
    Aborted,
}

/// JSON error body sent to clients: `{"code":409,"error":"..."}`.
pub fn error_json(code: u16, message: &str) -> String {
    serde_json::json!({ "code": code, "error": message }).to_string()
}

pub struct Response {
    out: Transport,
    status: StatusCode,
    headers: HashMap<String, String>,
    state: State,
    /// Client accepts gzip and compression is enabled.
    gzip: bool,
    block_size: usize,
    charset: String,
}

impl Response {
    /// Creates a response writing to `out`. `accept_encoding` is the raw
    /// header the client sent.
    pub fn new(out: Transport, config: &Config, accept_encoding: &str) -> Self {
        let mut response = Self {
            out,
            status: StatusCode::Ok,
            headers: HashMap::new(),
            state: State::Idle,
            gzip: config.gzip && accept_encoding.contains("gzip"),
            block_size: config.block_size(),
            charset: config.charset.clone(),
        };
        response.reset_headers();
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_code(&mut self, code: u16) {
        self.status = StatusCode::from_u16(code);
    }

    /// Sets a header, replacing any existing one with the same name in any case.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(&key));
        self.headers.insert(key, value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Appends to the response body.
    pub fn add_body(&mut self, chunk: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        match &mut self.state {
            State::Idle => {
                self.state = State::Body(chunk.as_ref().to_vec());
                Ok(())
            }
            State::Body(body) => {
                body.extend_from_slice(chunk.as_ref());
                Ok(())
            }
            State::File { .. } => {
                tracing::error!("Can't add body to a Response that contains a file");
                self.state = State::Aborted;
                Err(ResponseError::BodyWithFile)
            }
            State::Sent => Err(ResponseError::AlreadySent),
            State::Aborted => Err(ResponseError::Aborted),
        }
    }

    /// Answers with the contents of `path`.
    ///
    /// Unless `is_static`, the file is offered as a download.
    pub fn set_file(
        &mut self,
        path: impl Into<PathBuf>,
        is_static: bool,
    ) -> Result<(), ResponseError> {
        match self.state {
            State::Idle | State::File { .. } => {
                self.state = State::File {
                    path: path.into(),
                    is_static,
                };
                Ok(())
            }
            State::Body(_) => {
                tracing::error!("Can't add an attachment to a Response that contains a body");
                self.state = State::Aborted;
                Err(ResponseError::FileWithBody)
            }
            State::Sent => Err(ResponseError::AlreadySent),
            State::Aborted => Err(ResponseError::Aborted),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self.state, State::Sent)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, State::Aborted)
    }

    /// Transmits the response. Irreversible.
    pub async fn end(&mut self) -> Result<(), ResponseError> {
        match std::mem::replace(&mut self.state, State::Sent) {
            State::Idle => self.send_body(Vec::new()).await,
            State::Body(body) => self.send_body(body).await,
            State::File { path, is_static } => self.send_file(&path, is_static).await,
            State::Sent => Err(ResponseError::AlreadySent),
            State::Aborted => {
                self.state = State::Aborted;
                Err(ResponseError::Aborted)
            }
        }
    }

    /// Replaces whatever was prepared with a JSON error and sends it.
    pub async fn send_error(&mut self, code: u16, message: &str) -> Result<(), ResponseError> {
        if self.is_sent() {
            return Err(ResponseError::AlreadySent);
        }

        self.reset_headers();
        self.set_code(code);
        self.state = State::Body(error_json(code, message).into_bytes());
        self.end().await
    }

    fn reset_headers(&mut self) {
        self.headers.clear();
        self.set_header("Connection", "close");
        self.set_header("Content-Type", mime::from_extension("json", &self.charset));
        self.set_header("Server", SERVER_NAME);
    }

    fn should_compress(&self, len: usize) -> bool {
        self.gzip && len > GZIP_MIN_SIZE && len < self.block_size
    }

    async fn send_body(&mut self, body: Vec<u8>) -> Result<(), ResponseError> {
        let body = if self.should_compress(body.len()) {
            let compressed = gzip(&body)?;
            self.set_header("Content-Encoding", "gzip");
            compressed
        } else {
            self.headers
                .retain(|k, _| !k.eq_ignore_ascii_case("Content-Encoding"));
            body
        };

        self.write_head(body.len()).await?;
        for block in body.chunks(self.block_size) {
            write_block(&mut self.out, block).await?;
        }
        self.out.flush().await?;
        Ok(())
    }

    async fn send_file(&mut self, path: &Path, is_static: bool) -> Result<(), ResponseError> {
        let opened = match tokio::fs::File::open(path).await {
            Ok(file) => file.metadata().await.map(|meta| (file, meta)),
            Err(e) => Err(e),
        };
        let (mut file, meta) = match opened {
            Ok(opened) if opened.1.is_file() => opened,
            Ok(_) => {
                tracing::error!(path = %path.display(), "Failed to open file: not a regular file");
                return self.send_not_found().await;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to open file");
                return self.send_not_found().await;
            }
        };
        let size = meta.len() as usize;

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.set_header("Content-Type", mime::from_extension(&ext, &self.charset));
        if !is_static {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.set_header(
                "Content-Disposition",
                format!("attachment; filename=\"{name}\""),
            );
        }

        // only a file that fits in one block is compressed
        if self.should_compress(size) {
            let mut content = Vec::with_capacity(size);
            file.read_to_end(&mut content).await?;
            return self.send_body(content).await;
        }

        self.headers
            .retain(|k, _| !k.eq_ignore_ascii_case("Content-Encoding"));
        self.write_head(size).await?;

        let mut block = vec![0u8; self.block_size];
        let mut remaining = size;
        while remaining > 0 {
            let n = file.read(&mut block).await?;
            if n == 0 {
                break;
            }
            let n = n.min(remaining);
            write_block(&mut self.out, &block[..n]).await?;
            remaining -= n;
        }

        if remaining > 0 {
            return Err(ResponseError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shrank while sending",
            )));
        }

        self.out.flush().await?;
        Ok(())
    }

    async fn send_not_found(&mut self) -> Result<(), ResponseError> {
        self.headers
            .retain(|k, _| !k.eq_ignore_ascii_case("Content-Disposition"));
        self.set_header("Content-Type", mime::from_extension("json", &self.charset));
        self.status = StatusCode::NotFound;
        self.send_body(error_json(404, "Not found.").into_bytes()).await
    }

    async fn write_head(&mut self, content_length: usize) -> Result<(), ResponseError> {
        self.set_header("Connection", "close");
        self.set_header("Content-Length", content_length.to_string());

        let head = serialize_head(self.status, &self.headers);
        write_block(&mut self.out, &head).await?;
        Ok(())
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
