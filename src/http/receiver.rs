//! Incremental request parser.
//!
//! A [`Receiver`] is fed raw socket blocks and walks a strictly ordered set
//! of phases:
//!
//! ```text
//! Method → Path → Version → Headers → Body(Json | UrlEncoded | Multipart) → Complete
//! ```
//!
//! Every phase is re-entered with the accumulated buffer until it can
//! advance. A phase never waits for bytes: it returns
//! [`Signal::NeedMoreData`] and the caller reads the socket again. The
//! outcome is the same however the bytes are split across calls.

use bytes::{Buf, BytesMut};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::http::fields;
use crate::http::multipart::{Boundary, Multipart};
use crate::http::request::{Body, Method, Request, RequestBuilder};

const MAX_METHOD_SIZE: usize = 8;
const MAX_PATH_SIZE: usize = 2048;
const MAX_VERSION_SIZE: usize = 10;
pub(crate) const MAX_HEADERS_SIZE: usize = 8192;

/// Outcome of a parse step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Wait for the next socket read.
    NeedMoreData,
    /// The request is complete.
    Done,
}

/// Reasons a request is rejected. The message is sent to the client.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("Invalid request.")]
    InvalidRequest,
    #[error("The maximum size of the method has been exceeded.")]
    MethodTooLong,
    #[error("Unknown request method.")]
    UnknownMethod,
    #[error("The maximum size of the URL has been exceeded.")]
    PathTooLong,
    #[error("The maximum size of the version has been exceeded.")]
    VersionTooLong,
    #[error("The maximum size of headers has been exceeded.")]
    HeadersTooLarge,
    #[error("Content-Length must be a number.")]
    InvalidContentLength,
    #[error("The body exceeds the Content-Length.")]
    BodyTooLong,
    #[error("The body contains invalid JSON.")]
    InvalidJson,
    #[error("Invalid boundary detected in multipart/form-data.")]
    InvalidBoundary,
    #[error("Invalid name detected in multipart/form-data.")]
    InvalidName,
    #[error("Invalid filename detected in multipart/form-data.")]
    InvalidFilename,
    #[error("Invalid mime detected in multipart/form-data.")]
    InvalidMime,
    #[error("The maximum number of fields has been exceeded.")]
    TooManyFields,
    #[error("The maximum number of files has been exceeded.")]
    TooManyFiles,
    #[error("The maximum size of the file has been exceeded.")]
    FileTooLarge,
    #[error("The maximum size of files has been exceeded.")]
    FilesTooLarge,
    #[error("The maximum size of fields has been exceeded.")]
    FieldsTooLarge,
    #[error("Empty files are not allowed.")]
    EmptyFile,
    #[error("Can't save file.")]
    Io(#[source] std::io::Error),
}

impl ReceiveError {
    /// Coarse category used in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            ReceiveError::TooManyFields
            | ReceiveError::TooManyFiles
            | ReceiveError::FileTooLarge
            | ReceiveError::FilesTooLarge
            | ReceiveError::FieldsTooLarge
            | ReceiveError::EmptyFile => "quota",
            ReceiveError::Io(_) => "io",
            _ => "parse",
        }
    }
}

/// Classification of the `Content-Type` header.
#[derive(Debug, Clone, Default)]
enum ContentType {
    Json,
    /// Also the fallback for missing or unknown types.
    #[default]
    UrlEncoded,
    Multipart(Boundary),
}

enum BodyKind {
    Json,
    UrlEncoded,
    Multipart(Multipart),
}

enum Phase {
    Method,
    Path,
    Version,
    Headers,
    Body(BodyKind),
    Complete,
    /// The request was rejected; nothing more is parsed.
    Failed,
}

/// Parser state for one request on one connection.
///
/// Not shareable: a connection task owns its receiver exclusively.
pub struct Receiver {
    config: Arc<Config>,
    client: String,
    buffer: BytesMut,
    phase: Phase,
    method: Option<Method>,
    content_length: usize,
    content_type: ContentType,
    accept_encoding: String,
    /// Body bytes received so far, consumed or still buffered.
    body_seen: usize,
    request: RequestBuilder,
    /// Upload files created on disk for this request.
    uploads: Vec<PathBuf>,
}

impl Receiver {
    pub fn new(config: Arc<Config>, client: impl Into<String>) -> Self {
        let client = client.into();
        let mut request = RequestBuilder::new();
        request.set_client(client.clone());

        Self {
            buffer: BytesMut::with_capacity(config.block_size()),
            config,
            client,
            phase: Phase::Method,
            method: None,
            content_length: 0,
            content_type: ContentType::default(),
            accept_encoding: String::new(),
            body_seen: 0,
            request,
            uploads: Vec::new(),
        }
    }

    /// Feeds one block of socket bytes to the parser.
    pub fn feed(&mut self, block: &[u8]) -> Result<Signal, ReceiveError> {
        if matches!(self.phase, Phase::Body(_)) {
            self.body_seen += block.len();
        }
        self.buffer.extend_from_slice(block);

        loop {
            let signal = match self.phase {
                Phase::Method => self.on_method()?,
                Phase::Path => self.on_path()?,
                Phase::Version => self.on_version()?,
                Phase::Headers => self.on_headers()?,
                Phase::Body(_) => self.on_body()?,
                Phase::Complete => return Ok(Signal::Done),
                Phase::Failed => return Err(ReceiveError::InvalidRequest),
            };

            if signal == Signal::NeedMoreData {
                return Ok(signal);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    /// `Accept-Encoding` as the client sent it, empty if absent.
    pub fn accept_encoding(&self) -> &str {
        &self.accept_encoding
    }

    /// Files written to the upload directory so far.
    pub fn uploads(&self) -> &[PathBuf] {
        &self.uploads
    }

    /// Returns the completed request and resets the receiver for the next one.
    pub fn finish(&mut self) -> Result<Request, ReceiveError> {
        if !self.is_complete() {
            return Err(ReceiveError::InvalidRequest);
        }

        let fresh = Receiver::new(self.config.clone(), self.client.clone());
        let mut done = std::mem::replace(self, fresh);
        // the uploads now belong to the request
        done.uploads.clear();
        std::mem::take(&mut done.request)
            .build()
            .map_err(|_| ReceiveError::InvalidRequest)
    }

    /// Removes the files written for a request that was rejected.
    pub fn discard_uploads(&mut self) {
        // drops the file still being streamed, if any
        self.phase = Phase::Failed;

        for path in self.uploads.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed upload"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove upload")
                }
            }
        }
    }

    fn on_method(&mut self) -> Result<Signal, ReceiveError> {
        let Some(end) = scan(&self.buffer, b" ", MAX_METHOD_SIZE, ReceiveError::MethodTooLong)?
        else {
            return Ok(Signal::NeedMoreData);
        };

        let method = std::str::from_utf8(&self.buffer[..end])
            .ok()
            .and_then(Method::from_str)
            .ok_or(ReceiveError::UnknownMethod)?;

        self.method = Some(method);
        self.request.set_method(method);
        self.buffer.advance(end + 1);
        self.phase = Phase::Path;
        Ok(Signal::Done)
    }

    fn on_path(&mut self) -> Result<Signal, ReceiveError> {
        let Some(end) = scan(&self.buffer, b" ", MAX_PATH_SIZE, ReceiveError::PathTooLong)? else {
            return Ok(Signal::NeedMoreData);
        };

        let url = self.buffer.split_to(end + 1);
        let url = std::str::from_utf8(&url[..end]).map_err(|_| ReceiveError::InvalidRequest)?;

        match url.split_once('?') {
            Some((path, query)) => {
                self.request.set_path(path);
                fields::decode_urlencoded(self.request.query_mut(), query.as_bytes());
            }
            None => self.request.set_path(url),
        }

        self.phase = Phase::Version;
        Ok(Signal::Done)
    }

    fn on_version(&mut self) -> Result<Signal, ReceiveError> {
        let Some(end) = scan(&self.buffer, b"\r\n", MAX_VERSION_SIZE, ReceiveError::VersionTooLong)?
        else {
            return Ok(Signal::NeedMoreData);
        };

        let version = self.buffer.split_to(end + 2);
        let version =
            std::str::from_utf8(&version[..end]).map_err(|_| ReceiveError::InvalidRequest)?;
        self.request.set_version(version);
        self.phase = Phase::Headers;
        Ok(Signal::Done)
    }

    fn on_headers(&mut self) -> Result<Signal, ReceiveError> {
        if self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
            return self.begin_body();
        }

        let Some(end) = scan(
            &self.buffer,
            b"\r\n\r\n",
            MAX_HEADERS_SIZE,
            ReceiveError::HeadersTooLarge,
        )?
        else {
            return Ok(Signal::NeedMoreData);
        };

        let block = self.buffer.split_to(end + 4);
        let block = String::from_utf8_lossy(&block[..end]);
        for line in block.split("\r\n") {
            if let Some((key, value)) = line.split_once(": ") {
                self.set_header(key, value)?;
            }
        }

        self.begin_body()
    }

    fn set_header(&mut self, key: &str, value: &str) -> Result<(), ReceiveError> {
        self.request
            .headers_mut()
            .insert(key.to_string(), value.to_string());

        if key.eq_ignore_ascii_case("Accept-Encoding") {
            self.accept_encoding = value.to_string();
        } else if key.eq_ignore_ascii_case("Content-Length") {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ReceiveError::InvalidContentLength);
            }
            self.content_length = value
                .parse()
                .map_err(|_| ReceiveError::InvalidContentLength)?;
        } else if key.eq_ignore_ascii_case("Content-Type") {
            self.content_type = classify(value)?;
        } else if key.eq_ignore_ascii_case("Cookie") {
            self.set_cookies(value);
        }

        Ok(())
    }

    /// `a=1; b=2`: the first pair has no leading space, the rest do.
    fn set_cookies(&mut self, value: &str) {
        let cookies = self.request.cookies_mut();
        for (i, pair) in value.split(';').enumerate() {
            let pair = if i == 0 {
                pair
            } else {
                pair.strip_prefix(' ').unwrap_or(pair)
            };
            if let Some((name, data)) = pair.split_once('=') {
                cookies.insert(name.to_string(), data.to_string());
            }
        }
    }

    fn begin_body(&mut self) -> Result<Signal, ReceiveError> {
        let has_body = self.method.map(|m| m.has_body()).unwrap_or(false);
        if !has_body {
            self.phase = Phase::Complete;
            return Ok(Signal::Done);
        }

        self.body_seen = self.buffer.len();
        let buffered = !matches!(self.content_type, ContentType::Multipart(_));
        if buffered && self.content_length > self.config.max_fields_size_total() {
            return Err(ReceiveError::FieldsTooLarge);
        }

        let kind = match std::mem::take(&mut self.content_type) {
            ContentType::Json => BodyKind::Json,
            ContentType::UrlEncoded => BodyKind::UrlEncoded,
            ContentType::Multipart(boundary) => BodyKind::Multipart(Multipart::new(boundary)),
        };
        self.phase = Phase::Body(kind);
        Ok(Signal::Done)
    }

    fn on_body(&mut self) -> Result<Signal, ReceiveError> {
        if self.body_seen > self.content_length {
            return Err(ReceiveError::BodyTooLong);
        }

        if self.content_length == 0 {
            self.buffer.clear();
            self.phase = Phase::Complete;
            return Ok(Signal::Done);
        }

        let complete = self.body_seen == self.content_length;
        let signal = match &mut self.phase {
            Phase::Body(BodyKind::Json) => {
                if !complete {
                    return Ok(Signal::NeedMoreData);
                }
                let value = serde_json::from_slice(&self.buffer)
                    .map_err(|_| ReceiveError::InvalidJson)?;
                self.request.set_body(Body::Json(value));
                self.buffer.clear();
                Signal::Done
            }
            Phase::Body(BodyKind::UrlEncoded) => {
                if !complete {
                    return Ok(Signal::NeedMoreData);
                }
                fields::decode_urlencoded(self.request.fields_mut(), &self.buffer);
                self.buffer.clear();
                Signal::Done
            }
            Phase::Body(BodyKind::Multipart(multipart)) => {
                let signal = multipart.step(
                    &mut self.buffer,
                    &self.config,
                    &mut self.request,
                    &mut self.uploads,
                )?;
                if signal == Signal::NeedMoreData && complete {
                    // every declared byte arrived without the closing boundary
                    return Err(ReceiveError::InvalidBoundary);
                }
                signal
            }
            _ => return Err(ReceiveError::InvalidRequest),
        };

        if signal == Signal::Done {
            self.phase = Phase::Complete;
        }
        Ok(signal)
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if !self.uploads.is_empty() {
            self.discard_uploads();
        }
    }
}

/// Finds `needle` in `buf`, requiring it to start within `cap` bytes.
///
/// Yields `Ok(None)` while the needle may still arrive and `Err(too_long)`
/// once it can no longer start within the cap.
pub(crate) fn scan(
    buf: &[u8],
    needle: &[u8],
    cap: usize,
    too_long: ReceiveError,
) -> Result<Option<usize>, ReceiveError> {
    match find(buf, needle) {
        Some(pos) if pos > cap => Err(too_long),
        Some(pos) => Ok(Some(pos)),
        None if buf.len() >= cap + needle.len() => Err(too_long),
        None => Ok(None),
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn classify(value: &str) -> Result<ContentType, ReceiveError> {
    let (mime, params) = match value.split_once(';') {
        Some((mime, params)) => (mime.trim(), params),
        None => (value.trim(), ""),
    };

    if mime.eq_ignore_ascii_case("application/json") {
        return Ok(ContentType::Json);
    }

    if mime.eq_ignore_ascii_case("multipart/form-data") {
        let boundary = params
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("boundary="))
            .map(|b| b.trim_matches('"'))
            .next()
            .unwrap_or("");
        if boundary.is_empty() {
            return Ok(ContentType::UrlEncoded);
        }
        return Boundary::new(boundary).map(ContentType::Multipart);
    }

    Ok(ContentType::UrlEncoded)
}
