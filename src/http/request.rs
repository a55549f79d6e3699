use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::http::fields::FieldMap;

/// HTTP request methods.
///
/// POST, PUT, PATCH and DELETE carry a body. The remaining verbs end at the
/// blank line after the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    CONNECT,
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Matching is case-sensitive, as on the wire.
    ///
    /// ```
    /// # use quay::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }

    pub fn has_body(&self) -> bool {
        matches!(
            self,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

/// Decoded request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// URL-encoded pairs or multipart text fields.
    Fields(FieldMap<String>),
}

impl Body {
    pub fn json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&FieldMap<String>> {
        match self {
            Body::Fields(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// An uploaded file that was streamed to the upload directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    /// Sanitised extension of the client-side name, including the dot.
    pub ext: String,
    /// Content-Type declared for the part, empty if none.
    pub mime: String,
    /// Generated name on disk, without extension.
    pub name: String,
    /// Name the client sent.
    pub real: String,
    pub path: PathBuf,
    pub size: usize,
}

/// A fully received HTTP request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    pub query: FieldMap<String>,
    pub version: String,
    /// Request headers as received.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// Peer IP address.
    pub client: String,
    pub body: Body,
    pub files: FieldMap<FileDescriptor>,
}

/// Accumulates request parts while they are parsed.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    query: FieldMap<String>,
    version: Option<String>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    client: String,
    body: Body,
    fields: FieldMap<String>,
    files: FieldMap<FileDescriptor>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = Some(version.into());
    }

    pub fn set_client(&mut self, client: impl Into<String>) {
        self.client = client.into();
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn query_mut(&mut self) -> &mut FieldMap<String> {
        &mut self.query
    }

    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    pub fn cookies_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.cookies
    }

    pub fn files_mut(&mut self) -> &mut FieldMap<FileDescriptor> {
        &mut self.files
    }

    /// Text fields of a multipart or URL-encoded body.
    ///
    /// They become the request body unless an explicit body was set.
    pub fn fields_mut(&mut self) -> &mut FieldMap<String> {
        &mut self.fields
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let body = match self.body {
            Body::Empty if !self.fields.is_empty() => Body::Fields(self.fields),
            body => body,
        };

        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            query: self.query,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            cookies: self.cookies,
            client: self.client,
            body,
            files: self.files,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|v| v.as_str())
    }
}
