//! Streaming `multipart/form-data` decoding.
//!
//! Text parts are collected in memory, file parts are appended to a fresh
//! file in the upload directory as their bytes arrive. Quotas are checked on
//! every increment, so an oversized upload is rejected before it is fully
//! received.

use bytes::{Buf, BytesMut};
use rand::Rng;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::http::fields;
use crate::http::receiver::{MAX_HEADERS_SIZE, ReceiveError, Signal, find, scan};
use crate::http::request::{FileDescriptor, RequestBuilder};

/// RFC 2046 caps boundaries at 70 characters.
const MAX_BOUNDARY_LEN: usize = 70;
const MAX_NAME_LEN: usize = 2048;
const MAX_FILENAME_LEN: usize = 255;

/// Boundary declared in the `Content-Type` header.
#[derive(Debug, Clone)]
pub struct Boundary {
    /// `--boundary`, opening the first part.
    opening: Vec<u8>,
    /// `\r\n--boundary`, closing a part.
    delimiter: Vec<u8>,
    /// Non-empty proper prefixes of the delimiter, longest first.
    prefixes: Vec<Vec<u8>>,
}

impl Boundary {
    pub fn new(value: &str) -> Result<Self, ReceiveError> {
        if value.is_empty() || value.len() > MAX_BOUNDARY_LEN {
            return Err(ReceiveError::InvalidBoundary);
        }

        let opening = [b"--", value.as_bytes()].concat();
        let delimiter = [b"\r\n", opening.as_slice()].concat();
        let prefixes = (1..delimiter.len())
            .rev()
            .map(|len| delimiter[..len].to_vec())
            .collect();

        Ok(Self {
            opening,
            delimiter,
            prefixes,
        })
    }

    /// Length of the buffer tail that may be a delimiter split across reads.
    fn pending_len(&self, buf: &[u8]) -> usize {
        self.prefixes
            .iter()
            .find(|prefix| buf.ends_with(prefix))
            .map(|prefix| prefix.len())
            .unwrap_or(0)
    }
}

enum Stage {
    /// Before the first boundary.
    Preamble,
    /// Right after a boundary: `--` ends the body, CRLF opens a part.
    AfterBoundary,
    PartHeaders,
    Content,
}

enum Part {
    Field {
        name: String,
        value: Vec<u8>,
    },
    File {
        name: String,
        file: File,
        descriptor: FileDescriptor,
    },
}

pub struct Multipart {
    boundary: Boundary,
    stage: Stage,
    /// Distinct field names seen, counted by the name before any bracket.
    names: HashSet<String>,
    files: usize,
    fields_size: usize,
    files_size: usize,
    part: Option<Part>,
}

impl Multipart {
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            stage: Stage::Preamble,
            names: HashSet::new(),
            files: 0,
            fields_size: 0,
            files_size: 0,
            part: None,
        }
    }

    /// Consumes as much of `buf` as can be decoded.
    ///
    /// Bytes that may belong to a boundary still arriving stay in `buf`.
    pub fn step(
        &mut self,
        buf: &mut BytesMut,
        config: &Config,
        request: &mut RequestBuilder,
        uploads: &mut Vec<PathBuf>,
    ) -> Result<Signal, ReceiveError> {
        loop {
            match self.stage {
                Stage::Preamble => match find(buf, &self.boundary.opening) {
                    Some(pos) => {
                        buf.advance(pos + self.boundary.opening.len());
                        self.stage = Stage::AfterBoundary;
                    }
                    None => {
                        let keep = (self.boundary.opening.len() - 1).min(buf.len());
                        buf.advance(buf.len() - keep);
                        return Ok(Signal::NeedMoreData);
                    }
                },
                Stage::AfterBoundary => {
                    if buf.len() < 2 {
                        return Ok(Signal::NeedMoreData);
                    }
                    if buf.starts_with(b"--") {
                        // the epilogue is ignored
                        buf.clear();
                        return Ok(Signal::Done);
                    }
                    if !buf.starts_with(b"\r\n") {
                        return Err(ReceiveError::InvalidBoundary);
                    }
                    self.stage = Stage::PartHeaders;
                }
                Stage::PartHeaders => {
                    let Some(end) = scan(
                        buf,
                        b"\r\n\r\n",
                        MAX_HEADERS_SIZE,
                        ReceiveError::HeadersTooLarge,
                    )?
                    else {
                        return Ok(Signal::NeedMoreData);
                    };

                    let block = buf.split_to(end + 4);
                    let headers = String::from_utf8_lossy(block.get(2..end).unwrap_or_default());
                    self.open_part(&headers, config, uploads)?;
                    self.stage = Stage::Content;
                }
                Stage::Content => match find(buf, &self.boundary.delimiter) {
                    Some(pos) => {
                        let data = buf.split_to(pos);
                        self.write(&data, config)?;
                        buf.advance(self.boundary.delimiter.len());
                        self.close_part(config, request)?;
                        self.stage = Stage::AfterBoundary;
                    }
                    None => {
                        let keep = self.boundary.pending_len(buf);
                        let data = buf.split_to(buf.len() - keep);
                        self.write(&data, config)?;
                        return Ok(Signal::NeedMoreData);
                    }
                },
            }
        }
    }

    fn open_part(
        &mut self,
        headers: &str,
        config: &Config,
        uploads: &mut Vec<PathBuf>,
    ) -> Result<(), ReceiveError> {
        let mut name = None;
        let mut filename = None;
        let mut mime = String::new();

        for line in headers.split("\r\n") {
            if starts_with_ignore_case(line, "Content-Disposition") {
                let value = attribute(line, "name")
                    .map_err(|_| ReceiveError::InvalidName)?
                    .filter(|n| !n.is_empty() && n.len() <= MAX_NAME_LEN)
                    .ok_or(ReceiveError::InvalidName)?;
                name = Some(value.to_string());

                filename = attribute(line, "filename")
                    .map_err(|_| ReceiveError::InvalidFilename)?
                    .map(str::to_string);
                if filename.as_ref().is_some_and(|f| f.len() > MAX_FILENAME_LEN) {
                    return Err(ReceiveError::InvalidFilename);
                }
            } else if starts_with_ignore_case(line, "Content-Type") {
                let (_, value) = line.split_once(": ").ok_or(ReceiveError::InvalidMime)?;
                mime = value.trim().to_string();
            }
        }

        let name = name.ok_or(ReceiveError::InvalidName)?;
        self.names.insert(fields::base_name(&name).to_string());
        if self.names.len() > config.max_fields {
            return Err(ReceiveError::TooManyFields);
        }

        // an empty filename is an unselected file input, kept as a text field
        let part = match filename.filter(|f| !f.is_empty()) {
            Some(real) => {
                self.files += 1;
                if self.files > config.max_files {
                    return Err(ReceiveError::TooManyFiles);
                }

                let ext = sanitize_extension(&real);
                let stem = upload_name();
                let file_name = if config.keep_extensions {
                    format!("{stem}{ext}")
                } else {
                    stem.clone()
                };
                let path = config.upload_dir.join(file_name);
                let file = File::create(&path).map_err(ReceiveError::Io)?;
                uploads.push(path.clone());

                tracing::debug!(field = %name, path = %path.display(), "Receiving upload");
                Part::File {
                    name,
                    file,
                    descriptor: FileDescriptor {
                        ext,
                        mime,
                        name: stem,
                        real,
                        path,
                        size: 0,
                    },
                }
            }
            None => Part::Field {
                name,
                value: Vec::new(),
            },
        };

        self.part = Some(part);
        Ok(())
    }

    fn write(&mut self, data: &[u8], config: &Config) -> Result<(), ReceiveError> {
        if data.is_empty() {
            return Ok(());
        }

        match &mut self.part {
            Some(Part::Field { value, .. }) => {
                self.fields_size += data.len();
                if self.fields_size > config.max_fields_size_total() {
                    return Err(ReceiveError::FieldsTooLarge);
                }
                value.extend_from_slice(data);
            }
            Some(Part::File {
                file, descriptor, ..
            }) => {
                descriptor.size += data.len();
                self.files_size += data.len();
                if descriptor.size > config.max_file_size() {
                    return Err(ReceiveError::FileTooLarge);
                }
                if self.files_size > config.max_files_size_total() {
                    return Err(ReceiveError::FilesTooLarge);
                }
                file.write_all(data).map_err(ReceiveError::Io)?;
            }
            None => {}
        }

        Ok(())
    }

    fn close_part(
        &mut self,
        config: &Config,
        request: &mut RequestBuilder,
    ) -> Result<(), ReceiveError> {
        match self.part.take() {
            Some(Part::Field { name, value }) => {
                let value = String::from_utf8_lossy(&value).into_owned();
                fields::insert(request.fields_mut(), &name, value);
            }
            Some(Part::File {
                name,
                mut file,
                descriptor,
            }) => {
                if descriptor.size == 0 && !config.allow_empty_files {
                    return Err(ReceiveError::EmptyFile);
                }
                file.flush().map_err(ReceiveError::Io)?;
                fields::insert(request.files_mut(), &name, descriptor);
            }
            None => {}
        }

        Ok(())
    }
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Value of `key="..."` in a header line.
///
/// `Err` means the attribute is present but its quote is never closed.
fn attribute<'a>(line: &'a str, key: &str) -> Result<Option<&'a str>, ()> {
    let pattern = format!("{key}=\"");
    let mut from = 0;

    while let Some(pos) = line[from..].find(&pattern) {
        let start = from + pos;
        let value_start = start + pattern.len();
        // `name=` must not match the tail of `filename=`
        let standalone = start == 0 || matches!(line.as_bytes()[start - 1], b' ' | b';' | b'\t');
        if standalone {
            return match line[value_start..].find('"') {
                Some(len) => Ok(Some(&line[value_start..value_start + len])),
                None => Err(()),
            };
        }
        from = value_start;
    }

    Ok(None)
}

/// Extension of the client-side name with anything but `[A-Za-z0-9.]`
/// replaced by `_`.
fn sanitize_extension(filename: &str) -> String {
    match Path::new(filename).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy())
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect(),
        None => String::new(),
    }
}

/// Millisecond timestamp followed by five random digits.
///
/// Unique only with high probability across concurrent uploads.
fn upload_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    format!("{millis}{suffix}")
}
