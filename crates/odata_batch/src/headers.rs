// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use uuid::Uuid;

use crate::{Error, Result};

pub(crate) const CONTENT_TYPE: &str = "Content-Type";
pub(crate) const CONTENT_LENGTH: &str = "Content-Length";
pub(crate) const CONTENT_ID: &str = "Content-ID";
pub(crate) const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub(crate) const APPLICATION_HTTP: &str = "application/http";
pub(crate) const MULTIPART_MIXED: &str = "multipart/mixed";
pub(crate) const HTTP_VERSION: &str = "HTTP/1.1";

/// An ordered list of HTTP headers with case-insensitive names.
///
/// Insertion order is preserved when the headers are written back out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationHeaders {
    entries: Vec<(String, String)>,
}

impl OperationHeaders {
    /// Creates an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of the header with the given name, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets a header, replacing any existing header with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.entries.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Removes a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.entries.iter().position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    /// Iterates over the headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// The number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The declared `Content-Length`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the header is present but is not a non-negative integer.
    pub fn content_length(&self) -> Result<Option<u64>> {
        self.get(CONTENT_LENGTH)
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|error| Error::format(format!("invalid Content-Length value '{value}': {error}")))
            })
            .transpose()
    }

    /// The boundary parameter of a `multipart/mixed` content type, if this header list declares one.
    #[must_use]
    pub fn content_type_boundary(&self) -> Option<&str> {
        let content_type = self.get(CONTENT_TYPE)?;
        let mut parts = content_type.split(';');

        let media_type = parts.next()?.trim();
        if !media_type.eq_ignore_ascii_case(MULTIPART_MIXED) {
            return None;
        }

        parts.find_map(|parameter| {
            let (name, value) = parameter.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"'))
                .filter(|boundary| !boundary.is_empty())
        })
    }

    /// Parses a single `Name: value` header line.
    pub(crate) fn parse_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::format(format!("header line '{line}' has no ':' separator")))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(Error::format(format!("header line '{line}' has an empty name")));
        }

        Ok((name.to_owned(), value.trim().to_owned()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OperationHeaders {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// The first line of an operation's embedded HTTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationLine {
    /// `METHOD URL HTTP/1.1`, used in batch requests.
    Request {
        /// The HTTP method.
        method: String,
        /// The request URL, absolute or relative to the service root.
        url: String,
    },
    /// `HTTP/1.1 CODE REASON`, used in batch responses.
    Response {
        /// The status code.
        status_code: u16,
        /// The reason phrase, possibly empty.
        reason: String,
    },
}

impl OperationLine {
    /// Creates a request line.
    #[must_use]
    pub fn request(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Request {
            method: method.into(),
            url: url.into(),
        }
    }

    /// Creates a response line.
    #[must_use]
    pub fn response(status_code: u16, reason: impl Into<String>) -> Self {
        Self::Response {
            status_code,
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(line: &str) -> Result<Self> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("HTTP/") {
            let (_version, rest) = rest
                .split_once(' ')
                .ok_or_else(|| Error::format(format!("response line '{line}' has no status code")))?;
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let status_code = code
                .parse()
                .map_err(|error| Error::format(format!("response line '{line}' has an invalid status code: {error}")))?;

            return Ok(Self::response(status_code, reason.trim()));
        }

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(url), Some(version), None) if version.starts_with("HTTP/") => Ok(Self::request(method, url)),
            _ => Err(Error::format(format!("'{line}' is not a valid request line"))),
        }
    }
}

impl fmt::Display for OperationLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request { method, url } => write!(f, "{method} {url} {HTTP_VERSION}"),
            Self::Response { status_code, reason } if reason.is_empty() => write!(f, "{HTTP_VERSION} {status_code}"),
            Self::Response { status_code, reason } => write!(f, "{HTTP_VERSION} {status_code} {reason}"),
        }
    }
}

/// Describes one operation inside a batch: its request or response line, its headers and where
/// it sits in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOperation {
    /// The request or response line.
    pub line: OperationLine,
    /// Headers of the embedded HTTP message.
    pub headers: OperationHeaders,
    /// The `Content-ID` of the MIME part, used to reference the operation from later ones.
    pub content_id: Option<String>,
    /// Boundary of the changeset the operation belongs to, if any.
    pub changeset: Option<String>,
}

impl BatchOperation {
    /// Creates an operation with no headers outside of any changeset.
    #[must_use]
    pub fn new(line: OperationLine) -> Self {
        Self {
            line,
            headers: OperationHeaders::new(),
            content_id: None,
            changeset: None,
        }
    }

    /// Sets a header of the embedded HTTP message.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the `Content-ID` of the MIME part.
    #[must_use]
    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }
}

/// Generates a fresh boundary token for a batch.
#[must_use]
pub fn generate_batch_boundary() -> String {
    format!("batch_{}", Uuid::new_v4())
}

/// Generates a fresh boundary token for a changeset.
#[must_use]
pub fn generate_changeset_boundary() -> String {
    format!("changeset_{}", Uuid::new_v4())
}
