//! First line of an HTTP/1.x message.

use std::fmt;

use http::{Method, StatusCode, Version};

/// `GET /path?query HTTP/1.1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStartLine {
    pub method: Method,
    pub path: String,
    pub version: Version,
}

impl RequestStartLine {
    pub fn new<P: Into<String>>(method: Method, path: P) -> Self {
        Self { method, path: path.into(), version: Version::HTTP_11 }
    }
}

impl fmt::Display for RequestStartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.method, self.path, self.version)
    }
}

/// `HTTP/1.1 200 OK`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStartLine {
    pub version: Version,
    pub code: StatusCode,
    pub reason: String,
}

impl ResponseStartLine {
    /// A HTTP/1.1 start line carrying the canonical reason phrase for `code`.
    pub fn new(code: StatusCode) -> Self {
        Self { version: Version::HTTP_11, code, reason: code.canonical_reason().unwrap_or("Unknown").to_owned() }
    }

    pub fn with_reason<R: Into<String>>(mut self, reason: R) -> Self {
        self.reason = reason.into();
        self
    }
}

impl fmt::Display for ResponseStartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.version, self.code.as_u16(), self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request(RequestStartLine),
    Response(ResponseStartLine),
}

impl StartLine {
    pub fn version(&self) -> Version {
        match self {
            StartLine::Request(line) => line.version,
            StartLine::Response(line) => line.version,
        }
    }

    pub fn as_request(&self) -> Option<&RequestStartLine> {
        match self {
            StartLine::Request(line) => Some(line),
            StartLine::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseStartLine> {
        match self {
            StartLine::Response(line) => Some(line),
            StartLine::Request(_) => None,
        }
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request(line) => line.fmt(f),
            StartLine::Response(line) => line.fmt(f),
        }
    }
}

impl From<RequestStartLine> for StartLine {
    fn from(line: RequestStartLine) -> Self {
        StartLine::Request(line)
    }
}

impl From<ResponseStartLine> for StartLine {
    fn from(line: ResponseStartLine) -> Self {
        StartLine::Response(line)
    }
}
