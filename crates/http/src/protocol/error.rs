use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::concurrent::TimeoutError;
use crate::iostream::StreamError;

/// Error type handed back by delegates and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("input error: {source}")]
    Input { source: ParseError },

    #[error("output error: {source}")]
    Output { source: SendError },

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("delegate error: {0}")]
    Delegate(BoxError),

    #[error("connection was detached")]
    Detached,
}

impl From<ParseError> for HttpError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Stream(e) => Self::Stream(e),
            ParseError::Io { source } => Self::Stream(source.into()),
            source => Self::Input { source },
        }
    }
}

impl From<SendError> for HttpError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Stream(e) => Self::Stream(e),
            SendError::Io { source } => Self::Stream(source.into()),
            source => Self::Output { source },
        }
    }
}

impl HttpError {
    pub fn delegate<E: Into<BoxError>>(e: E) -> Self {
        Self::Delegate(e.into())
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid status line")]
    InvalidStatus,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("body size exceed the limit {max_size}")]
    TooLargeBody { max_size: u64 },

    #[error("unsupported transfer-encoding: {encoding}")]
    UnsupportedTransferEncoding { encoding: String },

    #[error("response with status {status} must not carry a body")]
    UnexpectedBody { status: StatusCode },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(str: S) -> Self {
        Self::UnsupportedTransferEncoding { encoding: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status a server answers with when it rejects a message for this reason.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } | Self::TooManyHeaders { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("headers have already been written")]
    HeadersAlreadyWritten,

    #[error("headers must be written before the body")]
    HeadersNotWritten,

    #[error("tried to write {actual} bytes but content-length is {expected}")]
    ContentLengthMismatch { expected: u64, actual: u64 },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
