use std::io;

use gale_http::iostream::StreamError;
use gale_http::protocol::{BoxError, HttpError};
use thiserror::Error;

use crate::frame::CloseCode;

#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("websocket connection is closed")]
    ConnectionClosed,

    #[error("invalid opcode {0:#x}")]
    InvalidOpCode(u8),

    #[error("reserved bits {0:#05b} set without a negotiated extension")]
    ReservedBits(u8),

    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    #[error("unmasked frame from a client")]
    UnmaskedFrame,

    #[error("masked frame from a server")]
    MaskedFrame,

    #[error("continuation frame without a message to continue")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("message of {size} bytes exceeds the limit of {max_size}")]
    MessageTooBig { size: u64, max_size: usize },

    #[error("text message is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid close frame: {0}")]
    InvalidCloseFrame(&'static str),

    #[error("control frame payload of {0} bytes exceeds 125")]
    PayloadTooLarge(usize),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("timed out connecting")]
    ConnectTimeout,

    #[error("handler error: {0}")]
    Handler(BoxError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl WebSocketError {
    pub fn handshake<S: ToString>(str: S) -> Self {
        Self::Handshake(str.to_string())
    }

    pub fn compression<S: ToString>(str: S) -> Self {
        Self::Compression(str.to_string())
    }

    pub fn handler<E: Into<BoxError>>(e: E) -> Self {
        Self::Handler(e.into())
    }

    /// The code of the close frame sent before tearing the connection down, `None` when the
    /// connection is dropped without one.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidOpCode(_)
            | Self::ReservedBits(_)
            | Self::FragmentedControlFrame
            | Self::ControlFrameTooLarge(_)
            | Self::UnmaskedFrame
            | Self::MaskedFrame
            | Self::UnexpectedContinuation
            | Self::InterleavedMessage
            | Self::InvalidCloseFrame(_) => Some(CloseCode::PROTOCOL_ERROR),
            Self::InvalidUtf8 | Self::Compression(_) => Some(CloseCode::INVALID_PAYLOAD),
            Self::MessageTooBig { .. } => Some(CloseCode::MESSAGE_TOO_BIG),
            _ => None,
        }
    }
}
