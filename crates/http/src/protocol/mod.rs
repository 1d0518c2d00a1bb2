//! Core HTTP protocol types.
//!
//! - [`StartLine`] with its [`RequestStartLine`] and [`ResponseStartLine`] forms
//! - [`PayloadItem`] and [`PayloadSize`], the body framing vocabulary shared by the codecs
//! - the error types: [`HttpError`] at the top, [`ParseError`] for input and [`SendError`]
//!   for output
//! - [`headers`], helpers for comma separated header values

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod start_line;
pub use start_line::RequestStartLine;
pub use start_line::ResponseStartLine;
pub use start_line::StartLine;

mod error;
pub use error::BoxError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod headers;
