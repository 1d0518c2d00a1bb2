//! Message head processing.
//!
//! - [`RequestHeadDecoder`] / [`ResponseHeadDecoder`]: parse a start line and its header
//!   fields, bounded by a maximum head size
//! - [`body_framing`]: decides how the body after a head is delimited
//! - [`HeadEncoder`]: serializes a start line and header fields

mod header_decoder;
mod header_encoder;

pub use header_decoder::DEFAULT_MAX_HEADER_SIZE;
pub use header_decoder::RequestHeadDecoder;
pub use header_decoder::ResponseHeadDecoder;
pub use header_decoder::body_framing;
pub use header_encoder::HeadEncoder;
