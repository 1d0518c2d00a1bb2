//! HTTP body framing.
//!
//! - [`PayloadDecoder`]: reads a body delimited by Content-Length, chunked transfer encoding
//!   (with trailers) or connection close
//! - [`PayloadEncoder`]: writes a body with the matching framing and enforces a declared
//!   Content-Length

mod chunked_decoder;
mod chunked_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
