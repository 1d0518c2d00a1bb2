//! `permessage-deflate`, RFC 7692.
//!
//! Negotiation happens on the `Sec-WebSocket-Extensions` header: the client offers the
//! extension with its parameters, the server answers with the subset it agreed to. After that
//! every compressed message is a raw DEFLATE stream flushed with `Z_SYNC_FLUSH`, minus the
//! trailing `00 00 ff ff` that the receiver appends back before inflating.
//!
//! Window sizes below 15 bits on the sending side need the `zlib` feature. Without it a server
//! declines offers that restrict its window and a client refuses responses that restrict its
//! own. Inflating always uses a full window, which decodes any smaller one.

use std::fmt;

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;

use crate::WebSocketError;
use crate::frame::Role;

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MAX_WINDOW_BITS: u8 = 15;
const MIN_WINDOW_BITS: u8 = 8;

/// Local compression preferences. A handler or client returning these opts into
/// `permessage-deflate`.
#[derive(Debug, Clone, Copy)]
pub struct CompressionOptions {
    pub level: Compression,
    /// Ask (client) or announce (server) that the server resets its context after each message.
    pub server_no_context_takeover: bool,
    /// Ask (server) or announce (client) that the client resets its context after each message.
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            level: Compression::default(),
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
        }
    }
}

impl CompressionOptions {
    pub fn level(mut self, level: Compression) -> Self {
        self.level = level;
        self
    }

    pub fn server_no_context_takeover(mut self, server_no_context_takeover: bool) -> Self {
        self.server_no_context_takeover = server_no_context_takeover;
        self
    }

    pub fn client_no_context_takeover(mut self, client_no_context_takeover: bool) -> Self {
        self.client_no_context_takeover = client_no_context_takeover;
        self
    }

    pub fn server_max_window_bits(mut self, bits: Option<u8>) -> Self {
        self.server_max_window_bits = bits;
        self
    }

    pub fn client_max_window_bits(mut self, bits: Option<u8>) -> Self {
        self.client_max_window_bits = bits;
        self
    }
}

/// One element of a `Sec-WebSocket-Extensions` header: a name and its `key[=value]` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Parses every comma separated extension out of the given header values.
pub fn parse_extensions<'a, I>(values: I) -> Vec<Extension>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut extensions = Vec::new();
    for item in values.into_iter().flat_map(|value| value.split(',')) {
        let mut parts = item.split(';').map(str::trim);
        let Some(name) = parts.next().filter(|name| !name.is_empty()) else {
            continue;
        };
        let params = parts
            .filter(|param| !param.is_empty())
            .map(|param| match param.split_once('=') {
                Some((key, value)) => (key.trim().to_ascii_lowercase(), Some(value.trim().trim_matches('"').to_owned())),
                None => (param.to_ascii_lowercase(), None),
            })
            .collect();
        extensions.push(Extension { name: name.to_ascii_lowercase(), params });
    }
    extensions
}

/// `permessage-deflate` parameters, either offered or agreed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
    /// `client_max_window_bits` was present, possibly without a value.
    client_window_offered: bool,
}

impl DeflateParams {
    fn from_params(params: &[(String, Option<String>)]) -> Result<Self, WebSocketError> {
        let mut this = Self::default();
        let mut seen = Vec::with_capacity(params.len());
        for (key, value) in params {
            if seen.contains(&key) {
                return Err(WebSocketError::compression(format!("duplicate parameter {key}")));
            }
            seen.push(key);

            match (key.as_str(), value) {
                ("server_no_context_takeover", None) => this.server_no_context_takeover = true,
                ("client_no_context_takeover", None) => this.client_no_context_takeover = true,
                ("server_max_window_bits", Some(bits)) => this.server_max_window_bits = Some(parse_window_bits(bits)?),
                ("client_max_window_bits", bits) => {
                    this.client_window_offered = true;
                    this.client_max_window_bits = bits.as_deref().map(parse_window_bits).transpose()?;
                }
                _ => return Err(WebSocketError::compression(format!("unsupported parameter {key}"))),
            }
        }
        Ok(this)
    }
}

impl fmt::Display for DeflateParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PERMESSAGE_DEFLATE)?;
        if self.server_no_context_takeover {
            f.write_str("; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            f.write_str("; client_no_context_takeover")?;
        }
        if let Some(bits) = self.server_max_window_bits {
            write!(f, "; server_max_window_bits={bits}")?;
        }
        match self.client_max_window_bits {
            Some(bits) => write!(f, "; client_max_window_bits={bits}")?,
            None if self.client_window_offered => f.write_str("; client_max_window_bits")?,
            None => {}
        }
        Ok(())
    }
}

fn parse_window_bits(value: &str) -> Result<u8, WebSocketError> {
    value
        .parse::<u8>()
        .ok()
        .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
        .ok_or_else(|| WebSocketError::compression(format!("invalid window bits {value:?}")))
}

/// Whether this build can compress within a window of `bits`.
fn can_compress_with(bits: Option<u8>) -> bool {
    bits.is_none_or(|bits| bits == MAX_WINDOW_BITS || (cfg!(feature = "zlib") && bits > MIN_WINDOW_BITS))
}

/// Picks the first acceptable `permessage-deflate` offer and returns the agreed parameters,
/// which are also the server's response header.
pub(crate) fn negotiate_server(offers: &[Extension], options: &CompressionOptions) -> Option<DeflateParams> {
    for offer in offers.iter().filter(|offer| offer.name == PERMESSAGE_DEFLATE) {
        let mut agreed = match DeflateParams::from_params(&offer.params) {
            Ok(agreed) => agreed,
            Err(e) => {
                debug!(cause = %e, "declining permessage-deflate offer");
                continue;
            }
        };

        agreed.server_no_context_takeover |= options.server_no_context_takeover;
        agreed.client_no_context_takeover |= options.client_no_context_takeover;
        if let Some(bits) = options.server_max_window_bits {
            agreed.server_max_window_bits = Some(agreed.server_max_window_bits.map_or(bits, |offered| offered.min(bits)));
        }
        if agreed.client_window_offered
            && let Some(bits) = options.client_max_window_bits
        {
            agreed.client_max_window_bits = Some(agreed.client_max_window_bits.map_or(bits, |offered| offered.min(bits)));
        }
        // a bare client_max_window_bits is not echoed back
        agreed.client_window_offered = false;

        if !can_compress_with(agreed.server_max_window_bits) {
            debug!(bits = ?agreed.server_max_window_bits, "declining permessage-deflate offer, unsupported window");
            continue;
        }
        return Some(agreed);
    }
    None
}

/// The value of the client's `Sec-WebSocket-Extensions` request header.
pub(crate) fn client_offer(options: &CompressionOptions) -> String {
    DeflateParams {
        server_no_context_takeover: options.server_no_context_takeover,
        client_no_context_takeover: options.client_no_context_takeover,
        server_max_window_bits: options.server_max_window_bits,
        client_max_window_bits: options.client_max_window_bits.filter(|bits| can_compress_with(Some(*bits))),
        client_window_offered: true,
    }
    .to_string()
}

/// Checks the server's answer to [`client_offer`]. Anything but a single `permessage-deflate`
/// we asked for fails the handshake.
pub(crate) fn accept_client(response: &[Extension], requested: bool) -> Result<Option<DeflateParams>, WebSocketError> {
    let mut agreed = None;
    for extension in response {
        if extension.name != PERMESSAGE_DEFLATE || !requested || agreed.is_some() {
            return Err(WebSocketError::handshake(format!("unexpected extension {}", extension.name)));
        }
        let params = DeflateParams::from_params(&extension.params).map_err(WebSocketError::handshake)?;
        if !can_compress_with(params.client_max_window_bits) {
            return Err(WebSocketError::handshake("unsupported client_max_window_bits"));
        }
        agreed = Some(params);
    }
    Ok(agreed)
}

/// Compression contexts of one connection.
#[derive(Debug)]
pub struct PerMessageDeflate {
    deflater: Deflater,
    inflater: Inflater,
}

impl PerMessageDeflate {
    pub fn new(role: Role, params: &DeflateParams, level: Compression) -> Self {
        let (own_reset, own_bits, peer_reset) = match role {
            Role::Server => (params.server_no_context_takeover, params.server_max_window_bits, params.client_no_context_takeover),
            Role::Client => (params.client_no_context_takeover, params.client_max_window_bits, params.server_no_context_takeover),
        };
        Self { deflater: Deflater::new(level, own_bits, !own_reset), inflater: Inflater::new(!peer_reset) }
    }

    pub fn compress(&mut self, input: &[u8]) -> Result<Bytes, WebSocketError> {
        self.deflater.compress(input)
    }

    /// Inflates one message, failing once the output grows past `max_size`.
    pub fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Bytes, WebSocketError> {
        self.inflater.decompress(input, max_size)
    }

    /// The sending and receiving contexts, for use on different tasks.
    pub(crate) fn into_parts(self) -> (Deflater, Inflater) {
        (self.deflater, self.inflater)
    }
}

fn consumed_since(total_in: u64, start: u64, len: usize) -> usize {
    usize::try_from(total_in - start).map_or(len, |consumed| consumed.min(len))
}

fn ensure_spare(output: &mut Vec<u8>) {
    if output.capacity() - output.len() < 64 {
        output.reserve(output.capacity().max(64));
    }
}

#[derive(Debug)]
pub(crate) struct Deflater {
    compress: Compress,
    persistent: bool,
}

impl Deflater {
    fn new(level: Compression, window_bits: Option<u8>, persistent: bool) -> Self {
        #[cfg(feature = "zlib")]
        let compress = match window_bits {
            Some(bits) if bits < MAX_WINDOW_BITS => Compress::new_with_window_bits(level, false, bits.max(9)),
            _ => Compress::new(level, false),
        };
        #[cfg(not(feature = "zlib"))]
        let compress = {
            let _ = window_bits;
            Compress::new(level, false)
        };
        Self { compress, persistent }
    }

    pub(crate) fn compress(&mut self, input: &[u8]) -> Result<Bytes, WebSocketError> {
        if !self.persistent {
            self.compress.reset();
        }
        let start = self.compress.total_in();
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        loop {
            ensure_spare(&mut output);
            let consumed = consumed_since(self.compress.total_in(), start, input.len());
            self.compress
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(WebSocketError::compression)?;

            let consumed = consumed_since(self.compress.total_in(), start, input.len());
            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }
        Ok(Bytes::from(output))
    }
}

#[derive(Debug)]
pub(crate) struct Inflater {
    decompress: Decompress,
    persistent: bool,
}

impl Inflater {
    fn new(persistent: bool) -> Self {
        Self { decompress: Decompress::new(false), persistent }
    }

    pub(crate) fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Bytes, WebSocketError> {
        if !self.persistent {
            self.decompress.reset(false);
        }
        let mut output = Vec::with_capacity(input.len().saturating_mul(2).clamp(64, max_size.max(64)));
        let mut stream_ended = false;

        for part in [input, &DEFLATE_TRAILER[..]] {
            let start = self.decompress.total_in();
            while !stream_ended {
                ensure_spare(&mut output);
                let consumed = consumed_since(self.decompress.total_in(), start, part.len());
                let produced = output.len();
                let status = self
                    .decompress
                    .decompress_vec(&part[consumed..], &mut output, FlushDecompress::Sync)
                    .map_err(WebSocketError::compression)?;

                if output.len() > max_size {
                    return Err(WebSocketError::MessageTooBig { size: output.len() as u64, max_size });
                }
                stream_ended = status == Status::StreamEnd;

                let now_consumed = consumed_since(self.decompress.total_in(), start, part.len());
                let spare = output.len() < output.capacity();
                if now_consumed == part.len() && spare {
                    break;
                }
                if now_consumed == consumed && output.len() == produced && spare {
                    return Err(WebSocketError::compression("deflate stream stalled"));
                }
            }
        }

        if stream_ended {
            // a final block ends the stream; the next message starts a fresh one
            self.decompress.reset(false);
        }
        Ok(Bytes::from(output))
    }
}
