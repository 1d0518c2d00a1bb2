//! Decoders for the head of HTTP/1.x messages: start line plus header fields.
//!
//! Both decoders parse with `httparse` and keep the header values zero-copy: the byte ranges
//! of names and values are recorded against the read buffer, the head is split off as one
//! `Bytes`, and every [`HeaderValue`] is a slice of it.
//!
//! Leading empty lines before the start line are skipped (RFC 7230 §3.5). A head that does not
//! complete within `max_header_size` bytes fails with [`ParseError::TooLargeHeader`].
//!
//! [`body_framing`] then decides how the body that follows is delimited.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::headers::header_tokens;
use crate::protocol::{ParseError, PayloadSize, RequestStartLine, ResponseStartLine};

/// Maximum number of header fields in one message
const MAX_HEADER_NUM: usize = 64;

/// Default limit for the whole head section
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Decodes `(RequestStartLine, HeaderMap)` from the read buffer.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeadDecoder {
    max_header_size: usize,
}

impl RequestHeadDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self { max_header_size }
    }
}

impl Default for RequestHeadDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_SIZE)
    }
}

impl Decoder for RequestHeadDecoder {
    type Item = (RequestStartLine, HeaderMap);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let parsed = req.parse(src).map_err(map_httparse_error)?;

        let Status::Complete(head_size) = parsed else {
            ensure!(src.len() <= self.max_header_size, ParseError::too_large_header(src.len(), self.max_header_size));
            return Ok(None);
        };

        trace!(head_size, "parsed request head");
        ensure!(head_size <= self.max_header_size, ParseError::too_large_header(head_size, self.max_header_size));

        let header_count = req.headers.len();
        let mut header_index = EMPTY_HEADER_INDEX_ARRAY;
        HeaderIndex::record(src, req.headers, &mut header_index);

        let version = parse_version(req.version)?;
        let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes())
            .map_err(|_| ParseError::InvalidMethod)?;
        let path = req.path.ok_or(ParseError::InvalidUri)?.to_owned();

        let head_bytes = src.split_to(head_size).freeze();
        let headers = build_headers(&head_bytes, &header_index[..header_count])?;

        Ok(Some((RequestStartLine { method, path, version }, headers)))
    }
}

/// Decodes `(ResponseStartLine, HeaderMap)` from the read buffer.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeadDecoder {
    max_header_size: usize,
}

impl ResponseHeadDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self { max_header_size }
    }
}

impl Default for ResponseHeadDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_SIZE)
    }
}

impl Decoder for ResponseHeadDecoder {
    type Item = (ResponseStartLine, HeaderMap);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut res = httparse::Response::new(&mut headers);

        let parsed = res.parse(src).map_err(map_httparse_error)?;

        let Status::Complete(head_size) = parsed else {
            ensure!(src.len() <= self.max_header_size, ParseError::too_large_header(src.len(), self.max_header_size));
            return Ok(None);
        };

        trace!(head_size, "parsed response head");
        ensure!(head_size <= self.max_header_size, ParseError::too_large_header(head_size, self.max_header_size));

        let header_count = res.headers.len();
        let mut header_index = EMPTY_HEADER_INDEX_ARRAY;
        HeaderIndex::record(src, res.headers, &mut header_index);

        let version = parse_version(res.version)?;
        let code = res.code.and_then(|code| StatusCode::from_u16(code).ok()).ok_or(ParseError::InvalidStatus)?;
        let reason = res.reason.unwrap_or_default().to_owned();

        let head_bytes = src.split_to(head_size).freeze();
        let headers = build_headers(&head_bytes, &header_index[..header_count])?;

        Ok(Some((ResponseStartLine { version, code, reason }, headers)))
    }
}

fn map_httparse_error(e: Error) -> ParseError {
    match e {
        Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        Error::Version => ParseError::InvalidVersion(None),
        Error::Status => ParseError::InvalidStatus,
        e => ParseError::invalid_header(e.to_string()),
    }
}

fn parse_version(version: Option<u8>) -> Result<Version, ParseError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        v => Err(ParseError::InvalidVersion(v)),
    }
}

fn build_headers(head_bytes: &Bytes, indices: &[HeaderIndex]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(indices.len());
    for index in indices {
        let name = HeaderName::from_bytes(&head_bytes[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_maybe_shared(head_bytes.slice(index.value.0..index.value.1))
            .map_err(ParseError::invalid_header)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Stores the byte range positions of a header's name and value within the original buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

/// Decides how the body following a head is delimited.
///
/// `status` is `None` for requests. Callers handle the cases where the body must be skipped
/// regardless of the headers (responses to HEAD, 1xx and 304) before calling this.
///
/// - Transfer-Encoding and Content-Length together are rejected
/// - repeated Content-Length values must all be equal
/// - a declared length above `max_body_size` is rejected up front
/// - `chunked` is the only transfer coding understood
/// - a 204 response must not announce a body
/// - without either header a request has no body, a response runs until the connection closes
pub fn body_framing(headers: &HeaderMap, status: Option<StatusCode>, max_body_size: u64) -> Result<PayloadSize, ParseError> {
    let content_length = if headers.contains_key(CONTENT_LENGTH) {
        ensure!(
            !headers.contains_key(TRANSFER_ENCODING),
            ParseError::invalid_content_length("transfer_encoding and content_length both present in headers")
        );
        let length = parse_content_length(headers)?;
        ensure!(length <= max_body_size, ParseError::TooLargeBody { max_size: max_body_size });
        Some(length)
    } else {
        None
    };

    let chunked = headers.contains_key(TRANSFER_ENCODING);
    if chunked {
        let mut codings = header_tokens(headers, TRANSFER_ENCODING);
        let only_chunked = matches!((codings.next(), codings.next()), (Some(coding), None) if coding.eq_ignore_ascii_case("chunked"));
        if !only_chunked {
            let value = headers.get(TRANSFER_ENCODING).and_then(|v| v.to_str().ok()).unwrap_or_default();
            return Err(ParseError::unsupported_transfer_encoding(value));
        }
    }

    if let Some(status) = status.filter(|status| *status == StatusCode::NO_CONTENT) {
        ensure!(!chunked && content_length.unwrap_or(0) == 0, ParseError::UnexpectedBody { status });
        return Ok(PayloadSize::Empty);
    }

    Ok(match (chunked, content_length, status) {
        (true, _, _) => PayloadSize::Chunked,
        (false, Some(0), _) => PayloadSize::Empty,
        (false, Some(length), _) => PayloadSize::Length(length),
        (false, None, None) => PayloadSize::Empty,
        (false, None, Some(_)) => PayloadSize::UntilClose,
    })
}

fn parse_content_length(headers: &HeaderMap) -> Result<u64, ParseError> {
    let mut pieces = header_tokens(headers, CONTENT_LENGTH);
    let first = pieces.next().ok_or_else(|| ParseError::invalid_content_length("empty value"))?;
    ensure!(pieces.all(|piece| piece == first), ParseError::invalid_content_length("multiple unequal content-lengths"));
    ensure!(
        first.bytes().all(|b| b.is_ascii_digit()),
        ParseError::invalid_content_length(format!("value {first} is not u64"))
    );
    first.parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {first} is not u64")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{self, HeaderValue};
    use indoc::indoc;

    fn headers_of(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_bytes_mut_lens() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        123"##};

        let mut bytes = BytesMut::from(str);
        let result = RequestHeadDecoder::default().decode(&mut bytes).unwrap();

        assert!(result.is_some());
        assert_eq!(&bytes[..], &b"123"[..]);
    }

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let mut buf = BytesMut::from(str);
        let (start_line, headers) = RequestHeadDecoder::default().decode(&mut buf).unwrap().unwrap();

        assert_eq!(start_line.method, Method::GET);
        assert_eq!(start_line.version, Version::HTTP_11);
        assert_eq!(start_line.path, "/index.html");

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "*/*");
        assert_eq!(headers.get(header::HOST).unwrap(), "127.0.0.1:8080");
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "curl/7.79.1");
        assert_eq!(body_framing(&headers, None, u64::MAX).unwrap(), PayloadSize::Empty);
    }

    #[test]
    fn from_edge() {
        let str = indoc! {r##"
        GET /index/?a=1&b=2&a=3 HTTP/1.1
        Host: 127.0.0.1:8080
        Connection: keep-alive
        Cache-Control: max-age=0
        sec-ch-ua: "#Not_A Brand";v="99", "Microsoft Edge";v="109", "Chromium";v="109"
        sec-ch-ua-mobile: ?0
        sec-ch-ua-platform: "macOS"
        Upgrade-Insecure-Requests: 1
        User-Agent: Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36 Edg/109.0.1518.52
        Accept: text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9
        Sec-Fetch-Site: none
        Sec-Fetch-Mode: navigate
        Sec-Fetch-User: ?1
        Sec-Fetch-Dest: document
        Accept-Encoding: gzip, deflate, br
        Accept-Language: zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7

        "##};

        let mut buf = BytesMut::from(str);
        let (start_line, headers) = RequestHeadDecoder::default().decode(&mut buf).unwrap().unwrap();

        assert_eq!(start_line.path, "/index/?a=1&b=2&a=3");
        assert_eq!(headers.len(), 15);
        assert_eq!(headers.get(header::CONNECTION).unwrap(), "keep-alive");
        assert_eq!(
            headers.get("sec-ch-ua").unwrap(),
            r##""#Not_A Brand";v="99", "Microsoft Edge";v="109", "Chromium";v="109""##
        );
        assert_eq!(headers.get("sec-ch-ua-platform").unwrap(), "\"macOS\"");
        assert_eq!(headers.get(header::ACCEPT_LANGUAGE).unwrap(), "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7");
    }

    #[test]
    fn skips_leading_blank_lines() {
        let mut buf = BytesMut::from(&b"\r\n\r\nGET /x HTTP/1.1\r\nHost: h\r\n\r\n"[..]);
        let (start_line, headers) = RequestHeadDecoder::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(start_line.path, "/x");
        assert_eq!(headers.get(header::HOST).unwrap(), "h");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_head_waits() {
        let mut buf = BytesMut::from(&b"GET /x HTTP/1.1\r\nHost: h\r\n"[..]);
        assert!(RequestHeadDecoder::default().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut buf = BytesMut::from(&b"GET /x HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);
        let result = RequestHeadDecoder::new(32).decode(&mut buf);
        assert!(matches!(result, Err(ParseError::TooLargeHeader { max_size: 32, .. })));
    }

    #[test]
    fn malformed_start_line_is_rejected() {
        let mut buf = BytesMut::from(&b"NOT A REQUEST\r\n\r\n"[..]);
        assert!(RequestHeadDecoder::default().decode(&mut buf).is_err());
    }

    #[test]
    fn http2_version_is_rejected() {
        let mut buf = BytesMut::from(&b"GET / HTTP/2.0\r\n\r\n"[..]);
        assert!(RequestHeadDecoder::default().decode(&mut buf).is_err());
    }

    #[test]
    fn parses_response_head() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\nframe"[..]);
        let (start_line, headers) = ResponseHeadDecoder::default().decode(&mut buf).unwrap().unwrap();

        assert_eq!(start_line.code, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(start_line.reason, "Switching Protocols");
        assert_eq!(start_line.version, Version::HTTP_11);
        assert_eq!(headers.get(header::UPGRADE).unwrap(), "websocket");
        assert_eq!(&buf[..], b"frame");
    }

    #[test]
    fn framing_prefers_chunked() {
        let headers = headers_of(&[("transfer-encoding", "chunked")]);
        assert_eq!(body_framing(&headers, None, u64::MAX).unwrap(), PayloadSize::Chunked);

        let headers = headers_of(&[("transfer-encoding", "Chunked")]);
        assert_eq!(body_framing(&headers, Some(StatusCode::OK), u64::MAX).unwrap(), PayloadSize::Chunked);
    }

    #[test]
    fn framing_rejects_both_length_headers() {
        let headers = headers_of(&[("transfer-encoding", "chunked"), ("content-length", "3")]);
        assert!(matches!(body_framing(&headers, None, u64::MAX), Err(ParseError::InvalidContentLength { .. })));
    }

    #[test]
    fn framing_rejects_unknown_transfer_coding() {
        let headers = headers_of(&[("transfer-encoding", "gzip, chunked")]);
        assert!(matches!(body_framing(&headers, None, u64::MAX), Err(ParseError::UnsupportedTransferEncoding { .. })));
    }

    #[test]
    fn framing_content_length_rules() {
        let headers = headers_of(&[("content-length", "5, 5")]);
        assert_eq!(body_framing(&headers, None, u64::MAX).unwrap(), PayloadSize::Length(5));

        let headers = headers_of(&[("content-length", "5"), ("content-length", "6")]);
        assert!(body_framing(&headers, None, u64::MAX).is_err());

        let headers = headers_of(&[("content-length", "+5")]);
        assert!(body_framing(&headers, None, u64::MAX).is_err());

        let headers = headers_of(&[("content-length", "100")]);
        assert!(matches!(body_framing(&headers, None, 99), Err(ParseError::TooLargeBody { max_size: 99 })));
    }

    #[test]
    fn framing_of_responses_without_length() {
        let headers = HeaderMap::new();
        assert_eq!(body_framing(&headers, Some(StatusCode::OK), u64::MAX).unwrap(), PayloadSize::UntilClose);
        assert_eq!(body_framing(&headers, Some(StatusCode::NO_CONTENT), u64::MAX).unwrap(), PayloadSize::Empty);

        let headers = headers_of(&[("content-length", "4")]);
        assert!(matches!(
            body_framing(&headers, Some(StatusCode::NO_CONTENT), u64::MAX),
            Err(ParseError::UnexpectedBody { .. })
        ));
    }
}
