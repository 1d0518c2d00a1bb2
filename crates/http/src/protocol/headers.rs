//! Helpers for comma separated header values.

use http::HeaderMap;
use http::header::{AsHeaderName, TRANSFER_ENCODING};

/// Iterates over the comma separated tokens of every value of `name`, trimmed.
///
/// Values that are not visible ASCII are skipped.
pub fn header_tokens<K: AsHeaderName>(headers: &HeaderMap, name: K) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// True when any value of `name` lists `token`, compared case-insensitively.
pub fn contains_token<K: AsHeaderName>(headers: &HeaderMap, name: K, token: &str) -> bool {
    header_tokens(headers, name).any(|candidate| candidate.eq_ignore_ascii_case(token))
}

/// True when the last transfer coding applied is `chunked`.
pub fn is_chunked(headers: &HeaderMap) -> bool {
    header_tokens(headers, TRANSFER_ENCODING).last().is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}
