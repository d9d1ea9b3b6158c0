//! Query string splitting. Zero-copy, no percent-decoding.

use crate::errors::ParseError;
use memchr::memchr;

/// Splits a query string into `(key, value)` pairs in source order.
///
/// Handles a leading `?`, bare flags (`debug`), empty values (`name=`),
/// empty keys (`=v`), and empty pairs (`&&`). Values stay raw bytes;
/// percent sequences are not decoded.
#[inline]
pub(crate) fn parse_pairs(query: &[u8], limit: usize) -> Result<Vec<(&[u8], &[u8])>, ParseError> {
    let data = match query.first() {
        Some(b'?') => &query[1..],
        _ => query,
    };

    let mut pairs = Vec::new();
    let mut start = 0;

    while start < data.len() {
        if pairs.len() >= limit {
            return Err(ParseError::TooManyQueryPairs);
        }

        let end = memchr(b'&', &data[start..])
            .map(|pos| start + pos)
            .unwrap_or(data.len());

        let split = memchr(b'=', &data[start..end])
            .map(|pos| start + pos)
            .unwrap_or(end);

        let key = &data[start..split];
        let value = match split < end {
            true => &data[split + 1..end],
            false => &b""[..],
        };

        pairs.push((key, value));
        start = end + 1;
    }

    Ok(pairs)
}
