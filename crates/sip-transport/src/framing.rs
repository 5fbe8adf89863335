//! SIP message framing.
//!
//! Streams are split on the header terminator plus `Content-Length` (or its
//! compact form `l`). CRLF keep-alives between messages are skipped.
//! Datagrams are one message each and only checked for size.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Header section larger than this without a terminator is rejected
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Body larger than this is rejected
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Accumulates stream bytes and yields complete messages
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
    keep_alives: u64,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held but not yet framed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Number of CRLF keep-alives skipped so far
    pub fn keep_alives(&self) -> u64 {
        self.keep_alives
    }

    /// Returns the next complete message, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        self.skip_keep_alives();
        if self.buf.is_empty() {
            return Ok(None);
        }

        let Some(header_end) = find(&self.buf, HEADER_END) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(Error::MessageTooLarge(self.buf.len()));
            }
            return Ok(None);
        };
        let headers_len = header_end + HEADER_END.len();
        let body_len = content_length(&self.buf[..header_end])?.unwrap_or(0);
        if body_len > MAX_BODY_BYTES {
            return Err(Error::MessageTooLarge(body_len));
        }

        let total = headers_len + body_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        trace!(total, body_len, "framed message");
        Ok(Some(self.buf.split_to(total).freeze()))
    }

    fn skip_keep_alives(&mut self) {
        loop {
            if self.buf.starts_with(b"\r\n") {
                self.buf.advance(2);
                self.keep_alives += 1;
            } else if self.buf.first() == Some(&b'\n') {
                self.buf.advance(1);
            } else {
                return;
            }
        }
    }
}

/// Returns the datagram unless it exceeds `max`
pub fn check_datagram(data: &[u8], max: usize) -> Option<&[u8]> {
    if data.len() > max {
        warn!(len = data.len(), max, "dropping oversized datagram");
        return None;
    }
    let trimmed = trim_leading_crlf(data);
    if trimmed.is_empty() {
        trace!("datagram keep-alive");
        return None;
    }
    Some(trimmed)
}

fn trim_leading_crlf(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .unwrap_or(data.len());
    &data[start..]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses `Content-Length` / `l` from a header block
pub fn content_length(headers: &[u8]) -> Result<Option<usize>> {
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let name = trim(&line[..colon]);
        if name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"l") {
            let value = trim(&line[colon + 1..]);
            let value = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or_else(|| {
                    Error::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "malformed Content-Length",
                    ))
                })?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end.max(start)]
}
