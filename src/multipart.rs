//! The `multipart/x-mixed-replace` wire format.
//!
//! Every frame is sent as one part:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <image bytes>\r\n
//! ```
//!
//! `FrameChunk` produces parts on the server side; `PartReader` splits a
//! received body back into parts on the client side.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;

/// The boundary token separating parts.
pub const BOUNDARY: &str = "frame";

/// Media type of a stream response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const DELIMITER: &[u8] = b"--frame\r\n";
const BODY_DELIMITER: &[u8] = b"\r\n--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// The image type carried by a part.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
        }
    }

    pub fn from_content_type(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" => Some(ImageKind::Jpeg),
            "image/png" => Some(ImageKind::Png),
            _ => None,
        }
    }
}

/// One encoded image ready to be written to a stream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChunk {
    pub kind: ImageKind,
    pub payload: Bytes,
}

impl FrameChunk {
    pub fn jpeg(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: ImageKind::Jpeg,
            payload: payload.into(),
        }
    }

    pub fn png(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: ImageKind::Png,
            payload: payload.into(),
        }
    }

    /// Serializes the chunk as one multipart part, trailing CRLF included.
    pub fn encode(&self) -> Bytes {
        let header = format!("Content-Type: {}\r\n\r\n", self.kind.content_type());
        let mut out =
            BytesMut::with_capacity(DELIMITER.len() + header.len() + self.payload.len() + 2);
        out.extend_from_slice(DELIMITER);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }
}

/// A part parsed from a multipart body.
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Part {
    /// Raw `Content-Type` header value, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    pub fn kind(&self) -> Option<ImageKind> {
        self.content_type().and_then(ImageKind::from_content_type)
    }
}

/// Incrementally splits a `boundary=frame` body into parts.
///
/// A part is only complete once the next delimiter has arrived, so the
/// last part of a finished body must be collected with `finish`.
#[derive(Debug, Default)]
pub struct PartReader {
    buf: BytesMut,
}

impl PartReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received body bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete part, or `Ok(None)` if more data is needed.
    pub fn next_part(&mut self) -> Result<Option<Part>> {
        self.take_part(false)
    }

    /// Returns the final part once the body has ended.
    pub fn finish(&mut self) -> Result<Option<Part>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match self.take_part(true)? {
            Some(part) => Ok(Some(part)),
            None if self.buf.is_empty() => Ok(None),
            None => bail!("body ended inside a part ({} bytes left)", self.buf.len()),
        }
    }

    fn take_part(&mut self, at_end: bool) -> Result<Option<Part>> {
        // Tolerate blank lines between parts.
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
        }
        if self.buf.len() < DELIMITER.len() {
            return Ok(None);
        }
        if !self.buf.starts_with(DELIMITER) {
            bail!("expected '--{}' boundary at start of part", BOUNDARY);
        }

        let Some(header_len) = find(&self.buf[DELIMITER.len()..], HEADER_END) else {
            return Ok(None);
        };
        let header_start = DELIMITER.len();
        let body_start = header_start + header_len + HEADER_END.len();
        let headers = parse_headers(&self.buf[header_start..header_start + header_len])?;

        let body_end = match find(&self.buf[body_start..], BODY_DELIMITER) {
            Some(len) => body_start + len,
            None if at_end => {
                if !self.buf.ends_with(b"\r\n") || self.buf.len() < body_start + 2 {
                    bail!("final part is not terminated by CRLF");
                }
                self.buf.len() - 2
            }
            None => return Ok(None),
        };

        let mut part = self.buf.split_to(body_end + 2);
        part.advance(body_start);
        part.truncate(part.len() - 2);
        Ok(Some(Part {
            headers,
            body: part.freeze(),
        }))
    }
}

fn parse_headers(raw: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(raw).map_err(|e| anyhow!("part headers are not UTF-8: {}", e))?;
    let mut headers = HashMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed part header: '{}'", line))?;
        headers.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
