//! Multipart bodies for attachment transfer.
//!
//! `open_revs` responses arrive as `multipart/mixed`, with one part per
//! revision; a revision carrying attachments is itself a nested
//! `multipart/related` whose first part is the document JSON and whose
//! remaining parts are the attachment bodies, in `_attachments` order.
//! Pushing a document with large attachments uses the same
//! `multipart/related` layout.

use crate::error::{ProtocolError, ProtocolResult};
use std::io::Write;
use uuid::Uuid;

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    /// Part headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Raw part body.
    pub body: Vec<u8>,
}

impl MultipartPart {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The part's `Content-Type`, defaulting to JSON as the protocol does.
    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or("application/json")
    }

    /// Whether this part is itself a nested multipart body.
    pub fn is_multipart(&self) -> bool {
        self.content_type().starts_with("multipart/")
    }
}

/// Extracts the `boundary` parameter from a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

/// Parses a multipart body into its parts.
pub fn parse_multipart(body: &[u8], boundary: &str) -> ProtocolResult<Vec<MultipartPart>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut pos = find(body, delimiter, 0)
        .ok_or_else(|| ProtocolError::multipart("missing opening boundary"))?;

    loop {
        pos += delimiter.len();
        // Closing delimiter is "--boundary--".
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        let segment_start = skip_line_break(body, pos)
            .ok_or_else(|| ProtocolError::multipart("boundary not followed by line break"))?;
        let segment_end = find(body, delimiter, segment_start)
            .ok_or_else(|| ProtocolError::multipart("unterminated part"))?;
        let segment = trim_trailing_line_break(&body[segment_start..segment_end]);
        parts.push(parse_part(segment)?);
        pos = segment_end;
    }
}

fn parse_part(segment: &[u8]) -> ProtocolResult<MultipartPart> {
    let (header_bytes, body) = split_headers(segment)
        .ok_or_else(|| ProtocolError::multipart("part missing header separator"))?;
    let header_text = std::str::from_utf8(header_bytes)
        .map_err(|_| ProtocolError::multipart("part headers are not UTF-8"))?;

    let mut headers = Vec::new();
    for line in header_text.lines() {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::multipart(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(MultipartPart {
        headers,
        body: body.to_vec(),
    })
}

fn split_headers(segment: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(i) = find(segment, b"\r\n\r\n", 0) {
        return Some((&segment[..i], &segment[i + 4..]));
    }
    if let Some(i) = find(segment, b"\n\n", 0) {
        return Some((&segment[..i], &segment[i + 2..]));
    }
    // A part with no headers at all: a single leading line break.
    if segment.starts_with(b"\r\n") {
        return Some((&[], &segment[2..]));
    }
    None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn skip_line_break(body: &[u8], pos: usize) -> Option<usize> {
    if body[pos..].starts_with(b"\r\n") {
        Some(pos + 2)
    } else if body[pos..].starts_with(b"\n") {
        Some(pos + 1)
    } else {
        None
    }
}

fn trim_trailing_line_break(segment: &[u8]) -> &[u8] {
    if segment.ends_with(b"\r\n") {
        &segment[..segment.len() - 2]
    } else if segment.ends_with(b"\n") {
        &segment[..segment.len() - 1]
    } else {
        segment
    }
}

/// Builds a `multipart/related` body: a JSON document part followed by
/// attachment body parts.
pub struct MultipartWriter {
    boundary: String,
    buffer: Vec<u8>,
}

impl MultipartWriter {
    /// Creates a writer with a fresh random boundary.
    pub fn new() -> Self {
        Self {
            boundary: Uuid::new_v4().simple().to_string(),
            buffer: Vec::new(),
        }
    }

    /// The `Content-Type` header value for the assembled body.
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary=\"{}\"", self.boundary)
    }

    /// Appends a part.
    pub fn add_part(&mut self, content_type: &str, body: &[u8]) {
        // Writes to a Vec cannot fail.
        let _ = write!(self.buffer, "--{}\r\n", self.boundary);
        let _ = write!(self.buffer, "Content-Type: {content_type}\r\n");
        let _ = write!(self.buffer, "Content-Length: {}\r\n\r\n", body.len());
        self.buffer.extend_from_slice(body);
        self.buffer.extend_from_slice(b"\r\n");
    }

    /// Appends the JSON document part. Must be the first part added.
    pub fn add_json(&mut self, json: &[u8]) {
        self.add_part("application/json", json);
    }

    /// Finishes the body, appending the closing delimiter.
    pub fn finish(mut self) -> Vec<u8> {
        let _ = write!(self.buffer, "--{}--\r\n", self.boundary);
        self.buffer
    }
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}
