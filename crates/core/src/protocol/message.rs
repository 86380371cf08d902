use std::borrow::Cow;
use std::time::Instant;

use bytes::Bytes;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::{Method, StatusCode};

/// Protocol version sent unless the server asks for another one.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Header sections larger than this are treated as garbage.
const MAX_HEAD_LEN: usize = 64 * 1024;
const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// First line of an RTSP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `Method SP Request-URI SP RTSP-Version`
    Request { method: Method, uri: String },
    /// `RTSP-Version SP Status-Code SP Reason-Phrase`
    Response { status: StatusCode, reason: String },
}

/// An RTSP request or response (RFC 2326 §4, §6, §7).
///
/// Both directions share one type because a client receives requests too
/// (server-pushed PLAY_NOTIFY, TEARDOWN, SET_PARAMETER) and sends responses
/// to them.
///
/// ```text
/// SETUP rtsp://cam/stream/track1 RTSP/1.0\r\n
/// CSeq: 3\r\n
/// Transport: RTP/AVP;unicast;client_port=10000-10001\r\n
/// \r\n
/// ```
///
/// Header names are compared case-insensitively (RFC 2326 §4.2). Parsed
/// messages keep repeated headers; [`set_header`](Self::set_header) replaces
/// the first existing value. Once a message has been sent its transfer time
/// is recorded; a retransmission clears it and reuses the same `CSeq`.
#[derive(Debug, Clone)]
pub struct Message {
    pub start: StartLine,
    /// Protocol version token (`RTSP/1.0`).
    pub version: String,
    headers: Vec<(String, String)>,
    pub body: Bytes,
    created: Instant,
    transferred: Option<Instant>,
}

/// Outcome of [`Message::parse`].
#[derive(Debug)]
pub enum Parsed {
    /// A complete message and the number of input bytes it consumed.
    Complete(Message, usize),
    /// More bytes are needed.
    Incomplete,
}

impl Message {
    pub fn request(method: Method, uri: impl Into<String>) -> Self {
        Self::new(StartLine::Request {
            method,
            uri: uri.into(),
        })
    }

    pub fn response(status: StatusCode) -> Self {
        Self::new(StartLine::Response {
            status,
            reason: status.reason().to_string(),
        })
    }

    fn new(start: StartLine) -> Self {
        Message {
            start,
            version: RTSP_VERSION.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
            created: Instant::now(),
            transferred: None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    /// Rewrite the request target (redirects). No-op on responses.
    pub fn set_uri(&mut self, new_uri: impl Into<String>) {
        if let StartLine::Request { uri, .. } = &mut self.start {
            *uri = new_uri.into();
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of a repeated header, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Headers in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        let index = self
            .headers
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.headers.remove(index).1)
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// Body as text, lossily decoded.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The CSeq header value, which numbers and orders request/response
    /// pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")?.trim().parse().ok()
    }

    pub fn set_cseq(&mut self, cseq: u32) {
        self.set_header("CSeq", cseq.to_string());
    }

    pub fn clear_cseq(&mut self) {
        self.remove_header("CSeq");
    }

    /// Declared `Content-Length`, or zero.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Whether the body holds everything `Content-Length` announced.
    ///
    /// Messages produced by [`parse`](Self::parse) are always complete;
    /// locally built messages are complete unless a caller set a
    /// `Content-Length` larger than the body.
    pub fn is_complete(&self) -> bool {
        self.body.len() >= self.content_length()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// When the message last finished sending, if it has.
    pub fn transferred(&self) -> Option<Instant> {
        self.transferred
    }

    pub(crate) fn mark_transferred(&mut self) {
        self.transferred = Some(Instant::now());
    }

    pub(crate) fn clear_transferred(&mut self) {
        self.transferred = None;
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// `Content-Length` is always derived from the body (RFC 2326 §12.14);
    /// a stored value is ignored.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = match &self.start {
            StartLine::Request { method, uri } => {
                format!("{} {} {}\r\n", method, uri, self.version)
            }
            StartLine::Response { status, reason } => {
                format!("{} {} {}\r\n", self.version, status.0, reason)
            }
        };

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }

        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Parse one message from the front of `buf`.
    ///
    /// Leading blank lines are skipped and counted as consumed. Returns
    /// [`Parsed::Incomplete`] until the header section and the full body are
    /// available.
    pub fn parse(buf: &[u8]) -> Result<Parsed> {
        let skipped = buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        let rest = &buf[skipped..];
        if rest.is_empty() {
            return Ok(Parsed::Incomplete);
        }

        let Some(head_len) = find_head_end(rest) else {
            if rest.len() > MAX_HEAD_LEN {
                return Err(RtspError::parse(ParseErrorKind::HeaderTooLarge));
            }
            return Ok(Parsed::Incomplete);
        };

        let head = std::str::from_utf8(&rest[..head_len])
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidStartLine))?;
        let mut lines = head.lines();

        let start_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(RtspError::parse(ParseErrorKind::EmptyMessage))?;
        let (start, version) = parse_start_line(start_line)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                // Folded continuation of the previous header.
                let (_, value) = headers
                    .last_mut()
                    .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let colon = line
                .find(':')
                .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;
            headers.push((
                line[..colon].trim().to_string(),
                line[colon + 1..].trim().to_string(),
            ));
        }

        let content_length = match headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
        {
            Some((_, value)) => value
                .parse::<usize>()
                .ok()
                .filter(|&len| len <= MAX_BODY_LEN)
                .ok_or(RtspError::parse(ParseErrorKind::InvalidContentLength))?,
            None => 0,
        };
        let total = head_len
            .checked_add(content_length)
            .ok_or(RtspError::parse(ParseErrorKind::InvalidContentLength))?;

        if rest.len() < total {
            return Ok(Parsed::Incomplete);
        }

        let message = Message {
            start,
            version,
            headers,
            body: Bytes::copy_from_slice(&rest[head_len..total]),
            created: Instant::now(),
            transferred: None,
        };
        Ok(Parsed::Complete(message, skipped + total))
    }
}

/// Offset just past the blank line ending the header section.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

fn is_version_token(token: &str) -> bool {
    token.starts_with("RTSP/") || token.starts_with("HTTP/")
}

fn parse_start_line(line: &str) -> Result<(StartLine, String)> {
    let invalid = || RtspError::parse(ParseErrorKind::InvalidStartLine);

    if is_version_token(line) {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or_else(invalid)?.to_string();
        let code: u16 = parts
            .next()
            .and_then(|c| c.trim().parse().ok())
            .ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or("").trim().to_string();
        return Ok((
            StartLine::Response {
                status: StatusCode(code),
                reason,
            },
            version,
        ));
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 || !is_version_token(parts[2]) {
        return Err(invalid());
    }
    Ok((
        StartLine::Request {
            method: Method::from(parts[0]),
            uri: parts[1].to_string(),
        },
        parts[2].to_string(),
    ))
}
