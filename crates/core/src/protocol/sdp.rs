//! SDP (Session Description Protocol) reading (RFC 4566 / RFC 8866).
//!
//! Only what the client needs to drive SETUP and PLAY is extracted from a
//! DESCRIBE body:
//!
//! ```text
//! v=0
//! o=- 0 0 IN IP4 192.168.1.100
//! s=Stream
//! a=control:*                                   ← aggregate control URL
//! a=range:npt=0-120.5                           ← presentation length
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=rtcp-mux                                    ← RTP and RTCP share a port
//! a=control:track1                              ← track control URL
//! ```
//!
//! Everything else is kept as raw attribute lines for callers that want it.

use url::Url;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::headers::NptRange;

/// A parsed session description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDescription {
    pub session_name: Option<String>,
    /// Session-level `a=control`.
    pub control: Option<String>,
    /// Session-level `a=range`.
    pub range: Option<NptRange>,
    pub media: Vec<MediaDescription>,
}

/// One `m=` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaDescription {
    /// `video`, `audio`, `application`, ...
    pub kind: String,
    pub port: u16,
    /// Transport protocol token, e.g. `RTP/AVP`.
    pub protocol: String,
    pub formats: Vec<String>,
    pub control: Option<String>,
    pub rtcp_mux: bool,
    /// From `a=rtpmap`: payload type, encoding name, clock rate.
    pub rtpmap: Option<(u8, String, u32)>,
    pub range: Option<NptRange>,
    /// Every other `a=` line, without the prefix.
    pub attributes: Vec<String>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self> {
        let mut description = SessionDescription::default();

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .filter(|(k, _)| k.len() == 1)
                .ok_or(RtspError::parse(ParseErrorKind::InvalidDescription))?;

            match kind {
                "m" => description.media.push(MediaDescription::from_media_line(value)?),
                "s" => description.session_name = Some(value.to_string()),
                "a" => match description.media.last_mut() {
                    Some(media) => media.apply_attribute(value),
                    None => {
                        if let Some(control) = value.strip_prefix("control:") {
                            description.control = Some(control.trim().to_string());
                        } else if let Some(range) = value.strip_prefix("range:") {
                            description.range = NptRange::parse(range);
                        }
                    }
                },
                _ => {}
            }
        }

        tracing::debug!(media = description.media.len(), "parsed session description");
        Ok(description)
    }

    /// Location for aggregate requests (PLAY/PAUSE/TEARDOWN on the whole
    /// presentation).
    pub fn aggregate_control(&self, base: &Url) -> Url {
        resolve_control(self.control.as_deref(), base)
    }
}

impl MediaDescription {
    fn from_media_line(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let invalid = || RtspError::parse(ParseErrorKind::InvalidDescription);
        let kind = parts.next().ok_or_else(invalid)?.to_string();
        let port = parts
            .next()
            .and_then(|p| p.split('/').next())
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let protocol = parts.next().ok_or_else(invalid)?.to_string();
        Ok(MediaDescription {
            kind,
            port,
            protocol,
            formats: parts.map(str::to_string).collect(),
            ..Default::default()
        })
    }

    fn apply_attribute(&mut self, value: &str) {
        if let Some(control) = value.strip_prefix("control:") {
            self.control = Some(control.trim().to_string());
        } else if value == "rtcp-mux" {
            self.rtcp_mux = true;
        } else if let Some(range) = value.strip_prefix("range:") {
            self.range = NptRange::parse(range);
        } else if let Some(map) = value.strip_prefix("rtpmap:") {
            self.rtpmap = parse_rtpmap(map);
        } else {
            self.attributes.push(value.to_string());
        }
    }

    /// First payload type listed on the `m=` line.
    pub fn payload_type(&self) -> Option<u8> {
        self.formats.first().and_then(|f| f.parse().ok())
    }

    pub fn clock_rate(&self) -> Option<u32> {
        self.rtpmap.as_ref().map(|(_, _, rate)| *rate)
    }

    /// Location SETUP is sent to for this media.
    pub fn control_url(&self, base: &Url) -> Url {
        resolve_control(self.control.as_deref(), base)
    }
}

/// `96 H264/90000[/channels]`
fn parse_rtpmap(value: &str) -> Option<(u8, String, u32)> {
    let (pt, encoding) = value.split_once(' ')?;
    let mut parts = encoding.trim().split('/');
    let name = parts.next()?.to_string();
    let rate = parts.next()?.parse().ok()?;
    Some((pt.trim().parse().ok()?, name, rate))
}

/// Resolve a control attribute against the content base (RFC 2326 §C.1.1).
///
/// `*` and a missing attribute both mean the base itself.
fn resolve_control(control: Option<&str>, base: &Url) -> Url {
    match control {
        None | Some("*") | Some("") => base.clone(),
        Some(control) => match Url::parse(control) {
            Ok(absolute) => absolute,
            Err(_) => {
                let mut base = base.clone();
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }
                base.join(control).unwrap_or(base)
            }
        },
    }
}
