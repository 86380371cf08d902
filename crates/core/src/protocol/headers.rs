//! Typed views over the header values the client acts on.

use std::time::Duration;

use crate::protocol::Method;

/// `Session: <id>[;timeout=<secs>]` (RFC 2326 §12.37).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: Option<Duration>,
}

impl SessionHeader {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let id = parts.next()?.trim();
        if id.is_empty() {
            return None;
        }
        let timeout = parts
            .filter_map(|p| p.trim().strip_prefix("timeout="))
            .find_map(|t| t.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Some(SessionHeader {
            id: id.to_string(),
            timeout,
        })
    }
}

/// Normal play time range, `npt=<start>-[<end>]` (RFC 2326 §3.6, §12.29).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NptRange {
    pub start: Option<Duration>,
    pub end: Option<Duration>,
}

impl NptRange {
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value
            .split(';')
            .map(str::trim)
            .find_map(|p| p.strip_prefix("npt="))?;
        let (start, end) = spec.split_once('-')?;
        Some(NptRange {
            start: parse_npt_time(start),
            end: parse_npt_time(end),
        })
    }

    /// Header value for a PLAY request.
    pub fn to_header(&self) -> String {
        let start = self.start.map(format_npt).unwrap_or_else(|| "0.000".to_string());
        match self.end {
            Some(end) => format!("npt={}-{}", start, format_npt(end)),
            None => format!("npt={}-", start),
        }
    }
}

/// `now`, plain seconds, or `hh:mm:ss[.frac]`.
fn parse_npt_time(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("now") {
        return None;
    }
    let mut seconds = 0f64;
    for part in value.split(':') {
        seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
    }
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn format_npt(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

/// One stream entry of an `RTP-Info` header (RFC 2326 §12.33).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpInfo {
    pub url: Option<String>,
    pub seq: Option<u16>,
    pub rtptime: Option<u32>,
    pub ssrc: Option<u32>,
}

impl RtpInfo {
    /// Parse `url=..;seq=..;rtptime=.., url=..;seq=..`.
    pub fn parse_list(value: &str) -> Vec<RtpInfo> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let mut info = RtpInfo::default();
                for param in entry.split(';') {
                    let Some((key, val)) = param.trim().split_once('=') else {
                        continue;
                    };
                    let val = val.trim();
                    match key.trim().to_ascii_lowercase().as_str() {
                        "url" => info.url = Some(val.trim_matches('"').to_string()),
                        "seq" => info.seq = val.parse().ok(),
                        "rtptime" => info.rtptime = val.parse().ok(),
                        "ssrc" => info.ssrc = u32::from_str_radix(val, 16).ok(),
                        _ => {}
                    }
                }
                info
            })
            .collect()
    }
}

/// Methods listed in a `Public` or `Allow` header.
pub fn parse_method_list(value: &str) -> Vec<Method> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(Method::from)
        .collect()
}

/// Leading numeric code of an `X-Notice` header, e.g. `2101 "End-of-Stream Reached"`.
pub fn notice_code(value: &str) -> Option<u32> {
    value.split_whitespace().next()?.parse().ok()
}

/// `X-Notice` code servers send when a stream finishes.
pub const NOTICE_END_OF_STREAM: u32 = 2101;

/// Vendor `X-` header.
pub fn is_extension_header(name: &str) -> bool {
    name.len() > 2 && name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("x-"))
}
