use std::fmt;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Lower transport named in the protocol token (`RTP/AVP/TCP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LowerTransport {
    #[default]
    Udp,
    Tcp,
}

/// One transport specification from a `Transport` header (RFC 2326 §12.39).
///
/// The client builds one as its offer and parses the server's answer into
/// another.
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=10000-10001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=10000-10001;server_port=5000-5001;ssrc=1A2B3C4D
/// ```
///
/// ```
/// use rtsp::session::transport::TransportHeader;
///
/// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
/// assert_eq!(th.interleaved, Some((2, Some(3))));
///
/// assert!(TransportHeader::parse("").is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeader {
    /// `RTP/AVP`, `RTP/SAVP`, ...
    pub profile: String,
    pub lower: LowerTransport,
    pub multicast: bool,
    pub destination: Option<String>,
    pub source: Option<String>,
    /// Client RTP port and, unless RTCP is muxed or absent, RTCP port.
    pub client_port: Option<(u16, Option<u16>)>,
    pub server_port: Option<(u16, Option<u16>)>,
    /// Multicast port pair.
    pub port: Option<(u16, Option<u16>)>,
    pub interleaved: Option<(u8, Option<u8>)>,
    pub ttl: Option<u8>,
    pub ssrc: Option<u32>,
    pub mode: Option<String>,
    pub rtcp_mux: bool,
}

impl TransportHeader {
    /// Offer for RTP interleaved on the control connection.
    pub fn interleaved(data: u8, control: Option<u8>) -> Self {
        TransportHeader {
            profile: "RTP/AVP".to_string(),
            lower: LowerTransport::Tcp,
            interleaved: Some((data, control)),
            rtcp_mux: control == Some(data),
            ..Default::default()
        }
    }

    /// Offer for unicast UDP on local ports.
    pub fn udp(rtp: u16, rtcp: Option<u16>) -> Self {
        TransportHeader {
            profile: "RTP/AVP".to_string(),
            client_port: Some((rtp, rtcp)),
            rtcp_mux: rtcp == Some(rtp),
            ..Default::default()
        }
    }

    /// Parse the first specification of a `Transport` value.
    pub fn parse(value: &str) -> Result<Self> {
        Self::parse_list(value)?
            .into_iter()
            .next()
            .ok_or(RtspError::parse(ParseErrorKind::InvalidTransport))
    }

    /// Parse every comma-separated alternative.
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        let specs: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if specs.is_empty() {
            return Err(RtspError::parse(ParseErrorKind::InvalidTransport));
        }
        specs.into_iter().map(Self::parse_one).collect()
    }

    fn parse_one(spec: &str) -> Result<Self> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidTransport);
        let mut parts = spec.split(';').map(str::trim);

        let protocol = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let tokens: Vec<&str> = protocol.split('/').collect();
        if tokens.len() < 2 {
            return Err(invalid());
        }
        let mut header = TransportHeader {
            profile: format!("{}/{}", tokens[0], tokens[1]),
            lower: match tokens.get(2) {
                Some(lower) if lower.eq_ignore_ascii_case("TCP") => LowerTransport::Tcp,
                _ => LowerTransport::Udp,
            },
            ..Default::default()
        };

        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
                None => (part, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("unicast", None) => header.multicast = false,
                ("multicast", None) => header.multicast = true,
                ("rtcp-mux", None) => header.rtcp_mux = true,
                ("destination", Some(v)) => header.destination = Some(v.to_string()),
                ("source", Some(v)) => header.source = Some(v.to_string()),
                ("client_port", Some(v)) => header.client_port = Some(port_pair(v).ok_or_else(invalid)?),
                ("server_port", Some(v)) => header.server_port = Some(port_pair(v).ok_or_else(invalid)?),
                ("port", Some(v)) => header.port = Some(port_pair(v).ok_or_else(invalid)?),
                ("interleaved", Some(v)) => {
                    let (data, control) = port_pair(v).ok_or_else(invalid)?;
                    let data = u8::try_from(data).map_err(|_| invalid())?;
                    let control = control
                        .map(|c| u8::try_from(c).map_err(|_| invalid()))
                        .transpose()?;
                    header.interleaved = Some((data, control));
                }
                ("ttl", Some(v)) => header.ttl = v.parse().ok(),
                ("ssrc", Some(v)) => {
                    let first = v.split('/').next().unwrap_or(v);
                    header.ssrc = u32::from_str_radix(first, 16).ok();
                }
                ("mode", Some(v)) => header.mode = Some(v.to_string()),
                _ => {}
            }
        }

        Ok(header)
    }
}

/// `a-b` or `a`.
fn port_pair(value: &str) -> Option<(u16, Option<u16>)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, Some(b.trim().parse().ok()?))),
        None => Some((value.trim().parse().ok()?, None)),
    }
}

fn write_pair<T: fmt::Display + PartialEq>(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    (first, second): &(T, Option<T>),
) -> fmt::Result {
    match second {
        Some(second) => write!(f, ";{}={}-{}", name, first, second),
        None => write!(f, ";{}={}", name, first),
    }
}

impl fmt::Display for TransportHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.profile)?;
        if self.lower == LowerTransport::Tcp {
            f.write_str("/TCP")?;
        }
        f.write_str(if self.multicast { ";multicast" } else { ";unicast" })?;
        if let Some(destination) = &self.destination {
            write!(f, ";destination={}", destination)?;
        }
        if let Some(source) = &self.source {
            write!(f, ";source={}", source)?;
        }
        if let Some(pair) = &self.interleaved {
            write_pair(f, "interleaved", pair)?;
        }
        if let Some(pair) = &self.client_port {
            write_pair(f, "client_port", pair)?;
        }
        if let Some(pair) = &self.server_port {
            write_pair(f, "server_port", pair)?;
        }
        if let Some(pair) = &self.port {
            write_pair(f, "port", pair)?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={}", ttl)?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={:08X}", ssrc)?;
        }
        if let Some(mode) = &self.mode {
            write!(f, ";mode={}", mode)?;
        }
        if self.rtcp_mux {
            f.write_str(";RTCP-mux")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unicast_udp_answer() {
        let th = TransportHeader::parse(
            "RTP/AVP;unicast;client_port=10000-10001;server_port=5000-5001;ssrc=1A2B3C4D;mode=\"PLAY\"",
        )
        .unwrap();
        assert_eq!(th.lower, LowerTransport::Udp);
        assert!(!th.multicast);
        assert_eq!(th.client_port, Some((10000, Some(10001))));
        assert_eq!(th.server_port, Some((5000, Some(5001))));
        assert_eq!(th.ssrc, Some(0x1A2B3C4D));
        assert_eq!(th.mode.as_deref(), Some("PLAY"));
    }

    #[test]
    fn parse_multicast_answer() {
        let th = TransportHeader::parse(
            "RTP/AVP;multicast;destination=232.0.1.2;port=6000-6001;ttl=16",
        )
        .unwrap();
        assert!(th.multicast);
        assert_eq!(th.destination.as_deref(), Some("232.0.1.2"));
        assert_eq!(th.port, Some((6000, Some(6001))));
        assert_eq!(th.ttl, Some(16));
    }

    #[test]
    fn first_alternative_wins() {
        let th = TransportHeader::parse("RTP/AVP/TCP;interleaved=0-1, RTP/AVP;client_port=1-2").unwrap();
        assert_eq!(th.lower, LowerTransport::Tcp);
        assert_eq!(TransportHeader::parse_list("RTP/AVP/TCP;interleaved=0-1, RTP/AVP;client_port=1-2").unwrap().len(), 2);
    }

    #[test]
    fn offers_serialize() {
        assert_eq!(
            TransportHeader::interleaved(2, Some(3)).to_string(),
            "RTP/AVP/TCP;unicast;interleaved=2-3"
        );
        assert_eq!(
            TransportHeader::udp(10000, Some(10000)).to_string(),
            "RTP/AVP;unicast;client_port=10000-10000;RTCP-mux"
        );
        assert_eq!(
            TransportHeader::udp(10002, None).to_string(),
            "RTP/AVP;unicast;client_port=10002"
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(TransportHeader::parse("RTP").is_err());
        assert!(TransportHeader::parse("RTP/AVP/TCP;interleaved=300-301").is_err());
        assert!(TransportHeader::parse("RTP/AVP;client_port=abc").is_err());
    }
}
