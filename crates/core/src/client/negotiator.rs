//! SETUP: offer a transport, compensate for refusals, bind the result.
//!
//! ```text
//! offer (interleaved channels | UDP port pair | single UDP port)
//!   → SETUP
//!   → 461 Unsupported Transport  → offer interleaved, once
//!   → 454 Session Not Found      → forget the session id, once
//!   → 2xx                        → TransportContext bound into a Session
//! ```

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use url::Url;

use super::config::ClientConfig;
use super::engine::TransactionEngine;
use crate::error::{Result, RtspError};
use crate::protocol::headers::SessionHeader;
use crate::protocol::{MediaDescription, Message, Method, StatusCode};
use crate::session::{Session, SessionRegistry, TransportHeader};
use crate::transport::udp::{bind_rtp_ports, join_multicast};
use crate::transport::{ContextBinding, ContextTable, MediaTransport, TransportContext};

/// Adjustment made after SETUP was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compensation {
    Interleave,
    ForgetSession,
}

/// Result of a successful SETUP.
#[derive(Debug)]
pub struct Negotiated {
    pub session: Arc<Session>,
    pub context: Arc<TransportContext>,
    /// Transport actually in use; differs from the one asked for after a
    /// 461 compensation.
    pub transport: MediaTransport,
    pub response: Message,
}

/// What the client put in the `Transport` header, plus the sockets reserved
/// for it.
struct Offer {
    header: TransportHeader,
    sockets: Option<(UdpSocket, Option<UdpSocket>)>,
}

impl Offer {
    fn build(
        transport: MediaTransport,
        media: &MediaDescription,
        contexts: &ContextTable,
        config: &ClientConfig,
    ) -> Result<Offer> {
        match transport {
            MediaTransport::Interleaved => {
                let (data, control) = contexts.next_channels(media.rtcp_mux)?;
                Ok(Offer {
                    header: TransportHeader::interleaved(data, control),
                    sockets: None,
                })
            }
            MediaTransport::Udp => {
                let first = contexts.next_port(config.first_udp_port);
                let (rtp, rtcp) = bind_rtp_ports(first, !media.rtcp_mux)?;
                let rtp_port = rtp.local_addr()?.port();
                let rtcp_port = match &rtcp {
                    Some(socket) => Some(socket.local_addr()?.port()),
                    None => Some(rtp_port),
                };
                Ok(Offer {
                    header: TransportHeader::udp(rtp_port, rtcp_port),
                    sockets: Some((rtp, rtcp)),
                })
            }
            MediaTransport::Raw => {
                let first = contexts.next_port(config.first_udp_port);
                let (rtp, _) = bind_rtp_ports(first, false)?;
                let rtp_port = rtp.local_addr()?.port();
                Ok(Offer {
                    header: TransportHeader::udp(rtp_port, None),
                    sockets: Some((rtp, None)),
                })
            }
        }
    }
}

/// SETUP one media stream at `control`, starting with the `preferred`
/// transport.
pub(crate) fn setup(
    engine: &mut TransactionEngine,
    config: &ClientConfig,
    contexts: &ContextTable,
    sessions: &SessionRegistry,
    media: &MediaDescription,
    control: &Url,
    preferred: MediaTransport,
) -> Result<Negotiated> {
    let mut transport = preferred;
    let mut applied: Vec<Compensation> = Vec::new();

    loop {
        let offer = Offer::build(transport, media, contexts, config)?;
        let mut request = Message::request(Method::Setup, control.as_str())
            .with_header("Transport", offer.header.to_string());
        if let Some(blocksize) = config.blocksize {
            request.set_header("Blocksize", blocksize.to_string());
        }
        if !config.require.is_empty() {
            request.set_header("Require", config.require.join(", "));
        }
        tracing::debug!(control = %control, transport = %offer.header, "SETUP");

        let response = engine.transact(request)?;
        let status = response.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_success() {
            return bind(engine, config, contexts, sessions, media, control, transport, offer, response);
        }

        let compensation = match status {
            StatusCode::UNSUPPORTED_TRANSPORT
                if transport != MediaTransport::Interleaved && !applied.contains(&Compensation::Interleave) =>
            {
                Compensation::Interleave
            }
            StatusCode::SESSION_NOT_FOUND
                if engine.session().is_some() && !applied.contains(&Compensation::ForgetSession) =>
            {
                Compensation::ForgetSession
            }
            _ => {
                return Err(RtspError::negotiation(
                    format!("SETUP {} refused: {} {}", control, status.0, status.reason()),
                    Some(&response),
                ));
            }
        };

        tracing::info!(?compensation, control = %control, status = status.0, "retrying SETUP");
        match compensation {
            Compensation::Interleave => transport = MediaTransport::Interleaved,
            Compensation::ForgetSession => engine.clear_session(),
        }
        applied.push(compensation);
    }
}

#[allow(clippy::too_many_arguments)]
fn bind(
    engine: &TransactionEngine,
    config: &ClientConfig,
    contexts: &ContextTable,
    sessions: &SessionRegistry,
    media: &MediaDescription,
    control: &Url,
    transport: MediaTransport,
    offer: Offer,
    response: Message,
) -> Result<Negotiated> {
    if let Some(blocksize) = response.header("Blocksize") {
        let blocksize: usize = blocksize.trim().parse().unwrap_or(0);
        if blocksize > config.buffer_size {
            return Err(RtspError::negotiation(
                format!("blocksize {} exceeds receive buffer {}", blocksize, config.buffer_size),
                Some(&response),
            ));
        }
    }

    let session = response
        .header("Session")
        .and_then(SessionHeader::parse)
        .ok_or_else(|| RtspError::negotiation("SETUP answer without Session", Some(&response)))?;
    let answer = match response.header("Transport") {
        Some(value) => TransportHeader::parse(value)?,
        None => offer.header.clone(),
    };

    let binding = match (offer.sockets, answer.multicast) {
        (_, true) => {
            let group: IpAddr = answer
                .destination
                .as_deref()
                .and_then(|d| d.parse().ok())
                .ok_or_else(|| RtspError::negotiation("multicast answer without group", Some(&response)))?;
            let (port, rtcp_port) = answer
                .port
                .or(answer.client_port)
                .ok_or_else(|| RtspError::negotiation("multicast answer without port", Some(&response)))?;
            let rtp = join_multicast(group, port, answer.ttl)?;
            let rtcp = match rtcp_port.filter(|p| *p != port) {
                Some(p) => Some(join_multicast(group, p, answer.ttl)?),
                None => None,
            };
            ContextBinding::Multicast {
                rtp,
                rtcp,
                group,
                ttl: answer.ttl,
            }
        }
        (Some((rtp, rtcp)), false) => {
            let peer = engine.peer_addr().map(|a| a.ip());
            let remote = |port: u16| peer.map(|ip| SocketAddr::new(ip, port));
            let (remote_rtp, remote_rtcp) = match answer.server_port {
                Some((rtp_port, rtcp_port)) => (remote(rtp_port), rtcp_port.and_then(remote)),
                None => (None, None),
            };
            ContextBinding::Udp {
                rtp,
                rtcp,
                remote_rtp,
                remote_rtcp,
            }
        }
        (None, false) => {
            let (data, control) = answer
                .interleaved
                .or(offer.header.interleaved)
                .ok_or_else(|| RtspError::negotiation("interleaved answer without channels", Some(&response)))?;
            ContextBinding::Interleaved { data, control }
        }
    };

    let context = Arc::new(TransportContext::new(
        control.to_string(),
        media.clone(),
        binding,
        rand::random::<u32>(),
        (config.depacketizer)(media),
        config.max_pending_frames,
        config.receive_interval,
    ));
    if let Some(ssrc) = answer.ssrc {
        context.set_remote_ssrc(ssrc);
    }
    if let Some(range) = media.range {
        context.set_range(range.start, range.end);
    }

    if let Some(previous) = contexts.by_control(control.as_str()) {
        for session in sessions.all() {
            session.unbind(&previous);
        }
        contexts.remove(&previous);
    }
    contexts.add(context.clone());

    let timeout = session.timeout.unwrap_or(config.session_timeout);
    let (session, created) = sessions.register(&session.id, control.as_str(), timeout, config.keep_alive);
    if !created {
        session.set_timeout(timeout);
    }
    session.bind(context.clone());
    session.touch();

    tracing::info!(
        session_id = %session.id,
        control = %control,
        ?transport,
        channels = ?context.channels(),
        local_ports = ?context.local_ports(),
        "stream set up"
    );
    Ok(Negotiated {
        session,
        context,
        transport,
        response,
    })
}
