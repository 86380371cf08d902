//! Error types for the RTSP client library.

use std::fmt;

use crate::protocol::Message;

/// Errors that can occur in the RTSP client library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Connection**: [`Io`](Self::Io), [`Transport`](Self::Transport),
///   [`Timeout`](Self::Timeout).
/// - **Protocol**: [`Parse`](Self::Parse), [`Protocol`](Self::Protocol),
///   [`MethodNotSupported`](Self::MethodNotSupported).
/// - **Session**: [`Negotiation`](Self::Negotiation),
///   [`SessionNotFound`](Self::SessionNotFound),
///   [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Credentials**: [`Authentication`](Self::Authentication).
/// - **Frames**: [`Consistency`](Self::Consistency).
/// - **Lifecycle**: [`Closed`](Self::Closed).
///
/// Faults raised while handling a specific exchange carry the message that
/// precipitated them; see [`message`](Self::message).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The control connection failed (refused, reset, aborted) while a
    /// request was being exchanged.
    #[error("transport fault: {message}")]
    Transport {
        message: String,
        request: Option<Box<Message>>,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The server answered with something the client cannot act on.
    #[error("protocol fault: {message}")]
    Protocol {
        message: String,
        context: Option<Box<Message>>,
    },

    /// SETUP could not produce a usable transport, even after compensating.
    #[error("negotiation fault: {message}")]
    Negotiation {
        message: String,
        response: Option<Box<Message>>,
    },

    /// Retry budget exhausted without a correlated response.
    #[error("no response for CSeq {cseq} after {attempts} attempts")]
    Timeout {
        cseq: u32,
        attempts: u32,
        request: Box<Message>,
    },

    /// Credentials were rejected or the challenge cannot be answered.
    #[error("authentication fault: {message}")]
    Authentication {
        message: String,
        response: Option<Box<Message>>,
    },

    /// A packet does not belong in the frame it was offered to.
    #[error("frame consistency fault: {kind} (sequence number {sequence_number})")]
    Consistency {
        kind: ConsistencyKind,
        sequence_number: u16,
    },

    /// The client or frame was closed before or during the operation.
    #[error("resource closed")]
    Closed,

    /// Failed to parse an RTSP message, RTP packet or header value.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The target locator is not a usable `rtsp://` (or `rtspu://`, `http://`) URL.
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    /// No session with the given ID exists in the [`SessionRegistry`](crate::session::SessionRegistry).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Local UDP port probing ran past 65534 without finding a free pair.
    #[error("port range exhausted (no free local port pair)")]
    PortRangeExhausted,

    /// The server reported the method as not implemented.
    #[error("method not supported by server: {0}")]
    MethodNotSupported(String),
}

impl RtspError {
    /// The message that precipitated this fault, if any.
    ///
    /// Depending on the variant this is the request that went unanswered or
    /// the response the client could not act on.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Transport { request, .. } => request.as_deref(),
            Self::Protocol { context, .. } => context.as_deref(),
            Self::Negotiation { response, .. } | Self::Authentication { response, .. } => {
                response.as_deref()
            }
            Self::Timeout { request, .. } => Some(request.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }

    pub(crate) fn protocol(message: impl Into<String>, context: Option<&Message>) -> Self {
        Self::Protocol {
            message: message.into(),
            context: context.map(|m| Box::new(m.clone())),
        }
    }

    pub(crate) fn negotiation(message: impl Into<String>, response: Option<&Message>) -> Self {
        Self::Negotiation {
            message: message.into(),
            response: response.map(|m| Box::new(m.clone())),
        }
    }

    pub(crate) fn authentication(message: impl Into<String>, response: Option<&Message>) -> Self {
        Self::Authentication {
            message: message.into(),
            response: response.map(|m| Box::new(m.clone())),
        }
    }

    pub(crate) fn transport(
        message: impl Into<String>,
        request: Option<&Message>,
        source: Option<std::io::Error>,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            request: request.map(|m| Box::new(m.clone())),
            source,
        }
    }
}

/// Specific kind of parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Start line was neither `Method URI Version` nor `Version Status Reason`.
    InvalidStartLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number, or the head was not UTF-8.
    InvalidContentLength,
    /// Header section grew past the limit without a terminating blank line.
    HeaderTooLarge,
    /// RTP packet shorter than its header, or not version 2.
    InvalidRtpPacket,
    /// `Transport` header value could not be interpreted.
    InvalidTransport,
    /// `WWW-Authenticate` / `Authorization` value could not be interpreted.
    InvalidChallenge,
    /// Session description (SDP) line was malformed.
    InvalidDescription,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::HeaderTooLarge => write!(f, "header section too large"),
            Self::InvalidRtpPacket => write!(f, "invalid RTP packet"),
            Self::InvalidTransport => write!(f, "invalid transport specification"),
            Self::InvalidChallenge => write!(f, "invalid authentication challenge"),
            Self::InvalidDescription => write!(f, "invalid session description"),
        }
    }
}

/// Why a packet was refused by a [`Frame`](crate::media::Frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyKind {
    /// SSRC differs from the frame's.
    SsrcMismatch,
    /// Timestamp differs from the frame's.
    TimestampMismatch,
    /// Payload type differs and multiple payload types are not allowed.
    PayloadTypeMismatch,
    /// A packet with the same sequence number is already stored.
    Duplicate,
    /// The frame already holds a marker packet.
    AfterMarker,
    /// The frame holds its maximum number of packets.
    FrameFull,
}

impl fmt::Display for ConsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsrcMismatch => write!(f, "SSRC mismatch"),
            Self::TimestampMismatch => write!(f, "timestamp mismatch"),
            Self::PayloadTypeMismatch => write!(f, "payload type mismatch"),
            Self::Duplicate => write!(f, "duplicate packet"),
            Self::AfterMarker => write!(f, "packet after marker"),
            Self::FrameFull => write!(f, "frame full"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
