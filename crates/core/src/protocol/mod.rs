//! RTSP protocol implementation (RFC 2326), client side.
//!
//! This module handles the text-based RTSP signaling protocol: building
//! requests, parsing responses and server-pushed requests, authentication,
//! and reading session descriptions.
//!
//! ## Exchange shape (RFC 2326 §4, §6, §7)
//!
//! Requests and responses share HTTP/1.1 framing and are paired by `CSeq`:
//!
//! ```text
//! SETUP rtsp://cam/live/trackID=0 RTSP/1.0     RTSP/1.0 200 OK
//! CSeq: 3                                       CSeq: 3
//! Transport: RTP/AVP;unicast;client_port=...    Session: 12345678;timeout=60
//!                                               Transport: ...;server_port=...
//! ```
//!
//! The connection is not strictly request/response from the client's side:
//! - the server may push its own requests (TEARDOWN, SET_PARAMETER,
//!   PLAY_NOTIFY) between responses;
//! - with interleaved transport, `$`-framed RTP shares the stream.
//!
//! ## Methods the client sends
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery, keep-alive |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | ANNOUNCE | §10.3 | Post a description |
//! | SETUP | §10.4 | Negotiate transport |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keep-alive / parameter query |
//! | SET_PARAMETER | §10.9 | Set a parameter |

pub mod auth;
pub mod headers;
pub mod message;
pub mod method;
pub mod sdp;
pub mod status;

pub use auth::{Authenticator, Challenge, Credentials};
pub use headers::{NptRange, RtpInfo, SessionHeader};
pub use message::{Message, Parsed, RTSP_VERSION, StartLine};
pub use method::Method;
pub use sdp::{MediaDescription, SessionDescription};
pub use status::StatusCode;
