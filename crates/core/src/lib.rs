//! Blocking RTSP client with RTP frame reassembly.
//!
//! [`Client`] drives a presentation through OPTIONS, DESCRIBE, SETUP and
//! PLAY over a TCP, UDP or HTTP-tunnelled control connection, negotiates
//! the media transport, keeps sessions alive and groups received RTP
//! packets into [`Frame`](media::Frame)s.

pub mod client;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, PushEvent};
pub use error::{Result, RtspError};
pub use lifecycle::Lifecycle;
