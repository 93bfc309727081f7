//! Error taxonomy for the cloud and stream protocol layers.
//!
//! Only fatal, propagated conditions live here. Locally-recovered events —
//! an incomplete frame dropped by the demuxer, a dead RTSP viewer — are
//! logged where they happen and never surface as errors. Cancellation is
//! ordinary control flow in the recorder, not an error.

use thiserror::Error;

/// Fatal errors from the control, registration, and relay channels.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connect/read/write failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Framing, magic, or status mismatch on a camera protocol channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the login or returned an unusable response.
    #[error("login failed: {0}")]
    Login(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
