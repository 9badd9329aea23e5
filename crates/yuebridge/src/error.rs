//! Error taxonomy for the bridge.
//!
//! Framing and protocol errors are recovered at the scheduler boundary and
//! fail a single request; only launch failure (and a restart that also
//! fails) is surfaced to the user-visible layer.

use crate::bridge::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Worker executable could not be resolved or spawned. Fatal to the
    /// bridge; surfaced once, no retry.
    #[error("failed to launch worker: {0}")]
    Launch(String),

    /// Malformed frame. For an undecodable body the frame's bytes are
    /// already consumed and the session recovers on the next frame; an
    /// oversized frame ends the stream, and the worker is respawned on
    /// the next editor event.
    #[error("framing error: {0}")]
    Framing(#[from] CodecError),

    /// Decoded payload is valid JSON but not a valid reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Worker process terminated while work was outstanding.
    #[error("worker exited")]
    WorkerExited,

    /// No reply within the configured bound. Fails that one request only.
    #[error("request timed out")]
    Timeout,
}

impl BridgeError {
    /// Errors that end the session (as opposed to failing one request).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::WorkerExited)
    }
}
