//! External authenticated-key-agreement library interface (SPEC_FULL.md 6).
//! Treated as opaque: this core never inspects handshake wire bytes itself,
//! only the verification token it surfaces and the save/resume blob it
//! produces.

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::SessionBlob;

/// Verification token surfaced by the handshake library once a pairing
/// code is available to show the user (or to bind to an out-of-band
/// channel).
#[derive(Debug, Clone)]
pub struct VerificationToken {
    pub pairing_code: String,
    pub full_verification_data: Vec<u8>,
}

/// A single in-progress or completed handshake session.
#[async_trait(?Send)]
pub trait HandshakeSession {
    async fn notify_pairing_code_accepted(&self) -> CoreResult<()>;
    async fn save(&self) -> CoreResult<SessionBlob>;
}

/// Entry point for starting a fresh handshake or resuming a saved one.
#[async_trait(?Send)]
pub trait HandshakeLibrary {
    /// Computes the verification token (pairing code plus the bytes bound
    /// to an out-of-band channel) ahead of actually establishing the
    /// session, so the caller can surface it to the user or wrap it for
    /// OOB exchange before the association/reconnection FSM runs.
    async fn prepare_verification(&self) -> CoreResult<VerificationToken>;
    async fn establish(&self) -> CoreResult<Box<dyn HandshakeSession>>;
    async fn resume_from(&self, blob: &SessionBlob) -> CoreResult<Box<dyn HandshakeSession>>;
}
