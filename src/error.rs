use crate::model::PeripheralId;

/// Error taxonomy surfaced by every fallible operation in this crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("unknown error")]
    Unknown,

    #[error("peripheral {peripheral:?} disconnected")]
    Disconnected { peripheral: PeripheralId },

    #[error("operation timed out")]
    TimedOut,

    #[error("cannot discover services on peripheral")]
    CannotDiscoverServices,

    #[error("cannot discover characteristics on peripheral")]
    CannotDiscoverCharacteristics,

    #[error("cannot parse message")]
    CannotParseMessage,

    #[error("cannot send message")]
    CannotSendMessages,

    #[error("cannot store association state: {0}")]
    CannotStoreAssociation(String),

    #[error("pairing code rejected by user or peer")]
    PairingCodeRejected,

    #[error("verification code exchange failed")]
    VerificationCodeFailed,

    #[error("failed to persist authentication key")]
    AuthenticationKeyStorageFailed,

    #[error("car id must be exactly 16 bytes, got {len}")]
    MalformedCarId { len: usize },

    #[error("peer removed pairing information")]
    PeerRemovedPairingInfo,

    #[error("no saved encryption session for this car")]
    NoSavedEncryption,

    #[error("saved encryption session is invalid or corrupt")]
    InvalidSavedEncryption,

    #[error("advertisement did not match any associated car")]
    UnassociatedCar,

    #[error("resolved security version is incompatible with this helper")]
    MismatchedSecurityVersion,

    #[error("security version {0:?} is not supported")]
    VersionNotSupported(crate::model::SecurityVersion),

    #[error("failed to resolve stream/security version")]
    VersionResolutionFailed,

    #[error("an observer is already registered for this recipient")]
    ObserverAlreadyRegistered,

    #[error("channel is no longer valid")]
    InvalidChannel,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("message is malformed or unparsable")]
    InvalidMessage,

    #[error("AES-GCM nonce must be 12 bytes, got {len}")]
    InvalidNonce { len: usize },

    #[error("data is too short to contain an authentication tag")]
    InvalidDataSize,

    #[error("secret store I/O error: {0}")]
    SecretStore(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::SecretStore(e.to_string())
    }
}

impl From<aes_gcm::Error> for CoreError {
    fn from(_: aes_gcm::Error) -> Self {
        CoreError::AuthenticationFailed
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        log::debug!("serde error folded into CannotParseMessage: {e}");
        CoreError::CannotParseMessage
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
