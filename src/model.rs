//! Core data types shared across the association, reconnection and secured
//! channel subsystems.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Opaque identifier for a connected or discovered peripheral, as handed out
/// by the transport. The core never interprets this value; it is only used
/// as a map key to track per-peripheral attempt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeripheralId(pub u64);

/// A previously or newly associated vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: Uuid,
    pub name: Option<String>,
}

impl Car {
    pub fn new(id: Uuid, name: Option<String>) -> Self {
        Self { id, name }
    }

    pub fn store_key(&self) -> String {
        format!("cars:{}", self.id)
    }
}

/// Record persisted at `cars:<id>` (see SPEC_FULL.md 3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarRecord {
    pub name: Option<String>,
}

/// A 256-bit symmetric key shared with an associated car, used to
/// authenticate reconnection advertisements and challenges.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReconnectionKey(pub [u8; 32]);

impl std::fmt::Debug for ReconnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReconnectionKey(..)")
    }
}

/// Opaque serialized state of a previously completed authenticated
/// handshake, produced by [`crate::handshake::HandshakeSession::save`] and
/// consumed by [`crate::handshake::HandshakeLibrary::resume_from`].
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionBlob(pub Vec<u8>);

impl std::fmt::Debug for SessionBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionBlob({} bytes)", self.0.len())
    }
}

/// Trusted-device escrow token, 64 bits, paired one-to-one with a car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowToken(pub u64);

/// Opaque trusted-device handle, paired one-to-one with a car.
#[derive(Clone, Serialize, Deserialize)]
pub struct AssociationHandle(pub Vec<u8>);

impl std::fmt::Debug for AssociationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssociationHandle({} bytes)", self.0.len())
    }
}

/// Security version negotiated for a peripheral. Determines which
/// association/reconnection state machine implementation is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityVersion {
    V1,
    V2,
    V3,
    V4,
}

/// Stream framing version negotiated alongside the security version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamVersion(pub u8);

/// Symmetric material delivered outside the wireless channel, binding a
/// verification code to a specific association attempt. Lives for at most
/// one association attempt and is never persisted.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutOfBandAssociationToken {
    pub encryption_key: [u8; 16],
    pub mobile_iv: [u8; 12],
    pub ihu_iv: [u8; 12],
    pub device_identifier: [u8; 16],
}

impl std::fmt::Debug for OutOfBandAssociationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutOfBandAssociationToken(..)")
    }
}

/// A scanned or observed BLE advertisement, platform-agnostic.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub service_uuids: BTreeSet<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub local_name: Option<String>,
}

/// Exactly 11 bytes: a 3-byte truncated HMAC followed by an 8-byte salt.
/// See SPEC_FULL.md 3 "ReconnectionAdvertisementPayload".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionAdvertisementPayload {
    pub truncated_hmac: [u8; 3],
    pub salt: [u8; 8],
}

impl ReconnectionAdvertisementPayload {
    pub const LEN: usize = 11;

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..3].copy_from_slice(&self.truncated_hmac);
        out[3..11].copy_from_slice(&self.salt);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut truncated_hmac = [0u8; 3];
        let mut salt = [0u8; 8];
        truncated_hmac.copy_from_slice(&bytes[0..3]);
        salt.copy_from_slice(&bytes[3..11]);
        Some(Self { truncated_hmac, salt })
    }

    /// The effective HMAC input is the salt zero-padded out to 16 bytes.
    pub fn padded_salt(self) -> [u8; 16] {
        let mut padded = [0u8; 16];
        padded[0..8].copy_from_slice(&self.salt);
        padded
    }
}

/// A passenger/driver role resolved from an optional post-association
/// configuration query. Absence of a response leaves this `Unknown`; per
/// SPEC_FULL.md 9, the role query is advisory, not mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Driver,
    Passenger,
    Unknown,
}

/// Recipient UUID multiplexing application messages over one secured
/// channel.
pub type Recipient = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    EncryptionHandshake,
    ClientMessage,
    Query,
    QueryResponse,
}

#[derive(Debug, Clone)]
pub struct MessageParams {
    pub recipient: Recipient,
    pub operation_type: OperationType,
}
