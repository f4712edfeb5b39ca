//! Negotiates stream and security version over the raw message stream
//! (SPEC_FULL.md 4.5) before any FSM-specific logic runs.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::message_stream::MessageStream;
use crate::model::{MessageParams, OperationType, Recipient, SecurityVersion, StreamVersion};

const MAX_SUPPORTED_STREAM_VERSION: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionExchange {
    pub min_stream_version: u8,
    pub max_stream_version: u8,
    pub min_security_version: u8,
    pub max_security_version: u8,
}

fn security_version_to_wire(v: SecurityVersion) -> u8 {
    match v {
        SecurityVersion::V1 => 1,
        SecurityVersion::V2 => 2,
        SecurityVersion::V3 => 3,
        SecurityVersion::V4 => 4,
    }
}

fn security_version_from_wire(v: u8) -> Option<SecurityVersion> {
    match v {
        1 => Some(SecurityVersion::V1),
        2 => Some(SecurityVersion::V2),
        3 => Some(SecurityVersion::V3),
        4 => Some(SecurityVersion::V4),
        _ => None,
    }
}

/// Resolves the highest mutually supported stream and security version by
/// exchanging ranges with the peer, once, over the association recipient.
pub async fn resolve_version(
    stream: &dyn MessageStream,
    association_recipient: Recipient,
    peer_reply: VersionExchange,
) -> CoreResult<(StreamVersion, SecurityVersion)> {
    let local = VersionExchange {
        min_stream_version: 1,
        max_stream_version: MAX_SUPPORTED_STREAM_VERSION,
        min_security_version: security_version_to_wire(SecurityVersion::V1),
        max_security_version: security_version_to_wire(SecurityVersion::V4),
    };

    let payload = serde_json::to_vec(&local)?;
    stream
        .write_message(
            payload,
            MessageParams { recipient: association_recipient, operation_type: OperationType::EncryptionHandshake },
        )
        .await?;

    let stream_version = local.max_stream_version.min(peer_reply.max_stream_version);
    if stream_version < local.min_stream_version.max(peer_reply.min_stream_version) {
        return Err(CoreError::VersionResolutionFailed);
    }

    let security_version = local.max_security_version.min(peer_reply.max_security_version);
    let security_version = security_version_from_wire(security_version)
        .ok_or(CoreError::VersionResolutionFailed)?;

    Ok((StreamVersion(stream_version), security_version))
}
