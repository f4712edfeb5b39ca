//! Association state machines (SPEC_FULL.md 4.6): first-time pairing for
//! security versions v1 through v4, producing a saved session and a fresh
//! reconnection key.
//!
//! Phased like the SPAKE2 pairing flow in the reference sync-pairing module
//! (`run_initiator`/`run_responder`, HMAC confirmation, `tokio::time::timeout`
//! wrapping every receive) but driven off this protocol's own messages
//! instead of SPAKE2.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::error::{CoreError, CoreResult};
use crate::handshake::{HandshakeLibrary, HandshakeSession, VerificationToken};
use crate::message_stream::MessageStream;
use crate::model::{MessageParams, OperationType, ReconnectionKey, Role, SecurityVersion, SessionBlob};
use crate::secret_store::SecretStore;
use crate::secured_channel::SecuredChannel;
use crate::token_provider::{CoalescingTokenProvider, OutOfBandTokenProvider};

/// Global per-attempt timeout; paused conceptually while waiting on the
/// user (callers should not re-arm it during `await_user_acceptance`).
pub const ASSOCIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability for surfacing the pairing code to a person and collecting
/// their accept/reject decision.
#[async_trait(?Send)]
pub trait AssociationUserInteraction {
    async fn display_pairing_code(&self, pairing_code: &str);
    async fn await_user_decision(&self) -> bool;
}

/// Abstracts "the next `encryption_handshake` message for this
/// peripheral", however the caller chooses to deliver it (a live BLE
/// stream, or a test fake driven by a channel).
#[async_trait(?Send)]
pub trait InboundHandshakeMessages {
    async fn next(&self) -> CoreResult<Vec<u8>>;
}

async fn recv_with_timeout(inbound: &dyn InboundHandshakeMessages) -> CoreResult<Vec<u8>> {
    tokio::time::timeout(ASSOCIATION_TIMEOUT, inbound.next())
        .await
        .map_err(|_| CoreError::TimedOut)?
}

fn parse_car_id(bytes: &[u8]) -> CoreResult<Uuid> {
    if bytes.len() != 16 {
        return Err(CoreError::MalformedCarId { len: bytes.len() });
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Ok(Uuid::from_bytes(raw))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VerificationCodeWire {
    state: crate::message_stream::shapes::VerificationState,
    payload: Vec<u8>,
}

/// Outcome of a completed association attempt.
#[derive(Debug)]
pub struct AssociationOutcome {
    pub car_id: Uuid,
    pub session: SessionBlob,
    pub reconnection_key: ReconnectionKey,
    pub role: Role,
}

struct AssociationContext<'a> {
    stream: &'a dyn MessageStream,
    handshake: &'a dyn HandshakeLibrary,
    store: &'a dyn SecretStore,
    interaction: &'a dyn AssociationUserInteraction,
    association_recipient: Uuid,
}

impl<'a> AssociationContext<'a> {
    async fn send_handshake(&self, data: Vec<u8>) -> CoreResult<()> {
        self.stream
            .write_message(
                data,
                MessageParams {
                    recipient: self.association_recipient,
                    operation_type: OperationType::EncryptionHandshake,
                },
            )
            .await
    }

    async fn send_encrypted(&self, data: Vec<u8>) -> CoreResult<()> {
        self.stream
            .write_encrypted_message(
                data,
                MessageParams {
                    recipient: self.association_recipient,
                    operation_type: OperationType::ClientMessage,
                },
            )
            .await
    }

    /// Runs the handshake library up through `requires_verification`,
    /// shows the pairing code, and waits for the user's decision. Returns
    /// the live session once `notify_pairing_code_accepted` has been sent
    /// and the library reports `established`.
    async fn run_visual_confirmation(
        &self,
        token: VerificationToken,
    ) -> CoreResult<Box<dyn HandshakeSession>> {
        self.interaction.display_pairing_code(&token.pairing_code).await;
        if !self.interaction.await_user_decision().await {
            return Err(CoreError::PairingCodeRejected);
        }
        let session = self.handshake.establish().await?;
        session.notify_pairing_code_accepted().await?;
        Ok(session)
    }

    async fn generate_and_store_key(&self, car_id: Uuid) -> CoreResult<ReconnectionKey> {
        let key_bytes: [u8; 32] = crypto::random_array();
        let key = ReconnectionKey(key_bytes);
        self.store
            .put_key(car_id, &key)
            .map_err(|_| CoreError::AuthenticationKeyStorageFailed)?;
        Ok(key)
    }
}

/// v1 (legacy): plaintext device id first, pairing code is a literal
/// `"True"`/anything-else accept/reject signal instead of a user-interaction
/// round trip.
pub async fn run_v1(
    stream: &dyn MessageStream,
    inbound: &dyn InboundHandshakeMessages,
    handshake: &dyn HandshakeLibrary,
    store: &dyn SecretStore,
    interaction: &dyn AssociationUserInteraction,
    association_recipient: Uuid,
    device_id: [u8; 16],
    token: VerificationToken,
) -> CoreResult<AssociationOutcome> {
    let ctx = AssociationContext { stream, handshake, store, interaction, association_recipient };

    ctx.send_handshake(device_id.to_vec()).await?;

    let car_id_bytes = recv_with_timeout(inbound).await?;
    let car_id = parse_car_id(&car_id_bytes)?;

    let session = handshake.establish().await?;

    // v1 carries no visual accept/reject round trip of its own; the pairing
    // code is still surfaced to the user, and the wire-level "True"/anything
    // else byte string is the peer's acceptance signal.
    ctx.interaction.display_pairing_code(&token.pairing_code).await;
    let accept = recv_with_timeout(inbound).await?;
    if accept != b"True" {
        return Err(CoreError::PairingCodeRejected);
    }
    session.notify_pairing_code_accepted().await?;

    let key = ctx.generate_and_store_key(car_id).await?;
    let mut payload = device_id.to_vec();
    payload.extend_from_slice(&key.0);
    ctx.send_encrypted(payload).await?;

    let blob = session.save().await?;
    store.put_session(car_id, &blob).map_err(|_| CoreError::CannotStoreAssociation("session".into()))?;

    Ok(AssociationOutcome { car_id, session: blob, reconnection_key: key, role: Role::Unknown })
}

/// v2/v3: encryption begins immediately; car id arrives only after
/// `encryption_established`.
pub async fn run_v2_v3(
    stream: &dyn MessageStream,
    inbound: &dyn InboundHandshakeMessages,
    handshake: &dyn HandshakeLibrary,
    store: &dyn SecretStore,
    interaction: &dyn AssociationUserInteraction,
    association_recipient: Uuid,
    token: VerificationToken,
) -> CoreResult<AssociationOutcome> {
    let ctx = AssociationContext { stream, handshake, store, interaction, association_recipient };

    let session = ctx.run_visual_confirmation(token).await?;

    let car_id_bytes = recv_with_timeout(inbound).await?;
    let car_id = parse_car_id(&car_id_bytes)?;

    let key = ctx.generate_and_store_key(car_id).await?;
    let mut payload = Vec::with_capacity(48);
    payload.extend_from_slice(car_id.as_bytes());
    payload.extend_from_slice(&key.0);
    ctx.send_encrypted(payload).await?;

    let blob = session.save().await?;
    store.put_session(car_id, &blob).map_err(|_| CoreError::CannotStoreAssociation("session".into()))?;

    Ok(AssociationOutcome { car_id, session: blob, reconnection_key: key, role: Role::Unknown })
}

/// v4: adds an out-of-band-or-visual verification-code exchange ahead of
/// `notify_pairing_code_accepted`, and an advisory role query at the end.
pub async fn run_v4(
    stream: &dyn MessageStream,
    inbound: &dyn InboundHandshakeMessages,
    handshake: &dyn HandshakeLibrary,
    store: &dyn SecretStore,
    interaction: &dyn AssociationUserInteraction,
    token_provider: &CoalescingTokenProvider,
    association_recipient: Uuid,
    token: VerificationToken,
    channel_role_query: Option<&dyn Fn() -> Role>,
) -> CoreResult<AssociationOutcome> {
    let ctx = AssociationContext { stream, handshake, store, interaction, association_recipient };

    token_provider.prepare_for_requests().await;
    let oob_token = tokio::time::timeout(Duration::from_secs(2), token_provider.request_token())
        .await
        .unwrap_or(None);

    let session = match oob_token {
        Some(oob) => {
            let sealed = crypto::aes_gcm_seal(&oob.encryption_key, &oob.mobile_iv, &token.full_verification_data)?;
            let wire = VerificationCodeWire {
                state: crate::message_stream::shapes::VerificationState::OobVerification,
                payload: sealed,
            };
            ctx.send_handshake(serde_json::to_vec(&wire)?).await?;

            let reply = recv_with_timeout(inbound).await?;
            let reply: VerificationCodeWire = serde_json::from_slice(&reply)?;
            if reply.state != crate::message_stream::shapes::VerificationState::OobConfirmation {
                return Err(CoreError::VerificationCodeFailed);
            }
            let opened = crypto::aes_gcm_open(&oob.encryption_key, &oob.ihu_iv, &reply.payload)?;
            if opened != token.full_verification_data {
                return Err(CoreError::VerificationCodeFailed);
            }

            let session = handshake.establish().await?;
            session.notify_pairing_code_accepted().await?;
            session
        }
        None => {
            let wire = VerificationCodeWire {
                state: crate::message_stream::shapes::VerificationState::VisualVerification,
                payload: token.full_verification_data.clone(),
            };
            ctx.send_handshake(serde_json::to_vec(&wire)?).await?;
            ctx.run_visual_confirmation(token).await?
        }
    };
    token_provider.close_for_requests().await;

    let car_id_bytes = recv_with_timeout(inbound).await?;
    let car_id = parse_car_id(&car_id_bytes)?;

    let key = ctx.generate_and_store_key(car_id).await?;
    let mut payload = Vec::with_capacity(48);
    payload.extend_from_slice(car_id.as_bytes());
    payload.extend_from_slice(&key.0);
    ctx.send_encrypted(payload).await?;

    let blob = session.save().await?;
    store.put_session(car_id, &blob).map_err(|_| CoreError::CannotStoreAssociation("session".into()))?;

    // Advisory role query (SPEC_FULL.md 9): failure or absence never fails
    // the attempt.
    let role = channel_role_query.map(|f| f()).unwrap_or(Role::Unknown);

    Ok(AssociationOutcome { car_id, session: blob, reconnection_key: key, role })
}

/// Dispatches to the version-appropriate implementation, then wraps the
/// saved session and negotiated recipient set into a [`SecuredChannel`].
pub fn security_version_requires_oob(version: SecurityVersion) -> bool {
    matches!(version, SecurityVersion::V4)
}

/// Helper used once an [`AssociationOutcome`] is available: restores a
/// [`SecuredChannel`] bound to the freshly associated car. Kept separate
/// from the version-specific functions above because constructing the
/// channel is identical across all versions.
pub fn channel_for_outcome(outcome: &AssociationOutcome, stream: std::rc::Rc<dyn MessageStream>) -> SecuredChannel {
    SecuredChannel::new(outcome.car_id, stream, outcome.role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_stream::fake::FakeMessageStream;
    use crate::secret_store::SqliteSecretStore;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct QueueInbound {
        queue: RefCell<VecDeque<Vec<u8>>>,
    }

    #[async_trait(?Send)]
    impl InboundHandshakeMessages for QueueInbound {
        async fn next(&self) -> CoreResult<Vec<u8>> {
            self.queue.borrow_mut().pop_front().ok_or(CoreError::Disconnected {
                peripheral: crate::model::PeripheralId(0),
            })
        }
    }

    struct FakeSession {
        blob: Vec<u8>,
    }

    #[async_trait(?Send)]
    impl HandshakeSession for FakeSession {
        async fn notify_pairing_code_accepted(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn save(&self) -> CoreResult<SessionBlob> {
            Ok(SessionBlob(self.blob.clone()))
        }
    }

    struct FakeHandshakeLibrary;

    #[async_trait(?Send)]
    impl HandshakeLibrary for FakeHandshakeLibrary {
        async fn prepare_verification(&self) -> CoreResult<VerificationToken> {
            Ok(VerificationToken { pairing_code: "111111".into(), full_verification_data: vec![1, 2, 3] })
        }
        async fn establish(&self) -> CoreResult<Box<dyn HandshakeSession>> {
            Ok(Box::new(FakeSession { blob: vec![1, 2, 3, 4] }))
        }
        async fn resume_from(&self, blob: &SessionBlob) -> CoreResult<Box<dyn HandshakeSession>> {
            Ok(Box::new(FakeSession { blob: blob.0.clone() }))
        }
    }

    struct AlwaysAccept;

    #[async_trait(?Send)]
    impl AssociationUserInteraction for AlwaysAccept {
        async fn display_pairing_code(&self, _pairing_code: &str) {}
        async fn await_user_decision(&self) -> bool {
            true
        }
    }

    fn sample_token() -> VerificationToken {
        VerificationToken { pairing_code: "123456".into(), full_verification_data: vec![9; 16] }
    }

    #[tokio::test]
    async fn v1_happy_path_stores_key_and_session() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let interaction = AlwaysAccept;
        let car_id = Uuid::new_v4();
        let inbound = QueueInbound {
            queue: RefCell::new(VecDeque::from(vec![car_id.as_bytes().to_vec(), b"True".to_vec()])),
        };

        let outcome = run_v1(
            &stream,
            &inbound,
            &handshake,
            &store,
            &interaction,
            Uuid::new_v4(),
            [1u8; 16],
            sample_token(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.car_id, car_id);
        assert!(store.get_key(car_id).unwrap().is_some());
        assert!(store.get_session(car_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn v1_rejects_non_true_acceptance() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let interaction = AlwaysAccept;
        let car_id = Uuid::new_v4();
        let inbound = QueueInbound {
            queue: RefCell::new(VecDeque::from(vec![car_id.as_bytes().to_vec(), b"nope".to_vec()])),
        };

        let err = run_v1(&stream, &inbound, &handshake, &store, &interaction, Uuid::new_v4(), [2u8; 16], sample_token())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PairingCodeRejected));
        assert!(store.get_key(car_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn v1_rejects_malformed_car_id() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let interaction = AlwaysAccept;
        let inbound = QueueInbound {
            queue: RefCell::new(VecDeque::from(vec![vec![0u8; 15]])),
        };

        let err = run_v1(&stream, &inbound, &handshake, &store, &interaction, Uuid::new_v4(), [3u8; 16], sample_token())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MalformedCarId { len: 15 }));
    }

    #[tokio::test]
    async fn v2_v3_generates_fresh_key_per_car() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let interaction = AlwaysAccept;
        let car_id = Uuid::new_v4();
        let inbound = QueueInbound { queue: RefCell::new(VecDeque::from(vec![car_id.as_bytes().to_vec()])) };
        let token = VerificationToken { pairing_code: "123456".into(), full_verification_data: vec![9; 16] };

        let outcome = run_v2_v3(&stream, &inbound, &handshake, &store, &interaction, Uuid::new_v4(), token)
            .await
            .unwrap();

        assert_eq!(outcome.car_id, car_id);
        let stored_key = store.get_key(car_id).unwrap().unwrap();
        assert_eq!(stored_key.0, outcome.reconnection_key.0);
    }
}
