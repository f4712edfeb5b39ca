//! Reconnection state machine (SPEC_FULL.md 4.7): anonymized advertisement
//! match, then challenge-response, then session resume.
//!
//! The truncated-HMAC match reuses the exact compute/compare idiom from the
//! teacher broadcaster's `verify_infra`, applied against each associated
//! car's stored key instead of one shared infrastructure key.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::crypto;
use crate::error::{CoreError, CoreResult};
use crate::handshake::HandshakeLibrary;
use crate::message_stream::MessageStream;
use crate::model::{
    MessageParams, OperationType, ReconnectionAdvertisementPayload, ReconnectionKey, Role, SessionBlob,
};
use crate::secret_store::SecretStore;

pub const RECONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const CHALLENGE_SALT_LEN: usize = 16;

/// Candidate car id plus its reconnection key, as handed to the matcher.
pub struct Candidate {
    pub car_id: Uuid,
    pub key: ReconnectionKey,
}

/// Result of matching an advertisement against the associated-car set.
pub struct MatchedAdvertisement {
    pub car_id: Uuid,
    pub key: ReconnectionKey,
    pub full_hmac: [u8; 32],
}

/// Matches a reconnection advertisement payload against the given
/// candidates, returning the first hit in iteration order.
///
/// Per SPEC_FULL.md 9, truncated-HMAC collisions across two associated
/// cars are not disambiguated; whichever candidate is listed first wins.
/// This mirrors the source behavior exactly and is a known, accepted
/// limitation rather than an oversight.
pub fn match_advertisement(
    payload: ReconnectionAdvertisementPayload,
    candidates: &[Candidate],
) -> Option<MatchedAdvertisement> {
    let padded_salt = payload.padded_salt();
    for candidate in candidates {
        let full_hmac = crypto::hmac_sha256(&candidate.key.0, &padded_salt);
        let truncated: [u8; 3] = crypto::truncate(&full_hmac);
        if truncated == payload.truncated_hmac {
            return Some(MatchedAdvertisement { car_id: candidate.car_id, key: candidate.key.clone(), full_hmac });
        }
    }
    None
}

pub async fn next_with_timeout(inbound: &dyn InboundReconnectionMessages) -> CoreResult<Vec<u8>> {
    tokio::time::timeout(RECONNECTION_TIMEOUT, inbound.next())
        .await
        .map_err(|_| CoreError::TimedOut)?
}

/// Abstracts "the next message on the reconnection recipient", same shape
/// as [`crate::association::InboundHandshakeMessages`] but kept separate
/// since the two FSMs never share a peripheral concurrently.
#[async_trait(?Send)]
pub trait InboundReconnectionMessages {
    async fn next(&self) -> CoreResult<Vec<u8>>;
}

#[derive(Debug)]
pub struct ReconnectionOutcome {
    pub car_id: Uuid,
    pub session: SessionBlob,
    pub role: Role,
}

/// Drives a matched candidate through challenge/response and session
/// resume. `security_version_is_v4` toggles the advisory trailing role
/// query, matching association's v4 behavior.
pub async fn run(
    stream: &dyn MessageStream,
    inbound: &dyn InboundReconnectionMessages,
    handshake: &dyn HandshakeLibrary,
    store: &dyn SecretStore,
    reconnection_recipient: Uuid,
    matched: MatchedAdvertisement,
    role_query: Option<&dyn Fn() -> Role>,
) -> CoreResult<ReconnectionOutcome> {
    let challenge_salt: [u8; CHALLENGE_SALT_LEN] = crypto::random_array();
    run_with_salt(stream, inbound, handshake, store, reconnection_recipient, matched, role_query, challenge_salt)
        .await
}

/// Same as [`run`] but takes the challenge salt explicitly, so tests can
/// compute the expected response without guessing a random value.
#[allow(clippy::too_many_arguments)]
pub async fn run_with_salt(
    stream: &dyn MessageStream,
    inbound: &dyn InboundReconnectionMessages,
    handshake: &dyn HandshakeLibrary,
    store: &dyn SecretStore,
    reconnection_recipient: Uuid,
    matched: MatchedAdvertisement,
    role_query: Option<&dyn Fn() -> Role>,
    challenge_salt: [u8; CHALLENGE_SALT_LEN],
) -> CoreResult<ReconnectionOutcome> {
    let mut outgoing = Vec::with_capacity(32 + CHALLENGE_SALT_LEN);
    outgoing.extend_from_slice(&matched.full_hmac);
    outgoing.extend_from_slice(&challenge_salt);
    stream
        .write_message(
            outgoing,
            MessageParams { recipient: reconnection_recipient, operation_type: OperationType::EncryptionHandshake },
        )
        .await?;

    let response = next_with_timeout(inbound).await?;
    let expected = crypto::hmac_sha256(&matched.key.0, &challenge_salt);
    if response.len() != 32 || response != expected {
        return Err(CoreError::AuthenticationFailed);
    }

    let saved = store
        .get_session(matched.car_id)
        .map_err(|_| CoreError::SecretStore("read session".into()))?
        .ok_or(CoreError::NoSavedEncryption)?;

    let session = handshake.resume_from(&saved).await.map_err(|_| CoreError::InvalidSavedEncryption)?;
    let refreshed = session.save().await?;
    store
        .put_session(matched.car_id, &refreshed)
        .map_err(|_| CoreError::CannotStoreAssociation("session".into()))?;

    let role = role_query.map(|f| f()).unwrap_or(Role::Unknown);

    Ok(ReconnectionOutcome { car_id: matched.car_id, session: refreshed, role })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_stream::fake::FakeMessageStream;
    use crate::secret_store::SqliteSecretStore;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn candidate(id: Uuid, seed: u8) -> Candidate {
        Candidate { car_id: id, key: ReconnectionKey([seed; 32]) }
    }

    #[test]
    fn matches_the_right_candidate_by_truncated_hmac() {
        let salt = [5u8; 8];
        let c1 = candidate(Uuid::new_v4(), 1);
        let c2 = candidate(Uuid::new_v4(), 2);

        let mut padded = [0u8; 16];
        padded[0..8].copy_from_slice(&salt);
        let full = crypto::hmac_sha256(&c2.key.0, &padded);
        let truncated: [u8; 3] = crypto::truncate(&full);

        let payload = ReconnectionAdvertisementPayload { truncated_hmac: truncated, salt };
        let matched = match_advertisement(payload, &[candidate(c1.car_id, 1), candidate(c2.car_id, 2)]).unwrap();
        assert_eq!(matched.car_id, c2.car_id);
    }

    #[test]
    fn no_match_returns_none() {
        let payload = ReconnectionAdvertisementPayload { truncated_hmac: [0xAA; 3], salt: [0; 8] };
        let candidates = vec![candidate(Uuid::new_v4(), 9)];
        assert!(match_advertisement(payload, &candidates).is_none());
    }

    struct QueueInbound {
        queue: RefCell<VecDeque<Vec<u8>>>,
    }

    #[async_trait(?Send)]
    impl InboundReconnectionMessages for QueueInbound {
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
    impl crate::handshake::HandshakeSession for FakeSession {
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
        async fn prepare_verification(&self) -> CoreResult<crate::handshake::VerificationToken> {
            Ok(crate::handshake::VerificationToken { pairing_code: "222222".into(), full_verification_data: vec![0xAB] })
        }
        async fn establish(&self) -> CoreResult<Box<dyn crate::handshake::HandshakeSession>> {
            Ok(Box::new(FakeSession { blob: vec![0xAB] }))
        }
        async fn resume_from(&self, blob: &SessionBlob) -> CoreResult<Box<dyn crate::handshake::HandshakeSession>> {
            Ok(Box::new(FakeSession { blob: blob.0.clone() }))
        }
    }

    #[tokio::test]
    async fn happy_path_resumes_session() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let car_id = Uuid::new_v4();
        store.put_session(car_id, &SessionBlob(vec![1, 2, 3])).unwrap();

        let key = ReconnectionKey([4u8; 32]);
        let matched = MatchedAdvertisement { car_id, key: key.clone(), full_hmac: [7u8; 32] };

        let challenge_salt = [3u8; CHALLENGE_SALT_LEN];
        let expected_response = crypto::hmac_sha256(&key.0, &challenge_salt).to_vec();
        let inbound = QueueInbound { queue: RefCell::new(VecDeque::from(vec![expected_response])) };

        let outcome = run_with_salt(
            &stream,
            &inbound,
            &handshake,
            &store,
            Uuid::new_v4(),
            matched,
            None,
            challenge_salt,
        )
        .await
        .unwrap();

        assert_eq!(outcome.car_id, car_id);
        let sent = stream.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[0..32], &[7u8; 32]);
        assert_eq!(&sent[0].data[32..48], &challenge_salt);
    }

    #[tokio::test]
    async fn wrong_challenge_response_is_rejected() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let car_id = Uuid::new_v4();
        store.put_session(car_id, &SessionBlob(vec![1])).unwrap();
        let matched = MatchedAdvertisement { car_id, key: ReconnectionKey([1u8; 32]), full_hmac: [2u8; 32] };
        let inbound = QueueInbound { queue: RefCell::new(VecDeque::from(vec![vec![0xFFu8; 32]])) };

        let err = run(&stream, &inbound, &handshake, &store, Uuid::new_v4(), matched, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn missing_saved_session_is_reported_after_successful_auth() {
        let stream = FakeMessageStream::new();
        let store = SqliteSecretStore::open_in_memory().unwrap();
        let handshake = FakeHandshakeLibrary;
        let car_id = Uuid::new_v4();
        let key = ReconnectionKey([6u8; 32]);
        let matched = MatchedAdvertisement { car_id, key: key.clone(), full_hmac: [9u8; 32] };

        let challenge_salt = [8u8; CHALLENGE_SALT_LEN];
        let expected_response = crypto::hmac_sha256(&key.0, &challenge_salt).to_vec();
        let inbound = QueueInbound { queue: RefCell::new(VecDeque::from(vec![expected_response])) };

        let err = run_with_salt(&stream, &inbound, &handshake, &store, Uuid::new_v4(), matched, None, challenge_salt)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSavedEncryption));
    }
}
