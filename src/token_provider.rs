//! Out-of-band token providers (SPEC_FULL.md 4.3): coalescing fan-out,
//! passive pre-posted tokens, and accessory-session tokens.
//!
//! Capability-trait shape follows the `async_trait` delegate pattern used
//! throughout the pack for pluggable collaborators; the coalescing fan-out
//! itself has no direct example-repo analogue and is built straight from
//! the spec's "first non-empty wins, rest discarded" semantics.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::model::OutOfBandAssociationToken;

/// Capability set implemented by every out-of-band token source.
#[async_trait(?Send)]
pub trait OutOfBandTokenProvider {
    /// Called before association begins scanning; providers may open
    /// resources here (e.g. reconcile accessory sessions).
    async fn prepare_for_requests(&self);

    /// Called when association ends, successfully or not.
    async fn close_for_requests(&self);

    /// Requests a token. Returns `None` if this provider has nothing to
    /// offer (the caller fans out to multiple providers and takes the
    /// first `Some`).
    async fn request_token(&self) -> Option<OutOfBandAssociationToken>;

    /// Clears any pending or cached request state.
    async fn reset(&self);
}

/// Coalesces multiple child providers behind one request. Captures the set
/// of children present *at request time*; a child added after a request has
/// already started does not participate in that request, matching
/// SPEC_FULL.md 4.3 ("adding a child does not affect in-flight requests").
pub struct CoalescingTokenProvider {
    children: Mutex<Vec<Arc<dyn OutOfBandTokenProvider>>>,
}

impl CoalescingTokenProvider {
    pub fn new() -> Self {
        Self { children: Mutex::new(Vec::new()) }
    }

    pub async fn add_child(&self, child: Arc<dyn OutOfBandTokenProvider>) {
        self.children.lock().await.push(child);
    }
}

impl Default for CoalescingTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl OutOfBandTokenProvider for CoalescingTokenProvider {
    async fn prepare_for_requests(&self) {
        let children = self.children.lock().await.clone();
        for child in &children {
            child.prepare_for_requests().await;
        }
    }

    async fn close_for_requests(&self) {
        let children = self.children.lock().await.clone();
        for child in &children {
            child.close_for_requests().await;
        }
    }

    async fn request_token(&self) -> Option<OutOfBandAssociationToken> {
        let captured = self.children.lock().await.clone();
        if captured.is_empty() {
            return None;
        }
        // Fire a request to every captured child concurrently; the first
        // non-empty reply wins in completion order, not input order, so
        // this races via FuturesUnordered rather than join_all.
        let mut pending: FuturesUnordered<_> = captured.iter().map(|child| child.request_token()).collect();
        while let Some(result) = pending.next().await {
            if result.is_some() {
                return result;
            }
        }
        None
    }

    async fn reset(&self) {
        let children = self.children.lock().await.clone();
        for child in &children {
            child.reset().await;
        }
    }
}

/// Holds at most one pre-posted token, e.g. scanned from a QR code before
/// the association scan begins.
pub struct PassiveTokenProvider {
    pending: Mutex<Option<OutOfBandAssociationToken>>,
}

impl PassiveTokenProvider {
    pub fn new() -> Self {
        Self { pending: Mutex::new(None) }
    }

    pub async fn post(&self, token: OutOfBandAssociationToken) {
        *self.pending.lock().await = Some(token);
    }
}

impl Default for PassiveTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl OutOfBandTokenProvider for PassiveTokenProvider {
    async fn prepare_for_requests(&self) {}

    async fn close_for_requests(&self) {}

    async fn request_token(&self) -> Option<OutOfBandAssociationToken> {
        self.pending.lock().await.clone()
    }

    async fn reset(&self) {
        *self.pending.lock().await = None;
    }
}

/// Capability for a single external-accessory stream: parses the first
/// out-of-band token off the wire, once connected.
#[async_trait(?Send)]
pub trait AccessorySession {
    fn protocol_identifier(&self) -> &str;
    async fn read_token(&self) -> Option<OutOfBandAssociationToken>;
}

/// Tracks accessory connect/disconnect events and reconciles live sessions
/// against a configured protocol identifier on `prepare_for_requests`.
pub struct AccessorySessionTokenProvider {
    protocol_identifier: String,
    connected: Mutex<Vec<Arc<dyn AccessorySession>>>,
    active: Mutex<Vec<Arc<dyn AccessorySession>>>,
}

impl AccessorySessionTokenProvider {
    pub fn new(protocol_identifier: impl Into<String>) -> Self {
        Self {
            protocol_identifier: protocol_identifier.into(),
            connected: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Notifies the provider that an accessory session connected.
    pub async fn on_connected(&self, session: Arc<dyn AccessorySession>) {
        self.connected.lock().await.push(session);
    }

    /// Notifies the provider that an accessory session disconnected.
    pub async fn on_disconnected(&self, protocol_identifier: &str) {
        self.connected
            .lock()
            .await
            .retain(|s| s.protocol_identifier() != protocol_identifier);
        self.active.lock().await.retain(|s| s.protocol_identifier() != protocol_identifier);
    }
}

#[async_trait(?Send)]
impl OutOfBandTokenProvider for AccessorySessionTokenProvider {
    async fn prepare_for_requests(&self) {
        let matching: Vec<_> = self
            .connected
            .lock()
            .await
            .iter()
            .filter(|s| s.protocol_identifier() == self.protocol_identifier)
            .cloned()
            .collect();
        *self.active.lock().await = matching;
    }

    async fn close_for_requests(&self) {
        self.active.lock().await.clear();
    }

    async fn request_token(&self) -> Option<OutOfBandAssociationToken> {
        let sessions = self.active.lock().await.clone();
        let mut pending: FuturesUnordered<_> = sessions.iter().map(|s| s.read_token()).collect();
        while let Some(result) = pending.next().await {
            if result.is_some() {
                return result;
            }
        }
        None
    }

    async fn reset(&self) {
        self.active.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct DelayedProvider {
        token: OutOfBandAssociationToken,
        delay_ms: u64,
    }

    #[async_trait(?Send)]
    impl OutOfBandTokenProvider for DelayedProvider {
        async fn prepare_for_requests(&self) {}
        async fn close_for_requests(&self) {}
        async fn request_token(&self) -> Option<OutOfBandAssociationToken> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Some(self.token.clone())
        }
        async fn reset(&self) {}
    }

    fn sample_token(tag: u8) -> OutOfBandAssociationToken {
        OutOfBandAssociationToken {
            encryption_key: [tag; 16],
            mobile_iv: [tag; 12],
            ihu_iv: [tag; 12],
            device_identifier: [tag; 16],
        }
    }

    #[tokio::test]
    async fn coalescing_returns_fastest_child() {
        let coalescer = CoalescingTokenProvider::new();
        coalescer
            .add_child(Arc::new(DelayedProvider { token: sample_token(0xAA), delay_ms: 50 }))
            .await;
        coalescer
            .add_child(Arc::new(DelayedProvider { token: sample_token(0xBB), delay_ms: 10 }))
            .await;

        let token = coalescer.request_token().await.unwrap();
        assert_eq!(token.encryption_key, [0xBB; 16]);
    }

    #[tokio::test]
    async fn coalescing_with_no_children_returns_none() {
        let coalescer = CoalescingTokenProvider::new();
        assert!(coalescer.request_token().await.is_none());
    }

    #[tokio::test]
    async fn passive_provider_returns_posted_token_until_reset() {
        let provider = PassiveTokenProvider::new();
        assert!(provider.request_token().await.is_none());
        provider.post(sample_token(0x11)).await;
        assert!(provider.request_token().await.is_some());
        provider.reset().await;
        assert!(provider.request_token().await.is_none());
    }
}
