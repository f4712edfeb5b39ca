//! Companion device protocol core: pairs a phone with an automotive head
//! unit over a low-power wireless transport and sustains an authenticated,
//! encrypted message channel for feature plug-ins.
//!
//! The crate is organized around the nine components this protocol splits
//! into: crypto primitives ([`crypto`]), persistence ([`secret_store`]),
//! out-of-band token sourcing ([`token_provider`]), framed messaging
//! ([`message_stream`]), version negotiation ([`version_resolver`]),
//! first-time pairing ([`association`]), re-authentication
//! ([`reconnection`]), the encrypted multiplexed channel
//! ([`secured_channel`]), and lifecycle orchestration
//! ([`connection_manager`]). [`transport`] and [`handshake`] are the narrow
//! external-collaborator boundaries; acquiring a physical radio and
//! running the authenticated key-agreement handshake itself are both out
//! of scope for this core.

pub mod association;
pub mod config;
pub mod connection_manager;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod message_stream;
pub mod model;
pub mod oob_url;
pub mod reconnection;
pub mod secret_store;
pub mod secured_channel;
pub mod token_provider;
pub mod transport;
pub mod version_resolver;

use std::rc::Rc;

use association::AssociationUserInteraction;
use config::CoreConfig;
use handshake::HandshakeLibrary;
use secret_store::SecretStore;
use token_provider::CoalescingTokenProvider;

/// Top-level façade wiring the connection manager, secret store and
/// configuration together. Deliberately `!Send`: it is built from `Rc`
/// internals, so the type system (not a runtime check) enforces the
/// single-cooperative-executor requirement in SPEC_FULL.md 5.1. Run it
/// inside a `tokio::task::LocalSet` with `spawn_local`.
pub struct CompanionCore<T: transport::Transport + 'static> {
    pub config: CoreConfig,
    pub store: Rc<dyn SecretStore>,
    pub token_provider: Rc<CoalescingTokenProvider>,
    pub connections: Rc<connection_manager::ConnectionManager<T>>,
}

impl<T: transport::Transport + 'static> CompanionCore<T> {
    pub fn new(
        transport: Rc<T>,
        store: Rc<dyn SecretStore>,
        config: CoreConfig,
        handshake: Rc<dyn HandshakeLibrary>,
        interaction: Rc<dyn AssociationUserInteraction>,
    ) -> Self {
        let token_provider = Rc::new(CoalescingTokenProvider::new());
        let connections = connection_manager::ConnectionManager::new(
            transport,
            store.clone(),
            config.clone(),
            handshake,
            interaction,
            token_provider.clone(),
        );
        Self { config, store, token_provider, connections }
    }

    /// Returns the associated-car fleet currently known to the secret
    /// store, for driving reconnection advertisement matching.
    pub fn associated_cars(&self) -> error::CoreResult<Vec<uuid::Uuid>> {
        self.store.list_car_ids()
    }
}
