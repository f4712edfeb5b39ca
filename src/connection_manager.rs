//! Connection manager (SPEC_FULL.md 4.9): scanning mode selection,
//! power-state gating, connection retry scheduling, duplicate-discovery
//! handling, GATT session orchestration and dissociation.
//!
//! Retry/backoff scheduling is built directly from SPEC_FULL.md 4.9 (t=2s,
//! t=4s, two retries); the teacher broadcaster's `tokio::time::sleep`-driven
//! advertise loop is the structural reference for using `tokio::time` here
//! instead of a hand-rolled timer wheel. The scan -> connect -> discover ->
//! version-resolve -> FSM-dispatch -> `SecuredChannel` pipeline is this
//! module's own addition: every upcall in `TransportDelegate` is implemented
//! here, each peripheral's `GattMessageStream` delegate routes back into a
//! `Weak<Self>`, and a per-peripheral session is driven on the single
//! cooperative executor via `tokio::task::spawn_local`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::association::{self, AssociationUserInteraction, InboundHandshakeMessages};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::handshake::HandshakeLibrary;
use crate::message_stream::{GattMessageStream, MessageStream, MessageStreamDelegate};
use crate::model::{
    Advertisement, MessageParams, PeripheralId, Recipient, ReconnectionAdvertisementPayload, SecurityVersion,
};
use crate::reconnection::{self, InboundReconnectionMessages};
use crate::secret_store::SecretStore;
use crate::secured_channel::SecuredChannel;
use crate::token_provider::CoalescingTokenProvider;
use crate::transport::{CharacteristicId, RadioState, Transport, TransportDelegate};
use crate::version_resolver;

const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Idle,
    Association,
    Reconnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeripheralState {
    Discovered,
    Connecting { attempt: u8 },
    Connected,
    Disconnected,
}

struct PeripheralEntry {
    state: PeripheralState,
}

/// Resolves the advertised name for a discovered peripheral (SPEC_FULL.md
/// 4.9): a scan-response data entry keyed by `data_uuid` wins if present,
/// decoded as UTF-8 when it is exactly 8 bytes, else rendered as hex; absent
/// that, the platform-provided local name is used. `prefix` is only applied
/// to the hex and local-name fallbacks, never to the 8-byte UTF-8 form.
pub fn resolve_advertised_name(advertisement: &Advertisement, data_uuid: Uuid, prefix: &str) -> Option<String> {
    if let Some(bytes) = advertisement.service_data.get(&data_uuid) {
        if bytes.len() == 8 {
            if let Ok(name) = std::str::from_utf8(bytes) {
                return Some(name.to_string());
            }
        }
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        return Some(format!("{prefix}{hex}"));
    }
    advertisement.local_name.as_ref().map(|name| format!("{prefix}{name}"))
}

/// Bridges the push-style `GattMessageStream` delegate callback to the
/// pull-style `InboundHandshakeMessages`/`InboundReconnectionMessages`
/// traits the association/reconnection FSMs read from.
struct InboundQueue {
    receiver: RefCell<mpsc::UnboundedReceiver<Vec<u8>>>,
    peripheral: PeripheralId,
}

#[async_trait(?Send)]
impl InboundHandshakeMessages for InboundQueue {
    async fn next(&self) -> CoreResult<Vec<u8>> {
        self.receiver.borrow_mut().recv().await.ok_or(CoreError::Disconnected { peripheral: self.peripheral })
    }
}

#[async_trait(?Send)]
impl InboundReconnectionMessages for InboundQueue {
    async fn next(&self) -> CoreResult<Vec<u8>> {
        self.receiver.borrow_mut().recv().await.ok_or(CoreError::Disconnected { peripheral: self.peripheral })
    }
}

/// Forwards a `GattMessageStream`'s delegate callbacks back into the owning
/// `ConnectionManager`: to the peripheral's inbound queue while a handshake
/// FSM is running, or into its `SecuredChannel` once one has been
/// established. Held by `Weak` since the manager owns the stream that owns
/// this delegate.
struct RoutingDelegate<T: Transport> {
    manager: Weak<ConnectionManager<T>>,
    peripheral: PeripheralId,
}

#[async_trait(?Send)]
impl<T: Transport + 'static> MessageStreamDelegate for RoutingDelegate<T> {
    async fn on_message(&self, data: Vec<u8>, params: MessageParams) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_stream_message(self.peripheral, data, params);
        }
    }

    async fn on_write_complete(&self, _recipient: Recipient) {}

    async fn on_write_error(&self, recipient: Recipient, error: CoreError) {
        log::warn!("write to recipient {recipient} on peripheral {:?} failed: {error}", self.peripheral);
    }

    async fn on_unrecoverable_error(&self, error: CoreError) {
        log::error!("unrecoverable stream error for peripheral {:?}: {error}", self.peripheral);
        if let Some(manager) = self.manager.upgrade() {
            if let Some(channel) = manager.channels.borrow_mut().remove(&self.peripheral) {
                channel.invalidate();
            }
        }
    }
}

/// Orchestrates scanning mode, connection attempts, retry scheduling, and
/// the GATT session pipeline that turns a connected peripheral into a
/// `SecuredChannel`. Not `Send`/`Sync`: built from `Rc`/`RefCell`, so it
/// must live on the single cooperative executor (SPEC_FULL.md 5.1).
pub struct ConnectionManager<T: Transport> {
    transport: Rc<T>,
    store: Rc<dyn SecretStore>,
    config: CoreConfig,
    handshake: Rc<dyn HandshakeLibrary>,
    interaction: Rc<dyn AssociationUserInteraction>,
    token_provider: Rc<CoalescingTokenProvider>,
    radio_state: RefCell<RadioState>,
    scan_mode: RefCell<ScanMode>,
    peripherals: RefCell<HashMap<PeripheralId, PeripheralEntry>>,
    secured: RefCell<HashSet<PeripheralId>>,
    data_characteristics: RefCell<HashMap<PeripheralId, CharacteristicId>>,
    inbound_senders: RefCell<HashMap<PeripheralId, mpsc::UnboundedSender<Vec<u8>>>>,
    streams: RefCell<HashMap<PeripheralId, Rc<GattMessageStream<T>>>>,
    channels: RefCell<HashMap<PeripheralId, Rc<SecuredChannel>>>,
    pending_reconnection: RefCell<HashMap<PeripheralId, reconnection::MatchedAdvertisement>>,
    self_ref: Weak<ConnectionManager<T>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: Rc<T>,
        store: Rc<dyn SecretStore>,
        config: CoreConfig,
        handshake: Rc<dyn HandshakeLibrary>,
        interaction: Rc<dyn AssociationUserInteraction>,
        token_provider: Rc<CoalescingTokenProvider>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            transport,
            store,
            config,
            handshake,
            interaction,
            token_provider,
            radio_state: RefCell::new(RadioState::PoweredOff),
            scan_mode: RefCell::new(ScanMode::Idle),
            peripherals: RefCell::new(HashMap::new()),
            secured: RefCell::new(HashSet::new()),
            data_characteristics: RefCell::new(HashMap::new()),
            inbound_senders: RefCell::new(HashMap::new()),
            streams: RefCell::new(HashMap::new()),
            channels: RefCell::new(HashMap::new()),
            pending_reconnection: RefCell::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn scan_mode(&self) -> ScanMode {
        *self.scan_mode.borrow()
    }

    /// Upcall: radio power state changed. Powering off cancels all pending
    /// work and marks every peripheral disconnected; powering on resumes
    /// whatever scan mode was last requested.
    pub async fn on_radio_state_changed(&self, state: RadioState) -> CoreResult<()> {
        let previous = *self.radio_state.borrow();
        *self.radio_state.borrow_mut() = state;
        if state != RadioState::PoweredOn {
            self.peripherals.borrow_mut().clear();
            self.secured.borrow_mut().clear();
            return Ok(());
        }
        if previous != RadioState::PoweredOn {
            match *self.scan_mode.borrow() {
                ScanMode::Association => self.start_association_scan().await?,
                ScanMode::Reconnection => self.start_reconnection_scan().await?,
                ScanMode::Idle => {}
            }
        }
        Ok(())
    }

    fn association_scan_uuids(&self) -> Vec<Uuid> {
        let mut uuids = vec![self.config.association_service_uuid];
        if let Some(beacon) = self.config.beacon_uuid {
            uuids.push(beacon);
        }
        uuids
    }

    fn reconnection_scan_uuids(&self) -> Vec<Uuid> {
        let mut uuids = vec![self.config.reconnection_service_uuid];
        if let Some(beacon) = self.config.beacon_uuid {
            uuids.push(beacon);
        }
        uuids
    }

    pub async fn start_association_scan(&self) -> CoreResult<()> {
        *self.scan_mode.borrow_mut() = ScanMode::Association;
        if *self.radio_state.borrow() != RadioState::PoweredOn {
            return Ok(());
        }
        self.transport.stop_scan().await?;
        self.transport.scan(self.association_scan_uuids()).await
    }

    pub async fn start_reconnection_scan(&self) -> CoreResult<()> {
        *self.scan_mode.borrow_mut() = ScanMode::Reconnection;
        if *self.radio_state.borrow() != RadioState::PoweredOn {
            return Ok(());
        }
        self.transport.stop_scan().await?;
        self.transport.scan(self.reconnection_scan_uuids()).await
    }

    /// Candidates for reconnection advertisement matching: every associated
    /// car that still has a reconnection key on file.
    fn reconnection_candidates(&self) -> Vec<reconnection::Candidate> {
        self.store
            .list_car_ids()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.store.get_key(id).ok().flatten().map(|key| reconnection::Candidate { car_id: id, key }))
            .collect()
    }

    /// Upcall: a peripheral was discovered. A peripheral already bound to
    /// a live secured channel is treated as stale and disconnected rather
    /// than reconnected to.
    pub async fn on_discovered(&self, peripheral: PeripheralId) -> CoreResult<()> {
        if self.secured.borrow().contains(&peripheral) {
            self.transport.cancel_connection(peripheral).await?;
            return Ok(());
        }
        let should_connect = {
            let mut peripherals = self.peripherals.borrow_mut();
            match peripherals.get(&peripheral).map(|e| e.state) {
                None | Some(PeripheralState::Disconnected) => {
                    peripherals.insert(peripheral, PeripheralEntry { state: PeripheralState::Discovered });
                    true
                }
                _ => false,
            }
        };
        if should_connect {
            self.connect_with_retry(peripheral).await?;
        }
        Ok(())
    }

    async fn connect_with_retry(&self, peripheral: PeripheralId) -> CoreResult<()> {
        self.peripherals.borrow_mut().insert(peripheral, PeripheralEntry { state: PeripheralState::Connecting { attempt: 0 } });
        self.transport.connect(peripheral).await
    }

    /// Upcall: a connect attempt failed. Schedules the next retry per
    /// `RETRY_DELAYS`, or gives up and resumes scanning once both retries
    /// are exhausted.
    pub async fn on_connect_failed(&self, peripheral: PeripheralId) -> CoreResult<()> {
        let attempt = match self.peripherals.borrow().get(&peripheral).map(|e| e.state) {
            Some(PeripheralState::Connecting { attempt }) => attempt,
            _ => return Ok(()),
        };
        if (attempt as usize) >= RETRY_DELAYS.len() {
            self.peripherals.borrow_mut().insert(peripheral, PeripheralEntry { state: PeripheralState::Disconnected });
            return Ok(());
        }
        let delay = RETRY_DELAYS[attempt as usize];
        self.peripherals
            .borrow_mut()
            .insert(peripheral, PeripheralEntry { state: PeripheralState::Connecting { attempt: attempt + 1 } });
        tokio::time::sleep(delay).await;
        self.transport.connect(peripheral).await
    }

    pub fn on_connected(&self, peripheral: PeripheralId) {
        self.peripherals.borrow_mut().insert(peripheral, PeripheralEntry { state: PeripheralState::Connected });
    }

    pub fn on_channel_secured(&self, peripheral: PeripheralId) {
        self.secured.borrow_mut().insert(peripheral);
    }

    pub async fn on_disconnected(&self, peripheral: PeripheralId) -> CoreResult<()> {
        self.peripherals.borrow_mut().insert(peripheral, PeripheralEntry { state: PeripheralState::Disconnected });
        self.secured.borrow_mut().remove(&peripheral);
        Ok(())
    }

    /// Removes all persisted state for `car_id`, disconnects its
    /// peripheral if one is tracked under the same identifier, and
    /// resumes reconnection scanning for the remaining associated fleet.
    pub async fn dissociate(&self, car_id: Uuid, peripheral: Option<PeripheralId>) -> CoreResult<()> {
        self.store.dissociate(car_id).map_err(|_| CoreError::CannotStoreAssociation("dissociate".into()))?;
        if let Some(peripheral) = peripheral {
            self.transport.cancel_connection(peripheral).await?;
            self.secured.borrow_mut().remove(&peripheral);
        }
        self.start_reconnection_scan().await
    }

    /// Routes a decoded inbound message: to the live `SecuredChannel` if
    /// one exists for this peripheral, otherwise to the handshake-phase
    /// inbound queue.
    fn handle_stream_message(&self, peripheral: PeripheralId, data: Vec<u8>, params: MessageParams) {
        if let Some(channel) = self.channels.borrow().get(&peripheral).cloned() {
            if let Err(err) = channel.handle_inbound(data, params) {
                log::warn!("secured channel dispatch failed for peripheral {:?}: {err}", peripheral);
            }
            return;
        }
        if let Some(sender) = self.inbound_senders.borrow().get(&peripheral) {
            let _ = sender.send(data);
        }
    }

}

impl<T: Transport + 'static> ConnectionManager<T> {
    /// Builds the `GattMessageStream` and inbound queue for a newly
    /// characteristic-discovered peripheral, then spawns the session task
    /// that drives version resolution, FSM dispatch and `SecuredChannel`
    /// construction on the local executor.
    fn spawn_session(self: &Rc<Self>, peripheral: PeripheralId, characteristic: CharacteristicId) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound_senders.borrow_mut().insert(peripheral, tx);

        let delegate: Rc<dyn MessageStreamDelegate> = Rc::new(RoutingDelegate { manager: self.self_ref.clone(), peripheral });
        let stream = Rc::new(GattMessageStream::new(
            self.transport.clone(),
            peripheral,
            characteristic,
            delegate,
            self.config.message_compression_allowed,
        ));
        self.streams.borrow_mut().insert(peripheral, stream.clone());

        let inbound = InboundQueue { receiver: RefCell::new(rx), peripheral };
        let manager = self.clone();
        tokio::task::spawn_local(async move {
            if let Err(err) = manager.run_session(peripheral, stream, inbound).await {
                log::warn!("session for peripheral {:?} failed: {err}", peripheral);
            }
        });
    }

    /// Drives one peripheral's session end to end: version resolution and
    /// FSM dispatch for an association scan, or matched-candidate
    /// challenge/response for a reconnection scan, then stores the
    /// resulting `SecuredChannel`.
    async fn run_session(
        self: Rc<Self>,
        peripheral: PeripheralId,
        stream: Rc<GattMessageStream<T>>,
        inbound: InboundQueue,
    ) -> CoreResult<()> {
        let mode = self.scan_mode();
        let recipient = match mode {
            ScanMode::Association => self.config.association_data_uuid,
            ScanMode::Reconnection => self.config.reconnection_data_uuid,
            ScanMode::Idle => return Ok(()),
        };

        let (car_id, role) = match mode {
            ScanMode::Association => {
                let raw = tokio::time::timeout(
                    association::ASSOCIATION_TIMEOUT,
                    InboundHandshakeMessages::next(&inbound),
                )
                .await
                .map_err(|_| CoreError::TimedOut)??;
                let peer_reply: version_resolver::VersionExchange = serde_json::from_slice(&raw)?;
                let (_stream_version, security_version) =
                    version_resolver::resolve_version(stream.as_ref(), recipient, peer_reply).await?;
                let token = self.handshake.prepare_verification().await?;

                let outcome = match security_version {
                    SecurityVersion::V1 => {
                        let device_id = self.store.device_id()?;
                        association::run_v1(
                            stream.as_ref(),
                            &inbound,
                            self.handshake.as_ref(),
                            self.store.as_ref(),
                            self.interaction.as_ref(),
                            recipient,
                            device_id,
                            token,
                        )
                        .await?
                    }
                    SecurityVersion::V2 | SecurityVersion::V3 => {
                        association::run_v2_v3(
                            stream.as_ref(),
                            &inbound,
                            self.handshake.as_ref(),
                            self.store.as_ref(),
                            self.interaction.as_ref(),
                            recipient,
                            token,
                        )
                        .await?
                    }
                    SecurityVersion::V4 => {
                        association::run_v4(
                            stream.as_ref(),
                            &inbound,
                            self.handshake.as_ref(),
                            self.store.as_ref(),
                            self.interaction.as_ref(),
                            self.token_provider.as_ref(),
                            recipient,
                            token,
                            None,
                        )
                        .await?
                    }
                };
                (outcome.car_id, outcome.role)
            }
            ScanMode::Reconnection => {
                let matched = self
                    .pending_reconnection
                    .borrow_mut()
                    .remove(&peripheral)
                    .ok_or(CoreError::UnassociatedCar)?;
                let outcome = reconnection::run(
                    stream.as_ref(),
                    &inbound,
                    self.handshake.as_ref(),
                    self.store.as_ref(),
                    recipient,
                    matched,
                    None,
                )
                .await?;
                (outcome.car_id, outcome.role)
            }
            ScanMode::Idle => return Ok(()),
        };

        let dyn_stream: Rc<dyn MessageStream> = stream.clone();
        let channel = Rc::new(SecuredChannel::new(car_id, dyn_stream, role));
        self.channels.borrow_mut().insert(peripheral, channel);
        self.on_channel_secured(peripheral);
        Ok(())
    }
}

#[async_trait(?Send)]
impl<T: Transport + 'static> TransportDelegate for ConnectionManager<T> {
    async fn state_changed(&self, state: RadioState) {
        if let Err(err) = self.on_radio_state_changed(state).await {
            log::warn!("radio state change handling failed: {err}");
        }
    }

    async fn restored(&self, peripherals: Vec<PeripheralId>) {
        for peripheral in peripherals {
            if let Err(err) = self.on_discovered(peripheral).await {
                log::warn!("restoring peripheral {:?} failed: {err}", peripheral);
            }
        }
    }

    async fn discovered(&self, peripheral: PeripheralId, advertisement: Advertisement, _rssi: i16) {
        let mode = self.scan_mode();
        let data_uuid = match mode {
            ScanMode::Association => self.config.association_data_uuid,
            ScanMode::Reconnection => self.config.reconnection_data_uuid,
            ScanMode::Idle => return,
        };
        let name = resolve_advertised_name(&advertisement, data_uuid, &self.config.advertised_name_prefix);
        log::debug!("discovered peripheral {:?} advertised as {:?}", peripheral, name);

        if mode == ScanMode::Reconnection {
            let matched = advertisement
                .service_data
                .get(&self.config.reconnection_service_uuid)
                .and_then(|bytes| ReconnectionAdvertisementPayload::from_bytes(bytes))
                .and_then(|payload| reconnection::match_advertisement(payload, &self.reconnection_candidates()));
            match matched {
                Some(matched) => {
                    self.pending_reconnection.borrow_mut().insert(peripheral, matched);
                }
                None => return,
            }
        }

        if let Err(err) = self.on_discovered(peripheral).await {
            log::warn!("discovery handling failed for peripheral {:?}: {err}", peripheral);
        }
    }

    async fn connected(&self, peripheral: PeripheralId) {
        self.on_connected(peripheral);
        let service = match self.scan_mode() {
            ScanMode::Association => self.config.association_service_uuid,
            ScanMode::Reconnection => self.config.reconnection_service_uuid,
            ScanMode::Idle => return,
        };
        if let Err(err) = self.transport.discover_services(peripheral, vec![service]).await {
            log::warn!("service discovery request failed for peripheral {:?}: {err}", peripheral);
        }
    }

    async fn disconnected(&self, peripheral: PeripheralId) {
        if let Err(err) = self.on_disconnected(peripheral).await {
            log::warn!("disconnect handling failed for peripheral {:?}: {err}", peripheral);
        }
        self.data_characteristics.borrow_mut().remove(&peripheral);
        self.inbound_senders.borrow_mut().remove(&peripheral);
        self.streams.borrow_mut().remove(&peripheral);
        if let Some(channel) = self.channels.borrow_mut().remove(&peripheral) {
            channel.invalidate();
        }
        self.pending_reconnection.borrow_mut().remove(&peripheral);
    }

    async fn connect_failed(&self, peripheral: PeripheralId) {
        if let Err(err) = self.on_connect_failed(peripheral).await {
            log::warn!("connect-failed handling errored for peripheral {:?}: {err}", peripheral);
        }
    }

    async fn services_discovered(&self, peripheral: PeripheralId) {
        let (service, data_uuid) = match self.scan_mode() {
            ScanMode::Association => (self.config.association_service_uuid, self.config.association_data_uuid),
            ScanMode::Reconnection => (self.config.reconnection_service_uuid, self.config.reconnection_data_uuid),
            ScanMode::Idle => return,
        };
        if let Err(err) = self.transport.discover_characteristics(peripheral, vec![data_uuid], service).await {
            log::warn!("characteristic discovery request failed for peripheral {:?}: {err}", peripheral);
        }
    }

    async fn characteristics_discovered(&self, peripheral: PeripheralId, characteristics: Vec<(Uuid, CharacteristicId)>) {
        let data_uuid = match self.scan_mode() {
            ScanMode::Association => self.config.association_data_uuid,
            ScanMode::Reconnection => self.config.reconnection_data_uuid,
            ScanMode::Idle => return,
        };
        let characteristic = match characteristics.into_iter().find(|(uuid, _)| *uuid == data_uuid) {
            Some((_, id)) => id,
            None => {
                log::warn!("peripheral {:?} did not expose the expected data characteristic", peripheral);
                return;
            }
        };
        self.data_characteristics.borrow_mut().insert(peripheral, characteristic);
        if let Err(err) = self.transport.set_notify(peripheral, characteristic, true).await {
            log::warn!("enabling notifications failed for peripheral {:?}: {err}", peripheral);
            return;
        }
        if let Some(manager) = self.self_ref.upgrade() {
            manager.spawn_session(peripheral, characteristic);
        }
    }

    async fn value_updated(&self, peripheral: PeripheralId, _characteristic: CharacteristicId, value: Vec<u8>) {
        let stream = self.streams.borrow().get(&peripheral).cloned();
        if let Some(stream) = stream {
            stream.handle_incoming(value).await;
        }
    }

    async fn ready_to_write(&self, _peripheral: PeripheralId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{HandshakeSession, VerificationToken};
    use crate::model::SessionBlob;
    use std::cell::RefCell as StdRefCell;

    #[derive(Default)]
    struct RecordingTransport {
        scans: StdRefCell<Vec<Vec<Uuid>>>,
        connects: StdRefCell<Vec<PeripheralId>>,
        cancellations: StdRefCell<Vec<PeripheralId>>,
        /// Lets a test react synchronously to a written GATT payload, e.g.
        /// to hand back a challenge response computed from the bytes just
        /// written, without needing a second concurrently-scheduled task.
        on_write: StdRefCell<Option<Box<dyn Fn(&[u8])>>>,
    }

    #[async_trait(?Send)]
    impl Transport for RecordingTransport {
        async fn scan(&self, service_uuids: Vec<Uuid>) -> CoreResult<()> {
            self.scans.borrow_mut().push(service_uuids);
            Ok(())
        }
        async fn stop_scan(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn connect(&self, peripheral: PeripheralId) -> CoreResult<()> {
            self.connects.borrow_mut().push(peripheral);
            Ok(())
        }
        async fn cancel_connection(&self, peripheral: PeripheralId) -> CoreResult<()> {
            self.cancellations.borrow_mut().push(peripheral);
            Ok(())
        }
        async fn discover_services(&self, _: PeripheralId, _: Vec<Uuid>) -> CoreResult<()> {
            Ok(())
        }
        async fn discover_characteristics(&self, _: PeripheralId, _: Vec<Uuid>, _: Uuid) -> CoreResult<()> {
            Ok(())
        }
        async fn read(&self, _: PeripheralId, _: crate::transport::CharacteristicId) -> CoreResult<()> {
            Ok(())
        }
        async fn write_no_response(&self, _: PeripheralId, data: Vec<u8>, _: crate::transport::CharacteristicId) -> CoreResult<()> {
            if let Some(cb) = self.on_write.borrow().as_ref() {
                cb(&data);
            }
            Ok(())
        }
        async fn set_notify(&self, _: PeripheralId, _: crate::transport::CharacteristicId, _: bool) -> CoreResult<()> {
            Ok(())
        }
    }

    struct FakeSession;

    #[async_trait(?Send)]
    impl HandshakeSession for FakeSession {
        async fn notify_pairing_code_accepted(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn save(&self) -> CoreResult<SessionBlob> {
            Ok(SessionBlob(vec![9, 9, 9]))
        }
    }

    struct FakeHandshake;

    #[async_trait(?Send)]
    impl HandshakeLibrary for FakeHandshake {
        async fn prepare_verification(&self) -> CoreResult<VerificationToken> {
            Ok(VerificationToken { pairing_code: "445566".into(), full_verification_data: vec![1, 2, 3] })
        }
        async fn establish(&self) -> CoreResult<Box<dyn HandshakeSession>> {
            Ok(Box::new(FakeSession))
        }
        async fn resume_from(&self, _blob: &SessionBlob) -> CoreResult<Box<dyn HandshakeSession>> {
            Ok(Box::new(FakeSession))
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

    fn manager() -> Rc<ConnectionManager<RecordingTransport>> {
        let store: Rc<dyn SecretStore> = Rc::new(crate::secret_store::SqliteSecretStore::open_in_memory().unwrap());
        let handshake: Rc<dyn HandshakeLibrary> = Rc::new(FakeHandshake);
        let interaction: Rc<dyn AssociationUserInteraction> = Rc::new(AlwaysAccept);
        let token_provider = Rc::new(CoalescingTokenProvider::new());
        ConnectionManager::new(Rc::new(RecordingTransport::default()), store, CoreConfig::default(), handshake, interaction, token_provider)
    }

    #[tokio::test]
    async fn powering_on_resumes_requested_scan_mode() {
        let mgr = manager();
        mgr.start_association_scan().await.unwrap();
        mgr.on_radio_state_changed(RadioState::PoweredOn).await.unwrap();
        assert_eq!(mgr.transport.scans.borrow().len(), 1);
    }

    #[tokio::test]
    async fn already_secured_peripheral_rediscovery_is_disconnected() {
        let mgr = manager();
        let peripheral = PeripheralId(1);
        mgr.on_channel_secured(peripheral);
        mgr.on_discovered(peripheral).await.unwrap();
        assert_eq!(mgr.transport.cancellations.borrow().len(), 1);
        assert!(mgr.transport.connects.borrow().is_empty());
    }

    #[tokio::test]
    async fn fresh_peripheral_triggers_connect() {
        let mgr = manager();
        let peripheral = PeripheralId(2);
        mgr.on_discovered(peripheral).await.unwrap();
        assert_eq!(mgr.transport.connects.borrow().len(), 1);
    }

    #[tokio::test]
    async fn dissociate_clears_store_and_resumes_reconnection_scan() {
        let mgr = manager();
        let car_id = Uuid::new_v4();
        mgr.store
            .put_key(car_id, &crate::model::ReconnectionKey([1u8; 32]))
            .unwrap();
        mgr.dissociate(car_id, None).await.unwrap();
        assert!(mgr.store.get_key(car_id).unwrap().is_none());
        assert_eq!(mgr.scan_mode(), ScanMode::Reconnection);
    }

    #[tokio::test]
    async fn association_scan_includes_beacon_uuid_when_configured() {
        let beacon = Uuid::new_v4();
        let mut config = CoreConfig::default();
        config.beacon_uuid = Some(beacon);
        let store: Rc<dyn SecretStore> = Rc::new(crate::secret_store::SqliteSecretStore::open_in_memory().unwrap());
        let handshake: Rc<dyn HandshakeLibrary> = Rc::new(FakeHandshake);
        let interaction: Rc<dyn AssociationUserInteraction> = Rc::new(AlwaysAccept);
        let token_provider = Rc::new(CoalescingTokenProvider::new());
        let mgr = ConnectionManager::new(Rc::new(RecordingTransport::default()), store, config, handshake, interaction, token_provider);

        mgr.on_radio_state_changed(RadioState::PoweredOn).await.unwrap();
        mgr.start_association_scan().await.unwrap();

        assert!(mgr.transport.scans.borrow().last().unwrap().contains(&beacon));
    }

    #[test]
    fn resolves_eight_byte_scan_response_data_as_utf8_without_prefix() {
        let uuid = Uuid::new_v4();
        let mut advertisement = Advertisement::default();
        advertisement.service_data.insert(uuid, b"ABCDEFGH".to_vec());
        let name = resolve_advertised_name(&advertisement, uuid, "My-");
        assert_eq!(name.as_deref(), Some("ABCDEFGH"));
    }

    #[test]
    fn resolves_non_eight_byte_scan_response_data_as_prefixed_hex() {
        let uuid = Uuid::new_v4();
        let mut advertisement = Advertisement::default();
        advertisement.service_data.insert(uuid, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let name = resolve_advertised_name(&advertisement, uuid, "My-");
        assert_eq!(name.as_deref(), Some("My-deadbeef"));
    }

    #[test]
    fn falls_back_to_prefixed_local_name_when_no_scan_response_data() {
        let uuid = Uuid::new_v4();
        let advertisement = Advertisement { local_name: Some("Garage".into()), ..Default::default() };
        let name = resolve_advertised_name(&advertisement, uuid, "My-");
        assert_eq!(name.as_deref(), Some("My-Garage"));
    }

    #[tokio::test]
    async fn run_session_v1_association_produces_secured_channel() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mgr = manager();
                mgr.start_association_scan().await.unwrap();

                let peripheral = PeripheralId(9);
                let characteristic = crate::transport::CharacteristicId(3);
                let (tx, rx) = mpsc::unbounded_channel();
                let delegate: Rc<dyn MessageStreamDelegate> =
                    Rc::new(RoutingDelegate { manager: Rc::downgrade(&mgr), peripheral });
                let stream = Rc::new(GattMessageStream::new(mgr.transport.clone(), peripheral, characteristic, delegate, true));
                let inbound = InboundQueue { receiver: RefCell::new(rx), peripheral };

                let car_id = Uuid::new_v4();
                let peer_versions = version_resolver::VersionExchange {
                    min_stream_version: 1,
                    max_stream_version: 2,
                    min_security_version: 1,
                    max_security_version: 1,
                };
                tx.send(serde_json::to_vec(&peer_versions).unwrap()).unwrap();
                tx.send(car_id.as_bytes().to_vec()).unwrap();
                tx.send(b"True".to_vec()).unwrap();

                mgr.clone().run_session(peripheral, stream, inbound).await.unwrap();

                assert!(mgr.channels.borrow().contains_key(&peripheral));
                assert!(mgr.store.get_key(car_id).unwrap().is_some());
            })
            .await;
    }

    #[tokio::test]
    async fn run_session_reconnection_produces_secured_channel() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mgr = manager();
                mgr.start_reconnection_scan().await.unwrap();

                let car_id = Uuid::new_v4();
                let key = crate::model::ReconnectionKey([4u8; 32]);
                mgr.store.put_key(car_id, &key).unwrap();
                mgr.store.put_session(car_id, &SessionBlob(vec![1, 2, 3])).unwrap();

                let peripheral = PeripheralId(11);
                let characteristic = crate::transport::CharacteristicId(4);

                let (tx, rx) = mpsc::unbounded_channel();
                // `reconnection::run` draws its own random challenge salt, so
                // the response is computed from whatever salt actually gets
                // written rather than a value fixed ahead of time.
                let key_bytes = key.0;
                *mgr.transport.on_write.borrow_mut() = Some(Box::new(move |data: &[u8]| {
                    let envelope: crate::message_stream::shapes::WireEnvelope = serde_json::from_slice(data).unwrap();
                    let challenge_salt = &envelope.payload[32..48];
                    let response = crate::crypto::hmac_sha256(&key_bytes, challenge_salt).to_vec();
                    let _ = tx.send(response);
                }));

                let delegate: Rc<dyn MessageStreamDelegate> =
                    Rc::new(RoutingDelegate { manager: Rc::downgrade(&mgr), peripheral });
                let stream = Rc::new(GattMessageStream::new(mgr.transport.clone(), peripheral, characteristic, delegate, true));
                let inbound = InboundQueue { receiver: RefCell::new(rx), peripheral };

                let matched = reconnection::MatchedAdvertisement { car_id, key: key.clone(), full_hmac: [1u8; 32] };
                mgr.pending_reconnection.borrow_mut().insert(peripheral, matched);

                mgr.clone().run_session(peripheral, stream, inbound).await.unwrap();

                assert!(mgr.channels.borrow().contains_key(&peripheral));
            })
            .await;
    }
}
