//! External BLE transport interface (SPEC_FULL.md 6). Acquiring a physical
//! radio is explicitly out of scope for this core; this module only defines
//! the capability boundary and the upcalls the connection manager reacts to.
//! `src/bin/companion_demo.rs` provides the only real implementation, backed
//! by `bluer`, behind the `ble-transport` feature.

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::{Advertisement, PeripheralId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicId(pub u16);

/// Upcalls delivered by the transport, always on the core's single
/// executor.
#[async_trait(?Send)]
pub trait TransportDelegate {
    async fn state_changed(&self, state: RadioState);
    async fn restored(&self, peripherals: Vec<PeripheralId>);
    async fn discovered(&self, peripheral: PeripheralId, advertisement: Advertisement, rssi: i16);
    async fn connected(&self, peripheral: PeripheralId);
    async fn disconnected(&self, peripheral: PeripheralId);
    async fn connect_failed(&self, peripheral: PeripheralId);
    async fn services_discovered(&self, peripheral: PeripheralId);
    async fn characteristics_discovered(&self, peripheral: PeripheralId, characteristics: Vec<(uuid::Uuid, CharacteristicId)>);
    async fn value_updated(&self, peripheral: PeripheralId, characteristic: CharacteristicId, value: Vec<u8>);
    async fn ready_to_write(&self, peripheral: PeripheralId);
}

/// Capability set consumed by the connection manager. Scanning is filtered
/// by service UUID only; the association/reconnection service UUID sets
/// live in `CoreConfig`.
#[async_trait(?Send)]
pub trait Transport {
    async fn scan(&self, service_uuids: Vec<uuid::Uuid>) -> CoreResult<()>;
    async fn stop_scan(&self) -> CoreResult<()>;
    async fn connect(&self, peripheral: PeripheralId) -> CoreResult<()>;
    async fn cancel_connection(&self, peripheral: PeripheralId) -> CoreResult<()>;
    async fn discover_services(&self, peripheral: PeripheralId, uuids: Vec<uuid::Uuid>) -> CoreResult<()>;
    async fn discover_characteristics(
        &self,
        peripheral: PeripheralId,
        uuids: Vec<uuid::Uuid>,
        service: uuid::Uuid,
    ) -> CoreResult<()>;
    async fn read(&self, peripheral: PeripheralId, characteristic: CharacteristicId) -> CoreResult<()>;
    async fn write_no_response(
        &self,
        peripheral: PeripheralId,
        data: Vec<u8>,
        characteristic: CharacteristicId,
    ) -> CoreResult<()>;
    async fn set_notify(&self, peripheral: PeripheralId, characteristic: CharacteristicId, enabled: bool) -> CoreResult<()>;
}
