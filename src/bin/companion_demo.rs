//! Demo binary: advertises a reconnection payload for an already-associated
//! car, the way a head unit would between association attempts. Adapted
//! directly from the teacher broadcaster's `#[tokio::main]` + `env_logger`
//! + `bluer::Session` wiring; the HMAC-sign-then-advertise loop is the same
//! shape, just signing the 11-byte reconnection payload instead of a
//! transport notification.

use std::collections::BTreeMap;
use std::time::Duration;

use bluer::adv::Advertisement;
use companion_protocol_core::crypto;
use companion_protocol_core::model::{ReconnectionAdvertisementPayload, ReconnectionKey};

const MANUFACTURER_ID: u16 = 0xFFFE;

fn build_payload(key: &ReconnectionKey) -> ReconnectionAdvertisementPayload {
    let salt: [u8; 8] = crypto::random_array();
    let mut padded = [0u8; 16];
    padded[0..8].copy_from_slice(&salt);
    let full = crypto::hmac_sha256(&key.0, &padded);
    let truncated_hmac = crypto::truncate::<3>(&full);
    ReconnectionAdvertisementPayload { truncated_hmac, salt }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> bluer::Result<()> {
    env_logger::init();

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    log::info!(
        "Advertising reconnection payloads on adapter {} [{}]",
        adapter.name(),
        adapter.address().await?
    );

    // Demo key; a real deployment reads this from the secret store for
    // each associated car instead of generating one on the spot.
    let key = ReconnectionKey(crypto::random_array());

    loop {
        let payload = build_payload(&key);
        let mut service_data = BTreeMap::new();
        let reconnection_service_uuid = companion_protocol_core::config::CoreConfig::default().reconnection_service_uuid;
        service_data.insert(reconnection_service_uuid, payload.to_bytes().to_vec());

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Broadcast,
            service_data,
            manufacturer_data: BTreeMap::from([(MANUFACTURER_ID, Vec::new())]),
            min_interval: Some(Duration::from_millis(100)),
            max_interval: Some(Duration::from_millis(100)),
            local_name: Some("CompanionHeadUnit".to_string()),
            ..Default::default()
        };

        let handle = adapter.advertise(adv).await?;
        log::debug!("advertising reconnection salt {:02x?} for 5s", payload.salt);
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(handle);
    }
}
