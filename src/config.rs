//! Configurable overlay (SPEC_FULL.md 6 / 6.1).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub association_service_uuid: Uuid,
    pub association_data_uuid: Uuid,
    pub reconnection_service_uuid: Uuid,
    pub reconnection_data_uuid: Uuid,
    pub beacon_uuid: Option<Uuid>,
    pub message_compression_allowed: bool,
    pub unlock_history_enabled: bool,
    /// Prepended to the resolved advertised name, except when the name was
    /// recovered from the 8-byte UTF-8 scan-response form (SPEC_FULL.md
    /// 4.9). Not part of the source's documented overlay keys; added here
    /// since the resolution algorithm is otherwise unconfigurable.
    pub advertised_name_prefix: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            association_service_uuid: Uuid::parse_str("5e2a6838-0c3a-4c4d-b1b3-1f4a5c0b9e01")
                .expect("valid literal uuid"),
            association_data_uuid: Uuid::parse_str("5e2a6838-0c3a-4c4d-b1b3-1f4a5c0b9e02")
                .expect("valid literal uuid"),
            reconnection_service_uuid: Uuid::parse_str("5e2a6838-0c3a-4c4d-b1b3-1f4a5c0b9e03")
                .expect("valid literal uuid"),
            reconnection_data_uuid: Uuid::parse_str("5e2a6838-0c3a-4c4d-b1b3-1f4a5c0b9e04")
                .expect("valid literal uuid"),
            beacon_uuid: None,
            message_compression_allowed: true,
            unlock_history_enabled: true,
            advertised_name_prefix: String::new(),
        }
    }
}
