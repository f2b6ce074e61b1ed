//! Inbound MQTT messages from the line backend
//!
//! The backend pushes JSON objects of the form `{"type": ..., "data": {...}}`
//! on the data and response topics. Known types are decoded into typed
//! structs; anything else is kept by name only.

use crate::infra::metrics::Metrics;
use crate::services::events::{CheckpointEvent, EventSender};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProductionData {
    pub daily_production: Option<u64>,
    pub current_load: Option<u64>,
    pub line_runtime: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    pub line_status: Option<String>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn is_normal(&self) -> bool {
        self.line_status.as_deref() == Some("normal")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RfidData {
    pub tray_id: Option<String>,
    pub fetch_content: Option<String>,
    pub load_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ProductionData(ProductionData),
    StatusUpdate(StatusUpdate),
    RfidData(RfidData),
    /// Valid JSON with an unrecognised `type`
    Other { kind: String },
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::ProductionData(_) => "production_data",
            InboundMessage::StatusUpdate(_) => "status_update",
            InboundMessage::RfidData(_) => "rfid_data",
            InboundMessage::Other { kind } => kind,
        }
    }
}

/// Decode one MQTT payload
pub fn parse_inbound(payload: &[u8]) -> Result<InboundMessage, serde_json::Error> {
    let mut value: Value = serde_json::from_slice(payload)?;
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("").to_string();
    let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
    let data = if data.is_null() { Value::Object(Default::default()) } else { data };

    Ok(match kind.as_str() {
        "production_data" => InboundMessage::ProductionData(serde_json::from_value(data)?),
        "status_update" => InboundMessage::StatusUpdate(serde_json::from_value(data)?),
        "rfid_data" => InboundMessage::RfidData(serde_json::from_value(data)?),
        _ => InboundMessage::Other { kind },
    })
}

/// Log an incoming publish and forward it to observers
pub fn handle_incoming(topic: &str, payload: &[u8], events: &EventSender, metrics: &Metrics) {
    metrics.record_mqtt_inbound();

    let message = match parse_inbound(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(topic = %topic, error = %e, bytes = payload.len(), "mqtt_inbound_invalid");
            return;
        }
    };

    match &message {
        InboundMessage::ProductionData(data) => info!(
            topic = %topic,
            daily_production = ?data.daily_production,
            current_load = ?data.current_load,
            line_runtime = ?data.line_runtime,
            "mqtt_production_data"
        ),
        InboundMessage::StatusUpdate(update) => info!(
            topic = %topic,
            line_status = ?update.line_status,
            normal = update.is_normal(),
            error_message = ?update.error_message,
            "mqtt_status_update"
        ),
        InboundMessage::RfidData(data) => info!(
            topic = %topic,
            tray_id = ?data.tray_id,
            load_count = ?data.load_count,
            "mqtt_rfid_data"
        ),
        InboundMessage::Other { kind } => debug!(topic = %topic, kind = %kind, "mqtt_inbound_other"),
    }

    events.send(CheckpointEvent::RemoteMessage(message));
}
