use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A discrete event published on the core event bus.
///
/// External layers (telemetry relays, UI bridges) subscribe to these; the
/// core never waits on a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
    pub timestamp: DateTime<Utc>,
}

impl CoreEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            timestamp: Utc::now(),
        }
    }
}
