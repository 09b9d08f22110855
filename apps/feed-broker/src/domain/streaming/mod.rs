//! Market Data Streaming Types
//!
//! Core domain types for the broker's two message directions:
//!
//! - **Upstream → broker**: snapshots, delta batches and control messages
//!   (`UpstreamMessage`).
//! - **Broker → subscriber**: connection state, snapshots, batched updates
//!   and liveness probes (`BrokerEvent`).
//! - **Subscriber → broker**: liveness acks, unsubscribe and runtime
//!   commands (`SubscriberMessage`).
//!
//! All JSON shapes carry a kebab-case `type` tag.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument Data
// =============================================================================

/// Instrument key (ticker symbol). Unique per instrument.
pub type Symbol = String;

/// Field name to numeric value mapping.
pub type FieldMap = BTreeMap<String, f64>;

/// Opaque JSON object carried by control messages and subscriber commands.
pub type ControlPayload = serde_json::Map<String, serde_json::Value>;

/// A complete instrument record as published by the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// Instrument key.
    pub symbol: Symbol,
    /// Pricing, identity and metric fields.
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl InstrumentRecord {
    /// Create a record with no fields.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// A partial update naming only the fields that changed for one symbol.
///
/// A delta never claims to be a full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaMessage {
    /// Instrument key, always present.
    pub symbol: Symbol,
    /// Source timestamp in epoch milliseconds.
    #[serde(
        default,
        deserialize_with = "epoch_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    /// Changed fields only.
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl DeltaMessage {
    /// Create a delta with no changed fields.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp: None,
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Look up a changed field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// Full authoritative state for all symbols at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// One record per symbol.
    pub records: Vec<InstrumentRecord>,
}

impl Snapshot {
    /// Create a snapshot from records.
    #[must_use]
    pub const fn new(records: Vec<InstrumentRecord>) -> Self {
        Self { records }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One coalescing window's worth of deltas, at most one per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedUpdate {
    /// Latest delta per symbol, in first-offer order.
    pub items: Vec<DeltaMessage>,
    /// Wall-clock flush time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Upstream Messages
// =============================================================================

/// A delta batch as sent by the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    /// Deltas in arrival order.
    pub items: Vec<DeltaMessage>,
    /// Source timestamp in epoch milliseconds.
    #[serde(default, deserialize_with = "epoch_millis::required")]
    pub timestamp: i64,
}

/// Source timestamps arrive as integer or fractional epoch milliseconds.
/// Fractions are floored to whole milliseconds.
mod epoch_millis {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    /// Largest magnitude an `f64` carries without losing whole milliseconds.
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        whole(f64::deserialize(deserializer)?)
    }

    pub fn option<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        Option::<f64>::deserialize(deserializer)?.map(whole).transpose()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn whole<E: Error>(millis: f64) -> Result<i64, E> {
        if millis.is_finite() && millis.abs() <= MAX_EXACT {
            Ok(millis.floor() as i64)
        } else {
            Err(E::custom(format!("timestamp out of range: {millis}")))
        }
    }
}

/// Classified inbound upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// Full state; cached and forwarded unmodified.
    Snapshot(Snapshot),
    /// Deltas; fed into the coalescer.
    DeltaBatch(DeltaBatch),
    /// Configuration acknowledgments and the like; forwarded unmodified.
    Control(ControlPayload),
}

impl UpstreamMessage {
    /// Message kind label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::DeltaBatch(_) => "delta-batch",
            Self::Control(_) => "control",
        }
    }
}

// =============================================================================
// Subscriber Channel Messages
// =============================================================================

/// Event emitted by the broker to each subscriber.
///
/// Large payloads are shared behind `Arc` so fan-out clones stay cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrokerEvent {
    /// The upstream connection is established.
    Connected,
    /// The upstream connection is down.
    Disconnected,
    /// Full current state.
    Snapshot(Arc<Snapshot>),
    /// Coalesced deltas for one window.
    BatchedUpdate(Arc<BatchedUpdate>),
    /// Heartbeat request; subscribers answer with `liveness-ack`.
    LivenessProbe,
    /// Upstream control message, forwarded unmodified.
    Control(ControlPayload),
}

impl BrokerEvent {
    /// Event kind label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Snapshot(_) => "snapshot",
            Self::BatchedUpdate(_) => "batched-update",
            Self::LivenessProbe => "liveness-probe",
            Self::Control(_) => "control",
        }
    }
}

/// Message sent by a subscriber to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SubscriberMessage {
    /// Answer to a liveness probe.
    LivenessAck,
    /// Explicit detach.
    Unsubscribe,
    /// Runtime parameter change relayed to the upstream source.
    Command {
        /// Opaque JSON payload.
        payload: serde_json::Value,
    },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn delta_round_trips_flattened_fields() {
        let delta: DeltaMessage =
            serde_json::from_value(json!({"symbol": "AAPL", "timestamp": 5, "price": 101.5}))
                .unwrap();

        assert_eq!(delta.symbol, "AAPL");
        assert_eq!(delta.timestamp, Some(5));
        assert_eq!(delta.field("price"), Some(101.5));
        assert_eq!(delta.fields.len(), 1);
    }

    #[test]
    fn delta_without_timestamp_omits_it() {
        let delta = DeltaMessage::new("MSFT").with_field("bid", 1.0);
        let value = serde_json::to_value(&delta).unwrap();

        assert_eq!(value, json!({"symbol": "MSFT", "bid": 1.0}));
    }

    #[test]
    fn broker_event_tags_are_kebab_case() {
        let probe = serde_json::to_value(BrokerEvent::LivenessProbe).unwrap();
        assert_eq!(probe, json!({"type": "liveness-probe"}));

        let batch = BrokerEvent::BatchedUpdate(Arc::new(BatchedUpdate {
            items: vec![DeltaMessage::new("AAPL").with_field("price", 103.0)],
            timestamp: DateTime::from_timestamp_millis(1_000).unwrap(),
        }));
        let value = serde_json::to_value(batch).unwrap();
        assert_eq!(value["type"], "batched-update");
        assert_eq!(value["timestamp"], 1_000);
        assert_eq!(value["items"][0]["price"], 103.0);
    }

    #[test]
    fn snapshot_event_carries_records() {
        let snapshot = Snapshot::new(vec![InstrumentRecord::new("AAPL").with_field("price", 1.0)]);
        let value = serde_json::to_value(BrokerEvent::Snapshot(Arc::new(snapshot))).unwrap();

        assert_eq!(
            value,
            json!({"type": "snapshot", "records": [{"symbol": "AAPL", "price": 1.0}]})
        );
    }

    #[test]
    fn control_event_keeps_payload_fields() {
        let mut payload = ControlPayload::new();
        payload.insert("ack".to_string(), json!("frequency"));
        let value = serde_json::to_value(BrokerEvent::Control(payload)).unwrap();

        assert_eq!(value, json!({"type": "control", "ack": "frequency"}));
    }

    #[test]
    fn subscriber_messages_parse() {
        let ack: SubscriberMessage =
            serde_json::from_value(json!({"type": "liveness-ack"})).unwrap();
        assert_eq!(ack, SubscriberMessage::LivenessAck);

        let command: SubscriberMessage =
            serde_json::from_value(json!({"type": "command", "payload": {"frequency": 20}}))
                .unwrap();
        assert_eq!(
            command,
            SubscriberMessage::Command {
                payload: json!({"frequency": 20})
            }
        );
    }

    #[test]
    fn fractional_timestamps_floor_to_whole_millis() {
        let delta: DeltaMessage = serde_json::from_value(
            json!({"symbol": "AAPL", "timestamp": 1_700_000_000_123.75, "price": 1.0}),
        )
        .unwrap();
        assert_eq!(delta.timestamp, Some(1_700_000_000_123));
        assert_eq!(delta.fields.len(), 1);

        let batch: DeltaBatch =
            serde_json::from_value(json!({"items": [], "timestamp": 42.5})).unwrap();
        assert_eq!(batch.timestamp, 42);

        let batch: DeltaBatch = serde_json::from_value(json!({"items": []})).unwrap();
        assert_eq!(batch.timestamp, 0);
    }

    #[test]
    fn non_numeric_timestamp_is_rejected() {
        let result = serde_json::from_value::<DeltaBatch>(json!({"items": [], "timestamp": "soon"}));
        assert!(result.is_err());

        let delta: DeltaMessage =
            serde_json::from_value(json!({"symbol": "AAPL", "timestamp": null})).unwrap();
        assert_eq!(delta.timestamp, None);
    }
}
