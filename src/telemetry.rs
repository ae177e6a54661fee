use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

pub const TELEMETRY_MESSAGE_TYPE: &str = "trigger";
pub const TELEMETRY_BROADCAST_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Stop,
    SendRisingEdge,
    SendFallingEdge,
    SendPulse,
    SendPulseSequence,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Stop => "stop",
            OperationKind::SendRisingEdge => "send_rising_edge",
            OperationKind::SendFallingEdge => "send_falling_edge",
            OperationKind::SendPulse => "send_pulse",
            OperationKind::SendPulseSequence => "send_pulse_sequence",
        }
    }
}

/// What happened on the board, as reported alongside a command.
///
/// Fields that could not be parsed out of the command are left out of the
/// serialized record rather than filled with placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub trigger_command: String,
    pub response: String,
    pub message_type: OperationKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_pulses: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delays: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widths: Option<Vec<u64>>,
}

impl TriggerMetadata {
    pub fn new(kind: OperationKind, command: &str, response: &str, description: String) -> Self {
        Self {
            trigger_command: command.to_string(),
            response: response.to_string(),
            message_type: kind,
            description,
            pin: None,
            delay_ms: None,
            width_ms: None,
            num_pulses: None,
            delays: None,
            widths: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub actor_name: String,
    pub metadata: TriggerMetadata,
    pub message_type: String,
    pub serial_number: String,
}

impl TelemetryRecord {
    pub fn new(actor_name: &str, serial_number: &str, metadata: TriggerMetadata) -> Self {
        Self {
            actor_name: actor_name.to_string(),
            metadata,
            message_type: TELEMETRY_MESSAGE_TYPE.to_string(),
            serial_number: serial_number.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("no telemetry subscribers")]
    NoSubscribers,
}

/// Fan-out point for telemetry records.
#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    sender: broadcast::Sender<TelemetryRecord>,
}

impl TelemetryPublisher {
    pub fn new(sender: broadcast::Sender<TelemetryRecord>) -> Self {
        Self { sender }
    }

    /// Standalone publisher with its own channel, mostly for tests and tools.
    pub fn channel() -> (Self, broadcast::Receiver<TelemetryRecord>) {
        let (sender, receiver) = broadcast::channel(TELEMETRY_BROADCAST_BUFFER_SIZE);
        (Self::new(sender), receiver)
    }

    pub fn publish(&self, record: TelemetryRecord) -> Result<usize, TelemetryError> {
        self.sender.send(record).map_err(|_| TelemetryError::NoSubscribers)
    }

    /// Hands the record to a detached task. Failures are logged there and
    /// never reach the caller.
    pub fn publish_detached(&self, record: TelemetryRecord) {
        let publisher = self.clone();
        tokio::spawn(async move {
            let kind = record.metadata.message_type;
            match publisher.publish(record) {
                Ok(receivers) => debug!("📡 telemetry {} delivered to {} subscriber(s)", kind.as_str(), receivers),
                // Normal for an actor with no monitor attached
                Err(TelemetryError::NoSubscribers) => debug!("no telemetry subscribers for {}", kind.as_str()),
            }
        });
    }
}
