//! The trigger board as a device: one serial channel, high-level operations,
//! and a telemetry record for every command that changes the board's state.

use crate::config::{ActorConfig, DeviceInfo, ReprogramConfig, TransportConfig};
use crate::events::{Event, EventError, TimingSpec};
use crate::firmware::{self, FirmwareError, FirmwareToolchain};
use crate::telemetry::{OperationKind, TelemetryPublisher, TelemetryRecord, TriggerMetadata};
use crate::transport::{FramedTransport, SerialChannel, SerialConnector, TransportError};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const STOP_COMMAND: &str = "STOP;";
pub const REPROGRAM_SUCCESS: &str = "Arduino sketch compiled and uploaded successfully";

const STOP_DESCRIPTION: &str = "Stopped all events, set all pins to zero, and clear all planned events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprogramStage {
    Compile,
    Upload,
    Reconnect,
}

impl fmt::Display for ReprogramStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReprogramStage::Compile => write!(f, "compile"),
            ReprogramStage::Upload => write!(f, "upload"),
            ReprogramStage::Reconnect => write!(f, "reconnect"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid device info: {0}")]
    InvalidDeviceInfo(&'static str),
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial channel is closed")]
    ChannelClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("reprogram failed during {stage}: {message}")]
    Reprogram { stage: ReprogramStage, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeMetadata {
    pub pin: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseMetadata {
    pub pin: u32,
    pub delay_ms: u64,
    pub width_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceMetadata {
    /// Pin of the last matched pulse.
    pub pin: Option<u32>,
    pub delays: Vec<u64>,
    pub widths: Vec<u64>,
}

impl SequenceMetadata {
    pub fn num_pulses(&self) -> usize {
        self.delays.len()
    }
}

fn edge_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\((\d+),(\d+),(\d+)\);").expect("valid edge pattern"))
}

fn pulse_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\((\d+),(\d+),1\);\(\d+,(\d+),0\);").expect("valid pulse pattern"))
}

fn sequence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\((\d+),(\d+),1\);\(\d+?,(\d+),0\);").expect("valid sequence pattern"))
}

pub fn parse_edge(command: &str) -> Option<EdgeMetadata> {
    let captures = edge_pattern().captures(command)?;
    Some(EdgeMetadata {
        pin: captures[1].parse().ok()?,
        delay_ms: captures[2].parse().ok()?,
    })
}

/// Pin, on-delay and width of one on/off pair. A falling edge scheduled
/// before its rising edge does not count as a pulse.
fn pulse_pair(captures: &Captures<'_>) -> Option<(u32, u64, u64)> {
    let pin: u32 = captures[1].parse().ok()?;
    let delay_ms: u64 = captures[2].parse().ok()?;
    let off_ms: u64 = captures[3].parse().ok()?;
    Some((pin, delay_ms, off_ms.checked_sub(delay_ms)?))
}

pub fn parse_pulse(command: &str) -> Option<PulseMetadata> {
    let (pin, delay_ms, width_ms) = pulse_pair(&pulse_pattern().captures(command)?)?;
    Some(PulseMetadata { pin, delay_ms, width_ms })
}

pub fn parse_sequence(command: &str) -> SequenceMetadata {
    let mut metadata = SequenceMetadata::default();
    for (pin, delay_ms, width_ms) in sequence_pattern().captures_iter(command).filter_map(|c| pulse_pair(&c)) {
        metadata.pin = Some(pin);
        metadata.delays.push(delay_ms);
        metadata.widths.push(width_ms);
    }
    metadata
}

pub fn edge_metadata(kind: OperationKind, command: &str, response: &str) -> TriggerMetadata {
    let edge_name = if kind == OperationKind::SendRisingEdge { "rising" } else { "falling" };
    match parse_edge(command) {
        Some(edge) => {
            let description = format!(
                "Sending a {} edge to pin {} with delay of {} ms",
                edge_name, edge.pin, edge.delay_ms
            );
            let mut metadata = TriggerMetadata::new(kind, command, response, description);
            metadata.pin = Some(edge.pin);
            metadata.delay_ms = Some(edge.delay_ms);
            metadata
        }
        None => {
            let description = format!("Sending a {} edge", edge_name);
            TriggerMetadata::new(kind, command, response, description)
        }
    }
}

pub fn pulse_metadata(command: &str, response: &str) -> TriggerMetadata {
    match parse_pulse(command) {
        Some(pulse) => {
            let description = format!(
                "Sending a pulse to pin {} with delay of {} ms and pulse width of {} ms",
                pulse.pin, pulse.delay_ms, pulse.width_ms
            );
            let mut metadata = TriggerMetadata::new(OperationKind::SendPulse, command, response, description);
            metadata.pin = Some(pulse.pin);
            metadata.delay_ms = Some(pulse.delay_ms);
            metadata.width_ms = Some(pulse.width_ms);
            metadata
        }
        None => TriggerMetadata::new(OperationKind::SendPulse, command, response, "Sending a pulse".to_string()),
    }
}

pub fn sequence_metadata(command: &str, response: &str) -> TriggerMetadata {
    let sequence = parse_sequence(command);
    let target = match sequence.pin {
        Some(pin) => format!(" to pin {}", pin),
        None => String::new(),
    };
    let description = format!(
        "Sending a pulse sequence of {} pulses{} with delays of {:?} ms and pulse widths of {:?} ms",
        sequence.num_pulses(),
        target,
        sequence.delays,
        sequence.widths
    );
    let mut metadata = TriggerMetadata::new(OperationKind::SendPulseSequence, command, response, description);
    metadata.pin = sequence.pin;
    metadata.num_pulses = Some(sequence.num_pulses());
    metadata.delays = Some(sequence.delays);
    metadata.widths = Some(sequence.widths);
    metadata
}

pub struct DeviceController {
    actor_name: String,
    device: DeviceInfo,
    transport_config: TransportConfig,
    reprogram_config: ReprogramConfig,
    transport: Option<FramedTransport>,
    connector: Arc<dyn SerialConnector>,
    toolchain: Arc<dyn FirmwareToolchain>,
    publisher: TelemetryPublisher,
}

impl DeviceController {
    /// Validates the device description and opens its serial channel.
    pub fn open(
        config: &ActorConfig,
        connector: Arc<dyn SerialConnector>,
        toolchain: Arc<dyn FirmwareToolchain>,
        publisher: TelemetryPublisher,
    ) -> Result<Self, DeviceError> {
        if config.device.port.is_empty() {
            return Err(DeviceError::InvalidDeviceInfo("no serial port configured"));
        }
        if config.device.baud_rate == 0 {
            return Err(DeviceError::InvalidDeviceInfo("baud rate must be non-zero"));
        }

        let channel = open_channel(connector.as_ref(), &config.device)?;
        info!("🔌 opened {} at {} baud", config.device.port, config.device.baud_rate);

        Ok(Self {
            actor_name: config.name.clone(),
            device: config.device.clone(),
            transport_config: config.transport,
            reprogram_config: config.reprogram.clone(),
            transport: Some(FramedTransport::new(channel, config.transport)),
            connector,
            toolchain,
            publisher,
        })
    }

    pub fn device_port(&self) -> &str {
        &self.device.port
    }

    pub fn serial_number(&self) -> &str {
        &self.device.serial_number
    }

    pub fn pins(&self) -> &BTreeMap<String, u32> {
        &self.device.pins
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Releases the serial channel. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        self.transport.take().is_some()
    }

    async fn exchange(&mut self, payload: &str) -> Result<String, DeviceError> {
        let transport = self.transport.as_mut().ok_or(DeviceError::ChannelClosed)?;
        let response = transport.exchange(payload).await?;
        info!("board replied to {}: {:?}", payload, response);
        Ok(response)
    }

    fn emit(&self, metadata: TriggerMetadata) {
        let record = TelemetryRecord::new(&self.actor_name, &self.device.serial_number, metadata);
        self.publisher.publish_detached(record);
    }

    pub async fn stop(&mut self) -> Result<String, DeviceError> {
        let response = self.exchange(STOP_COMMAND).await?;
        self.emit(TriggerMetadata::new(
            OperationKind::Stop,
            STOP_COMMAND,
            &response,
            STOP_DESCRIPTION.to_string(),
        ));
        Ok(response)
    }

    pub async fn send_rising_edge(&mut self, event: &str) -> Result<String, DeviceError> {
        let response = self.exchange(event).await?;
        self.emit(edge_metadata(OperationKind::SendRisingEdge, event, &response));
        Ok(response)
    }

    pub async fn send_falling_edge(&mut self, event: &str) -> Result<String, DeviceError> {
        let response = self.exchange(event).await?;
        self.emit(edge_metadata(OperationKind::SendFallingEdge, event, &response));
        Ok(response)
    }

    pub async fn send_pulse(&mut self, pulse: &str) -> Result<String, DeviceError> {
        let response = self.exchange(pulse).await?;
        self.emit(pulse_metadata(pulse, &response));
        Ok(response)
    }

    pub async fn send_pulse_sequence(&mut self, sequence: &str) -> Result<String, DeviceError> {
        let response = self.exchange(sequence).await?;
        self.emit(sequence_metadata(sequence, &response));
        Ok(response)
    }

    pub fn create_rising_edge(&self, pin: u32, delay_ms: Option<u64>, timestamp_ns: Option<u64>) -> Result<Event, EventError> {
        Ok(Event::rising_edge(TimingSpec::new(pin, delay_ms, timestamp_ns)?))
    }

    pub fn create_falling_edge(&self, pin: u32, delay_ms: Option<u64>, timestamp_ns: Option<u64>) -> Result<Event, EventError> {
        Ok(Event::falling_edge(TimingSpec::new(pin, delay_ms, timestamp_ns)?))
    }

    pub fn create_pulse(
        &self,
        pin: u32,
        width_ms: u64,
        delay_ms: Option<u64>,
        timestamp_ns: Option<u64>,
    ) -> Result<Event, EventError> {
        Event::pulse(TimingSpec::new(pin, delay_ms, timestamp_ns)?, width_ms)
    }

    /// Compiles and flashes new firmware, then brings the channel back.
    ///
    /// The channel is closed for the upload and reopened afterwards even when
    /// the upload fails, so the board stays reachable with its old firmware.
    pub async fn reprogram(&mut self, firmware_path: &Path) -> Result<String, DeviceError> {
        let sketch = firmware::sketch_dir(firmware_path).map_err(|e| reprogram_error(ReprogramStage::Compile, e))?;
        let fqbn = self.reprogram_config.fqbn.clone();

        info!("compiling {}", sketch.display());
        let toolchain = Arc::clone(&self.toolchain);
        let (compile_sketch, compile_fqbn) = (sketch.clone(), fqbn.clone());
        run_tool(move || toolchain.compile(&compile_sketch, &compile_fqbn, &compile_sketch))
            .await
            .map_err(|e| reprogram_error(ReprogramStage::Compile, e))?;

        self.close();
        info!("uploading to {}", self.device.port);
        let toolchain = Arc::clone(&self.toolchain);
        let port = self.device.port.clone();
        let upload = run_tool(move || toolchain.upload(&sketch, &fqbn, &port)).await;

        let reconnect = self.reconnect().await;
        upload.map_err(|e| reprogram_error(ReprogramStage::Upload, e))?;
        reconnect.map_err(|e| reprogram_error(ReprogramStage::Reconnect, e))?;

        info!("{}", REPROGRAM_SUCCESS);
        Ok(REPROGRAM_SUCCESS.to_string())
    }

    /// Reopens the port and resets the board through a DTR cycle.
    async fn reconnect(&mut self) -> Result<(), DeviceError> {
        let mut channel = open_channel(self.connector.as_ref(), &self.device)?;

        channel.set_dtr(false).map_err(TransportError::from)?;
        tokio::time::sleep(Duration::from_millis(self.reprogram_config.dtr_low_ms)).await;
        channel.set_dtr(true).map_err(TransportError::from)?;
        tokio::time::sleep(Duration::from_millis(self.reprogram_config.reboot_settle_ms)).await;
        channel.clear_input().map_err(TransportError::from)?;

        self.transport = Some(FramedTransport::new(channel, self.transport_config));
        Ok(())
    }
}

fn open_channel(connector: &dyn SerialConnector, device: &DeviceInfo) -> Result<Box<dyn SerialChannel>, DeviceError> {
    connector
        .open(&device.port, device.baud_rate)
        .map_err(|source| DeviceError::Open {
            port: device.port.clone(),
            source,
        })
}

async fn run_tool<F>(job: F) -> Result<(), FirmwareError>
where
    F: FnOnce() -> Result<(), FirmwareError> + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(result) => result,
        Err(join_error) => Err(FirmwareError::ToolFailed {
            tool: "firmware toolchain".to_string(),
            status: "panicked".to_string(),
            stderr: join_error.to_string(),
        }),
    }
}

fn reprogram_error(stage: ReprogramStage, cause: impl fmt::Display) -> DeviceError {
    match stage {
        ReprogramStage::Compile => error!("Compilation failed: {}", cause),
        ReprogramStage::Upload => error!("Upload failed: {}", cause),
        ReprogramStage::Reconnect => warn!("Board did not come back after upload: {}", cause),
    }
    DeviceError::Reprogram {
        stage,
        message: cause.to_string(),
    }
}

impl fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceController")
            .field("actor_name", &self.actor_name)
            .field("device", &self.device)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_parse_requires_leading_fragment() {
        assert_eq!(parse_edge("(2,150,1);"), Some(EdgeMetadata { pin: 2, delay_ms: 150 }));
        assert_eq!(parse_edge("garbage(2,150,1);"), None);
    }

    #[test]
    fn test_inverted_pulse_is_unparsed() {
        assert_eq!(parse_pulse("(0,300,1);(0,100,0);"), None);
    }

    #[test]
    fn test_sequence_reports_last_pin() {
        let sequence = parse_sequence("(0,100,1);(0,150,0);(3,300,1);(3,350,0);");
        assert_eq!(sequence.pin, Some(3));
        assert_eq!(sequence.num_pulses(), 2);
    }
}
