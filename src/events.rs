//! Timing events for the trigger board.
//!
//! Every event is resolved once, at construction, into a pin and a concrete
//! millisecond delay. Encoding is then a pure string operation producing the
//! fragments the firmware schedules: `(pin,delay,1);` for a rising edge and
//! `(pin,delay,0);` for a falling edge.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const NANOS_PER_MILLI: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("either a delay or a timestamp must be provided")]
    InvalidTiming,
    #[error("an event sequence must contain at least one event")]
    EmptySequence,
    #[error("pulse width must be greater than zero")]
    ZeroWidth,
    #[error("event delay does not fit in a millisecond counter")]
    DelayOverflow,
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSpec {
    pin: u32,
    delay_ms: Option<u64>,
    timestamp_ns: Option<u64>,
    resolved_delay_ms: u64,
}

impl TimingSpec {
    /// Resolves against the current wall clock.
    pub fn new(pin: u32, delay_ms: Option<u64>, timestamp_ns: Option<u64>) -> Result<Self, EventError> {
        Self::resolve_at(pin, delay_ms, timestamp_ns, now_ns())
    }

    pub fn with_delay(pin: u32, delay_ms: u64) -> Self {
        Self {
            pin,
            delay_ms: Some(delay_ms),
            timestamp_ns: None,
            resolved_delay_ms: delay_ms,
        }
    }

    /// Resolves a timing description against `now_ns`.
    ///
    /// A timestamp in the past clamps to zero; any explicit delay is added on
    /// top of the timestamp-derived delay.
    pub fn resolve_at(
        pin: u32,
        delay_ms: Option<u64>,
        timestamp_ns: Option<u64>,
        now_ns: u64,
    ) -> Result<Self, EventError> {
        let resolved_delay_ms = match (delay_ms, timestamp_ns) {
            (None, None) => return Err(EventError::InvalidTiming),
            (Some(delay), None) => delay,
            (delay, Some(timestamp)) => {
                let timestamp_ms = timestamp / NANOS_PER_MILLI;
                let now_ms = now_ns / NANOS_PER_MILLI;
                timestamp_ms
                    .saturating_sub(now_ms)
                    .checked_add(delay.unwrap_or(0))
                    .ok_or(EventError::DelayOverflow)?
            }
        };

        Ok(Self {
            pin,
            delay_ms,
            timestamp_ns,
            resolved_delay_ms,
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Delay as originally requested, before any timestamp was folded in.
    pub fn requested_delay_ms(&self) -> Option<u64> {
        self.delay_ms
    }

    pub fn timestamp_ns(&self) -> Option<u64> {
        self.timestamp_ns
    }

    pub fn delay_ms(&self) -> u64 {
        self.resolved_delay_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RisingEdge,
    FallingEdge,
    Pulse { width_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    kind: EventKind,
    timing: TimingSpec,
    command: String,
}

impl Event {
    pub fn rising_edge(timing: TimingSpec) -> Self {
        Self::build(EventKind::RisingEdge, timing)
    }

    pub fn falling_edge(timing: TimingSpec) -> Self {
        Self::build(EventKind::FallingEdge, timing)
    }

    pub fn pulse(timing: TimingSpec, width_ms: u64) -> Result<Self, EventError> {
        if width_ms == 0 {
            return Err(EventError::ZeroWidth);
        }
        timing
            .resolved_delay_ms
            .checked_add(width_ms)
            .ok_or(EventError::DelayOverflow)?;
        Ok(Self::build(EventKind::Pulse { width_ms }, timing))
    }

    fn build(kind: EventKind, timing: TimingSpec) -> Self {
        let command = encode(kind, &timing);
        Self { kind, timing, command }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn timing(&self) -> &TimingSpec {
        &self.timing
    }

    pub fn width_ms(&self) -> Option<u64> {
        match self.kind {
            EventKind::Pulse { width_ms } => Some(width_ms),
            _ => None,
        }
    }

    /// Wire fragment for this event.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Same event with its timing replaced; the fragment is re-encoded.
    /// Callers check that a pulse's falling edge still fits.
    fn retimed(&self, timing: TimingSpec) -> Self {
        Self::build(self.kind, timing)
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            kind: self.kind,
            pin: self.timing.pin,
            delay_ms: self.timing.resolved_delay_ms,
            timestamp_ns: self.timing.timestamp_ns,
            width_ms: self.width_ms(),
            command: self.command.clone(),
        }
    }
}

/// Serializable view of an event, returned by the remote `create*` operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub kind: EventKind,
    pub pin: u32,
    pub delay_ms: u64,
    pub timestamp_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width_ms: Option<u64>,
    pub command: String,
}

pub fn rising_fragment(pin: u32, delay_ms: u64) -> String {
    format!("({},{},1);", pin, delay_ms)
}

pub fn falling_fragment(pin: u32, delay_ms: u64) -> String {
    format!("({},{},0);", pin, delay_ms)
}

/// Pulses whose falling edge would overflow saturate; `Event::pulse` never
/// builds one.
pub fn encode(kind: EventKind, timing: &TimingSpec) -> String {
    let pin = timing.pin;
    let delay = timing.resolved_delay_ms;
    match kind {
        EventKind::RisingEdge => rising_fragment(pin, delay),
        EventKind::FallingEdge => falling_fragment(pin, delay),
        EventKind::Pulse { width_ms } => {
            let mut command = rising_fragment(pin, delay);
            command.push_str(&falling_fragment(pin, delay.saturating_add(width_ms)));
            command
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSequence {
    events: Vec<Event>,
    command: String,
}

impl EventSequence {
    pub fn new(events: Vec<Event>) -> Result<Self, EventError> {
        Self::anchored_at(events, now_ns())
    }

    /// Builds a sequence whose events share the first event's time origin.
    ///
    /// When the first event carries an absolute timestamp, each later event
    /// without one is moved to `first.timestamp + own delay` and its delay is
    /// resolved again against `now_ns`.
    pub fn anchored_at(events: Vec<Event>, now_ns: u64) -> Result<Self, EventError> {
        let first = events.first().ok_or(EventError::EmptySequence)?;

        let events = match first.timing.timestamp_ns {
            Some(reference_ns) => {
                let mut anchored = Vec::with_capacity(events.len());
                for (index, event) in events.iter().enumerate() {
                    if index == 0 || event.timing.timestamp_ns.is_some() {
                        anchored.push(event.clone());
                        continue;
                    }
                    let own_delay_ms = event.timing.delay_ms.unwrap_or(0);
                    let timestamp_ns = own_delay_ms
                        .checked_mul(NANOS_PER_MILLI)
                        .and_then(|offset| reference_ns.checked_add(offset))
                        .ok_or(EventError::DelayOverflow)?;
                    let timing = TimingSpec::resolve_at(event.timing.pin, None, Some(timestamp_ns), now_ns)?;
                    if let Some(width_ms) = event.width_ms() {
                        timing.resolved_delay_ms.checked_add(width_ms).ok_or(EventError::DelayOverflow)?;
                    }
                    anchored.push(event.retimed(timing));
                }
                anchored
            }
            None => events,
        };

        let command = events.iter().map(Event::command).collect::<String>();
        Ok(Self { events, command })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}
