//! # Pulse Bus
//!
//! Remote control of a microcontroller trigger board: timed rising edges,
//! falling edges and pulses on its output pins, driven by directors over an
//! in-process actor bus.
//!
//! ## Features
//!
//! - **Trigger events**: edges, pulses and anchored pulse sequences encoded
//!   into the board's text command grammar
//! - **Checksummed serial framing**: `<payload + crc>` frames with a bounded
//!   two-phase response read
//! - **Actor runtime**: a cancellable listening loop that serves one call at
//!   a time and closes the serial channel exactly once
//! - **Telemetry**: a record per device operation, published without blocking
//!   the caller
//! - **Reprogramming**: compile and upload firmware through `arduino-cli`
//! - **Gateway**: line-delimited JSON over TCP for out-of-process directors
//!
//! ## Quick Start
//!
//! ```rust
//! use pulsebus::events::{Event, TimingSpec};
//!
//! // A 100 ms pulse on pin 0, starting 500 ms from now
//! let pulse = Event::pulse(TimingSpec::with_delay(0, 500), 100)?;
//! assert_eq!(pulse.command(), "(0,500,1);(0,600,0);");
//! # Ok::<(), pulsebus::events::EventError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`events`] - Timing resolution and command encoding
//! - [`transport`] - Serial framing and the bounded response read
//! - [`device`] - Device operations, response parsing and telemetry metadata
//! - [`telemetry`] - Telemetry records and their broadcast publisher
//! - [`firmware`] - Firmware compile/upload toolchain
//! - [`bus`] - Mailboxes, correlated replies and heartbeats
//! - [`dispatch`] - Remote operation names bound to device handlers
//! - [`actor`] - Actor lifecycle and the listening loop
//! - [`director`] - Client-side proxy for an actor
//! - [`discovery`] - Locating attached boards
//! - [`gateway`] - TCP front door to the bus
//! - [`config`] - Actor configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod actor;
pub mod bus;
pub mod config;
pub mod device;
pub mod director;
pub mod discovery;
pub mod dispatch;
pub mod events;
pub mod firmware;
pub mod gateway;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use actor::{Actor, ActorStatus, StopOutcome};
pub use bus::{Bus, CorrelationId, Reply};
pub use config::ActorConfig;
pub use device::DeviceController;
pub use director::Director;
pub use events::{Event, EventSequence, TimingSpec};
pub use telemetry::TelemetryRecord;
