//! The actor owning one trigger board.
//!
//! `start` opens the board, registers on the bus and spawns the listening
//! loop; `stop` raises the session's cancellation flag and joins the loop
//! with a bounded wait. The loop handles one call at a time, so the device
//! controller is never driven from two calls at once.

use crate::bus::{Bus, BusError, Delivery, Mailbox};
use crate::config::{ActorConfig, LoopConfig};
use crate::device::{DeviceController, DeviceError};
use crate::dispatch::DispatchTable;
use crate::firmware::{ArduinoCli, FirmwareToolchain};
use crate::transport::{SerialConnector, SerialPortConnector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor is already listening")]
    AlreadyListening,
    #[error("actor is not listening")]
    NotListening,
    #[error("serial channel unavailable: {0}")]
    ChannelUnavailable(#[source] DeviceError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorStatus {
    Idle,
    Listening,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopExit {
    Cancelled,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopReport {
    pub exit: LoopExit,
    pub calls_handled: u64,
    pub heartbeats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Joined(LoopReport),
    /// The loop did not finish within the join timeout and was left running
    /// detached; it still closes the channel whenever it does exit.
    Abandoned,
    Failed(String),
}

struct Session {
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<LoopReport>,
}

pub struct Actor {
    config: ActorConfig,
    bus: Bus,
    connector: Arc<dyn SerialConnector>,
    toolchain: Arc<dyn FirmwareToolchain>,
    status: ActorStatus,
    session: Option<Session>,
}

impl Actor {
    /// Actor backed by a real serial port and `arduino-cli`.
    pub fn new(config: ActorConfig, bus: Bus) -> Self {
        let toolchain = Arc::new(ArduinoCli::new(config.reprogram.cli_path.clone()));
        Self::with_collaborators(config, bus, Arc::new(SerialPortConnector), toolchain)
    }

    pub fn with_collaborators(
        config: ActorConfig,
        bus: Bus,
        connector: Arc<dyn SerialConnector>,
        toolchain: Arc<dyn FirmwareToolchain>,
    ) -> Self {
        Self {
            config,
            bus,
            connector,
            toolchain,
            status: ActorStatus::Idle,
            session: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// A loop that exited on its own leaves the actor idle.
    pub fn status(&self) -> ActorStatus {
        if self.loop_finished() {
            ActorStatus::Idle
        } else {
            self.status
        }
    }

    pub fn device_port(&self) -> &str {
        &self.config.device.port
    }

    pub fn pins(&self) -> &BTreeMap<String, u32> {
        &self.config.device.pins
    }

    /// `true` once a started loop has exited without being asked to.
    pub fn loop_finished(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.handle.is_finished())
    }

    /// Opens the board and starts listening. Must be called from within a
    /// tokio runtime. On failure the actor stays idle.
    pub fn start(&mut self) -> Result<(), ActorError> {
        if self.loop_finished() {
            warn!("actor loop for {} had already exited; starting a new session", self.config.name);
            self.session = None;
            self.status = ActorStatus::Idle;
        }
        if self.status != ActorStatus::Idle || self.session.is_some() {
            return Err(ActorError::AlreadyListening);
        }

        let device = DeviceController::open(
            &self.config,
            Arc::clone(&self.connector),
            Arc::clone(&self.toolchain),
            self.bus.publisher(),
        )
        .map_err(ActorError::ChannelUnavailable)?;
        let endpoint = self.bus.register(&self.config.name)?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_loop(
            endpoint,
            device,
            DispatchTable::trigger(),
            Arc::clone(&stop_flag),
            self.config.loop_timing,
        ));

        self.session = Some(Session { stop_flag, handle });
        self.status = ActorStatus::Listening;
        info!("🚀 actor {} listening on {}", self.config.name, self.config.device.port);
        Ok(())
    }

    /// Asks the loop to finish and waits up to the join timeout for it.
    pub async fn stop(&mut self) -> Result<StopOutcome, ActorError> {
        let session = self.session.take().ok_or(ActorError::NotListening)?;
        self.status = ActorStatus::Stopping;
        info!("🛑 stopping actor {}", self.config.name);

        session.stop_flag.store(true, Ordering::Release);
        let join_timeout = self.config.loop_timing.join_timeout();
        let outcome = match tokio::time::timeout(join_timeout, session.handle).await {
            Ok(Ok(report)) => StopOutcome::Joined(report),
            Ok(Err(e)) => {
                error!("actor loop for {} failed: {}", self.config.name, e);
                StopOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    "actor loop for {} did not exit within {:?}; leaving it detached",
                    self.config.name, join_timeout
                );
                StopOutcome::Abandoned
            }
        };

        self.status = ActorStatus::Idle;
        Ok(outcome)
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.stop_flag.store(true, Ordering::Release);
        }
    }
}

/// Polls the mailbox until `stop_flag` is raised or the mailbox goes away.
///
/// At most one call is taken per iteration and it runs to completion before
/// the flag is checked again. The device channel is closed exactly once, on
/// the way out.
pub async fn run_loop<M: Mailbox>(
    mut mailbox: M,
    mut device: DeviceController,
    table: DispatchTable,
    stop_flag: Arc<AtomicBool>,
    timing: LoopConfig,
) -> LoopReport {
    let mut calls_handled = 0;
    let mut heartbeats = 1;
    mailbox.heartbeat();
    let mut next_heartbeat = Instant::now() + timing.heartbeat_interval();

    let exit = loop {
        if stop_flag.load(Ordering::Acquire) {
            break LoopExit::Cancelled;
        }

        match mailbox.poll(timing.waiting_time()).await {
            Delivery::Call(mut call) => {
                debug!("dispatching {}#{}", call.operation, call.id);
                let args = call.args.take();
                let reply = table.dispatch(&mut device, &call.operation, args).await;
                let id = call.id;
                if !call.respond(reply) {
                    debug!("caller for #{} is gone", id);
                }
                calls_handled += 1;
            }
            Delivery::Timeout => {}
            Delivery::Disconnected => {
                warn!("mailbox for {} disconnected", mailbox.name());
                break LoopExit::Disconnected;
            }
        }

        if Instant::now() >= next_heartbeat {
            mailbox.heartbeat();
            heartbeats += 1;
            next_heartbeat = Instant::now() + timing.heartbeat_interval();
        }
    };

    if device.close() {
        info!("🔒 serial port {} closed", device.device_port());
    }
    info!("actor {} stopped listening after {} call(s)", mailbox.name(), calls_handled);

    LoopReport {
        exit,
        calls_handled,
        heartbeats,
    }
}
