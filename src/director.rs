//! Client-side proxy for a named trigger actor.
//!
//! Device operations are fire-and-forget: they return a correlation id as
//! soon as the call is queued, and the reply is fetched separately with
//! [`Director::read_response`].

use crate::bus::{Bus, BusError, CorrelationId, Reply};
use crate::dispatch::{ops, PARAM_DEVICE_PORT, PARAM_PINS};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PARAMETER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("actor did not answer within {0:?}")]
    Timeout(Duration),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("unexpected reply shape: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Clone)]
pub struct Director {
    bus: Bus,
    actor: String,
    parameter_timeout: Duration,
}

impl Director {
    pub fn new(bus: Bus, actor: impl Into<String>) -> Self {
        Self {
            bus,
            actor: actor.into(),
            parameter_timeout: DEFAULT_PARAMETER_TIMEOUT,
        }
    }

    pub fn with_parameter_timeout(mut self, timeout: Duration) -> Self {
        self.parameter_timeout = timeout;
        self
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn call_async(&self, operation: &str, args: Value) -> Result<CorrelationId, DirectorError> {
        Ok(self.bus.call_async(&self.actor, operation, args)?)
    }

    /// `Ok(None)` while the actor is still working on the call.
    pub async fn read_response(&self, id: CorrelationId, timeout: Duration) -> Result<Option<Reply>, DirectorError> {
        Ok(self.bus.read_response(id, timeout).await?)
    }

    /// Waits for the reply and unwraps it into the returned value.
    pub async fn wait_result(&self, id: CorrelationId, timeout: Duration) -> Result<Value, DirectorError> {
        match self.read_response(id, timeout).await? {
            Some(reply) => reply.into_result().map_err(DirectorError::Remote),
            None => Err(DirectorError::Timeout(timeout)),
        }
    }

    pub async fn get_parameters(&self, names: &[&str]) -> Result<Map<String, Value>, DirectorError> {
        let id = self.call_async(ops::GET_PARAMETERS, json!({ "parameters": names }))?;
        match self.wait_result(id, self.parameter_timeout).await? {
            Value::Object(values) => Ok(values),
            other => Err(DirectorError::UnexpectedReply(other.to_string())),
        }
    }

    pub async fn device_port(&self) -> Result<String, DirectorError> {
        let mut values = self.get_parameters(&[PARAM_DEVICE_PORT]).await?;
        match values.remove(PARAM_DEVICE_PORT) {
            Some(Value::String(port)) => Ok(port),
            other => Err(DirectorError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn pins(&self) -> Result<BTreeMap<String, u32>, DirectorError> {
        let mut values = self.get_parameters(&[PARAM_PINS]).await?;
        let pins = values.remove(PARAM_PINS).unwrap_or(Value::Null);
        serde_json::from_value(pins).map_err(|e| DirectorError::UnexpectedReply(e.to_string()))
    }

    pub fn stop(&self) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::STOP, json!({}))
    }

    pub fn send_rising_edge(&self, event: &str) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::SEND_RISING_EDGE, json!({ "event": event }))
    }

    pub fn send_falling_edge(&self, event: &str) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::SEND_FALLING_EDGE, json!({ "event": event }))
    }

    pub fn send_pulse(&self, pulse: &str) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::SEND_PULSE, json!({ "pulse": pulse }))
    }

    pub fn send_pulse_sequence(&self, sequence: &str) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::SEND_PULSE_SEQUENCE, json!({ "sequence": sequence }))
    }

    pub fn reprogram(&self, firmware_path: &str) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::REPROGRAM, json!({ "firmware_path": firmware_path }))
    }

    pub fn create_rising_edge(&self, pin: u32, delay: Option<u64>, timestamp: Option<u64>) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::CREATE_RISING_EDGE, json!({ "pin": pin, "delay": delay, "timestamp": timestamp }))
    }

    pub fn create_falling_edge(&self, pin: u32, delay: Option<u64>, timestamp: Option<u64>) -> Result<CorrelationId, DirectorError> {
        self.call_async(ops::CREATE_FALLING_EDGE, json!({ "pin": pin, "delay": delay, "timestamp": timestamp }))
    }

    pub fn create_pulse(
        &self,
        pin: u32,
        width: u64,
        delay: Option<u64>,
        timestamp: Option<u64>,
    ) -> Result<CorrelationId, DirectorError> {
        self.call_async(
            ops::CREATE_PULSE,
            json!({ "pin": pin, "width": width, "delay": delay, "timestamp": timestamp }),
        )
    }
}
