//! Remote operation names bound to device controller handlers.

use crate::bus::Reply;
use crate::device::{DeviceController, DeviceError};
use crate::events::EventError;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::pin::Pin;
use thiserror::Error;
use tracing::warn;

pub mod ops {
    pub const STOP: &str = "stop";
    pub const CREATE_RISING_EDGE: &str = "createRisingEdge";
    pub const CREATE_FALLING_EDGE: &str = "createFallingEdge";
    pub const CREATE_PULSE: &str = "createPulse";
    pub const SEND_RISING_EDGE: &str = "sendRisingEdge";
    pub const SEND_FALLING_EDGE: &str = "sendFallingEdge";
    pub const SEND_PULSE: &str = "sendPulse";
    pub const SEND_PULSE_SEQUENCE: &str = "sendPulseSequence";
    pub const REPROGRAM: &str = "reprogram";
    pub const GET_PARAMETERS: &str = "get_parameters";
}

pub const PARAM_DEVICE_PORT: &str = "device_port";
pub const PARAM_PINS: &str = "pins";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("operation panicked: {0}")]
    Panicked(String),
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>>;
pub type Handler = for<'a> fn(&'a mut DeviceController, Value) -> HandlerFuture<'a>;

pub struct DispatchTable {
    handlers: BTreeMap<&'static str, Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// All operations a trigger actor exposes.
    pub fn trigger() -> Self {
        let mut table = Self::new();
        table.register(ops::STOP, stop);
        table.register(ops::CREATE_RISING_EDGE, create_rising_edge);
        table.register(ops::CREATE_FALLING_EDGE, create_falling_edge);
        table.register(ops::CREATE_PULSE, create_pulse);
        table.register(ops::SEND_RISING_EDGE, send_rising_edge);
        table.register(ops::SEND_FALLING_EDGE, send_falling_edge);
        table.register(ops::SEND_PULSE, send_pulse);
        table.register(ops::SEND_PULSE_SEQUENCE, send_pulse_sequence);
        table.register(ops::REPROGRAM, reprogram);
        table.register(ops::GET_PARAMETERS, get_parameters);
        table
    }

    pub fn register(&mut self, operation: &'static str, handler: Handler) {
        self.handlers.insert(operation, handler);
    }

    pub fn operations(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Runs one call to completion. Every failure, a panicking handler
    /// included, becomes an error reply.
    pub async fn dispatch(&self, device: &mut DeviceController, operation: &str, args: Value) -> Reply {
        let result = match self.handlers.get(operation) {
            Some(handler) => AssertUnwindSafe(handler(device, args))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref())))),
            None => Err(DispatchError::UnknownOperation(operation.to_string())),
        };

        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => {
                warn!("{} failed: {}", operation, e);
                Reply::Err(e.to_string())
            }
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::trigger()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn boxed<'a, F>(future: F) -> HandlerFuture<'a>
where
    F: Future<Output = Result<Value, DispatchError>> + Send + 'a,
{
    Box::pin(future)
}

fn required_str(args: &Value, name: &str) -> Result<String, DispatchError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidArguments(format!("missing string argument {:?}", name)))
}

fn optional_u64(args: &Value, name: &str) -> Result<Option<u64>, DispatchError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| DispatchError::InvalidArguments(format!("{:?} must be a non-negative integer", name))),
    }
}

fn required_u64(args: &Value, name: &str) -> Result<u64, DispatchError> {
    optional_u64(args, name)?
        .ok_or_else(|| DispatchError::InvalidArguments(format!("missing integer argument {:?}", name)))
}

fn required_pin(args: &Value) -> Result<u32, DispatchError> {
    u32::try_from(required_u64(args, "pin")?)
        .map_err(|_| DispatchError::InvalidArguments("pin out of range".to_string()))
}

fn stop(device: &mut DeviceController, _args: Value) -> HandlerFuture<'_> {
    boxed(async move { Ok(Value::String(device.stop().await?)) })
}

fn create_rising_edge(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let event = device.create_rising_edge(
            required_pin(&args)?,
            optional_u64(&args, "delay")?,
            optional_u64(&args, "timestamp")?,
        )?;
        Ok(json!(event.summary()))
    })
}

fn create_falling_edge(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let event = device.create_falling_edge(
            required_pin(&args)?,
            optional_u64(&args, "delay")?,
            optional_u64(&args, "timestamp")?,
        )?;
        Ok(json!(event.summary()))
    })
}

fn create_pulse(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let event = device.create_pulse(
            required_pin(&args)?,
            required_u64(&args, "width")?,
            optional_u64(&args, "delay")?,
            optional_u64(&args, "timestamp")?,
        )?;
        Ok(json!(event.summary()))
    })
}

fn send_rising_edge(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let event = required_str(&args, "event")?;
        Ok(Value::String(device.send_rising_edge(&event).await?))
    })
}

fn send_falling_edge(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let event = required_str(&args, "event")?;
        Ok(Value::String(device.send_falling_edge(&event).await?))
    })
}

fn send_pulse(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let pulse = required_str(&args, "pulse")?;
        Ok(Value::String(device.send_pulse(&pulse).await?))
    })
}

fn send_pulse_sequence(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let sequence = required_str(&args, "sequence")?;
        Ok(Value::String(device.send_pulse_sequence(&sequence).await?))
    })
}

fn reprogram(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let path = required_str(&args, "firmware_path")?;
        Ok(Value::String(device.reprogram(Path::new(&path)).await?))
    })
}

fn get_parameters(device: &mut DeviceController, args: Value) -> HandlerFuture<'_> {
    boxed(async move {
        let names = args
            .get("parameters")
            .and_then(Value::as_array)
            .ok_or_else(|| DispatchError::InvalidArguments("\"parameters\" must be a list of names".to_string()))?;

        let mut values = Map::new();
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| DispatchError::InvalidArguments("parameter names must be strings".to_string()))?;
            let value = match name {
                PARAM_DEVICE_PORT => json!(device.device_port()),
                PARAM_PINS => json!(device.pins()),
                other => return Err(DispatchError::InvalidArguments(format!("unknown parameter {:?}", other))),
            };
            values.insert(name.to_string(), value);
        }
        Ok(Value::Object(values))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_table_exposes_every_operation() {
        let table = DispatchTable::trigger();
        let expected = [
            ops::STOP,
            ops::CREATE_RISING_EDGE,
            ops::CREATE_FALLING_EDGE,
            ops::CREATE_PULSE,
            ops::SEND_RISING_EDGE,
            ops::SEND_FALLING_EDGE,
            ops::SEND_PULSE,
            ops::SEND_PULSE_SEQUENCE,
            ops::REPROGRAM,
            ops::GET_PARAMETERS,
        ];
        for operation in expected {
            assert!(table.contains(operation), "missing {}", operation);
        }
        assert_eq!(table.operations().count(), expected.len());
        assert!(!DispatchTable::new().contains(ops::STOP));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static message"), "static message");
        assert_eq!(panic_message(&String::from("owned message")), "owned message");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }

    #[test]
    fn test_argument_helpers() {
        let args = json!({ "pin": 3, "delay": null, "width": -1, "event": "(3,0,1);" });
        assert_eq!(required_pin(&args).unwrap(), 3);
        assert_eq!(optional_u64(&args, "delay").unwrap(), None);
        assert_eq!(optional_u64(&args, "timestamp").unwrap(), None);
        assert!(matches!(required_u64(&args, "width"), Err(DispatchError::InvalidArguments(_))));
        assert_eq!(required_str(&args, "event").unwrap(), "(3,0,1);");
        assert!(required_str(&args, "pulse").is_err());
    }
}
