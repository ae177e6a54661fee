//! Line-delimited JSON front door to the bus, so directors can live in
//! another process. One request per line, one response per line; a client
//! that subscribes additionally receives every telemetry record.

use crate::bus::{Bus, CorrelationId, Reply};
use crate::director::Director;
use crate::telemetry::TelemetryRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_RESPONSE_WAIT_MS: u64 = 0;

fn default_response_wait_ms() -> u64 {
    DEFAULT_RESPONSE_WAIT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum GatewayRequest {
    Call {
        actor: String,
        operation: String,
        #[serde(default)]
        args: Value,
    },
    Response {
        id: CorrelationId,
        #[serde(default = "default_response_wait_ms")]
        timeout_ms: u64,
    },
    Parameters {
        actor: String,
        names: Vec<String>,
    },
    Actors,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum GatewayResponse {
    Accepted { id: CorrelationId },
    /// `reply` is absent while the call is still pending.
    Reply { id: CorrelationId, reply: Option<Reply> },
    Parameters { values: Map<String, Value> },
    Actors { names: Vec<String> },
    Subscribed,
    Telemetry { record: TelemetryRecord },
    Error { message: String },
}

impl GatewayResponse {
    fn error(message: impl ToString) -> Self {
        GatewayResponse::Error {
            message: message.to_string(),
        }
    }
}

/// Serves one request against the bus. Subscriptions are handled by the
/// connection, not here.
pub async fn handle_request(bus: &Bus, request: GatewayRequest) -> GatewayResponse {
    match request {
        GatewayRequest::Call { actor, operation, args } => match bus.call_async(&actor, &operation, args) {
            Ok(id) => GatewayResponse::Accepted { id },
            Err(e) => GatewayResponse::error(e),
        },
        GatewayRequest::Response { id, timeout_ms } => {
            match bus.read_response(id, Duration::from_millis(timeout_ms)).await {
                Ok(reply) => GatewayResponse::Reply { id, reply },
                Err(e) => GatewayResponse::error(e),
            }
        }
        GatewayRequest::Parameters { actor, names } => {
            let director = Director::new(bus.clone(), actor);
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            match director.get_parameters(&names).await {
                Ok(values) => GatewayResponse::Parameters { values },
                Err(e) => GatewayResponse::error(e),
            }
        }
        GatewayRequest::Actors => GatewayResponse::Actors { names: bus.actors() },
        GatewayRequest::Subscribe => GatewayResponse::Subscribed,
    }
}

pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Accepts clients forever.
pub async fn serve(listener: TcpListener, bus: Bus) -> io::Result<()> {
    info!("🌐 gateway listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 New client connected: {}", addr);
                let client_bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_bus).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("🔌 Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

async fn write_line(writer: &SharedWriter, response: &GatewayResponse) -> io::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await
}

fn spawn_telemetry_stream(writer: SharedWriter, mut telemetry: broadcast::Receiver<TelemetryRecord>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match telemetry.recv().await {
                Ok(record) => {
                    if let Err(e) = write_line(&writer, &GatewayResponse::Telemetry { record }).await {
                        warn!("Failed to send telemetry: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("telemetry subscriber lagged, {} record(s) dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_client(stream: TcpStream, bus: Bus) -> io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let mut telemetry_task: Option<JoinHandle<()>> = None;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<GatewayRequest>(trimmed) {
            Ok(GatewayRequest::Subscribe) => {
                if telemetry_task.is_none() {
                    telemetry_task = Some(spawn_telemetry_stream(Arc::clone(&writer), bus.subscribe_telemetry()));
                }
                GatewayResponse::Subscribed
            }
            Ok(request) => {
                info!("📨 Received request: {:?}", request);
                handle_request(&bus, request).await
            }
            Err(e) => {
                error!("Failed to parse request: {}", e);
                GatewayResponse::error(format!("Invalid request format: {}", e))
            }
        };
        write_line(&writer, &response).await?;
    }

    if let Some(task) = telemetry_task {
        task.abort();
    }
    Ok(())
}

/// Client side of the gateway, one request at a time.
pub struct GatewayClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GatewayClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn send(&mut self, request: &GatewayRequest) -> io::Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await
    }

    /// Next line from the gateway; `None` once the connection closes.
    pub async fn next_response(&mut self) -> io::Result<Option<GatewayResponse>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    /// Sends a request and returns the first non-telemetry line.
    pub async fn request(&mut self, request: &GatewayRequest) -> io::Result<GatewayResponse> {
        self.send(request).await?;
        loop {
            match self.next_response().await? {
                Some(GatewayResponse::Telemetry { .. }) => continue,
                Some(response) => return Ok(response),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "gateway closed connection",
                    ))
                }
            }
        }
    }
}
