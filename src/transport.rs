use crate::config::TransportConfig;
use arrayvec::ArrayString;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

pub const MAX_FRAME_SIZE: usize = 512;
pub const FRAME_START: char = '<';
pub const FRAME_END: char = '>';

const READ_CHUNK_SIZE: usize = 256;

pub type FrameBuffer = ArrayString<MAX_FRAME_SIZE>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("payload contains reserved frame delimiter {0:?}")]
    ReservedCharacter(char),
    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge,
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Byte-oriented link to the board.
///
/// Implementations must not block in `read` beyond what `bytes_available`
/// reported; the transport never asks for more.
pub trait SerialChannel: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens channels to a named port. Used once at actor start and again after
/// every firmware upload.
pub trait SerialConnector: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialChannel>>;
}

pub struct SerialPortChannel {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortChannel {
    pub fn new(port: Box<dyn serialport::SerialPort>) -> Self {
        Self { port }
    }
}

impl SerialChannel for SerialPortChannel {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.port)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut self.port, buf)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        Ok(self.port.write_data_terminal_ready(level)?)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(self.port.clear(serialport::ClearBuffer::Input)?)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortConnector;

impl SerialConnector for SerialPortConnector {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialChannel>> {
        let port = serialport::new(port, baud_rate)
            .timeout(Duration::from_secs(1))
            .flow_control(serialport::FlowControl::None)
            .open()?;
        Ok(Box::new(SerialPortChannel::new(port)))
    }
}

/// XOR of every byte of the unframed payload.
pub fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0, |crc, byte| crc ^ byte)
}

pub fn frame(payload: &str) -> Result<FrameBuffer, TransportError> {
    if let Some(reserved) = payload.chars().find(|c| *c == FRAME_START || *c == FRAME_END) {
        return Err(TransportError::ReservedCharacter(reserved));
    }

    let crc = checksum(payload).to_string();
    let mut buffer = FrameBuffer::new();
    buffer.try_push(FRAME_START).map_err(|_| TransportError::FrameTooLarge)?;
    buffer.try_push_str(payload).map_err(|_| TransportError::FrameTooLarge)?;
    buffer.try_push_str(&crc).map_err(|_| TransportError::FrameTooLarge)?;
    buffer.try_push(FRAME_END).map_err(|_| TransportError::FrameTooLarge)?;
    Ok(buffer)
}

/// Splits a captured frame back into payload and transmitted checksum.
pub fn parse_frame(frame: &str) -> Option<(&str, u8)> {
    let body = frame.strip_prefix(FRAME_START)?.strip_suffix(FRAME_END)?;
    let digits = body.len() - body.bytes().rev().take_while(u8::is_ascii_digit).count();
    // A payload always ends in ';', so the trailing digits are the checksum.
    let (payload, crc) = body.split_at(digits);
    Some((payload, crc.parse().ok()?))
}

pub struct FramedTransport {
    channel: Box<dyn SerialChannel>,
    config: TransportConfig,
}

impl FramedTransport {
    pub fn new(channel: Box<dyn SerialChannel>, config: TransportConfig) -> Self {
        Self { channel, config }
    }

    /// Frames `payload` and pushes it out. Returns once the frame is flushed.
    pub fn write(&mut self, payload: &str) -> Result<(), TransportError> {
        let framed = frame(payload)?;
        trace!("-> {}", framed);
        self.channel.write_all(framed.as_bytes())?;
        self.channel.flush()?;
        Ok(())
    }

    /// Collects the board's reply.
    ///
    /// Waits up to the arrival timeout for a first byte, then keeps draining
    /// for the settle window. Silence yields an empty string.
    pub async fn read_response(&mut self) -> Result<String, TransportError> {
        let tick = Duration::from_millis(self.config.poll_tick_ms.max(1));
        let arrival_deadline = Instant::now() + Duration::from_millis(self.config.arrival_timeout_ms);

        while self.channel.bytes_available()? == 0 {
            if Instant::now() >= arrival_deadline {
                debug!("no reply within {} ms", self.config.arrival_timeout_ms);
                return Ok(String::new());
            }
            sleep(tick).await;
        }

        let settle_deadline = Instant::now() + Duration::from_millis(self.config.settle_window_ms);
        let mut raw = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let available = self.channel.bytes_available()?;
            if available > 0 {
                let wanted = available.min(chunk.len());
                let read = self.channel.read(&mut chunk[..wanted])?;
                raw.extend_from_slice(&chunk[..read]);
            }
            if Instant::now() >= settle_deadline {
                break;
            }
            sleep(tick).await;
        }

        Ok(decode_lines(&raw))
    }

    /// `write` followed by `read_response`.
    pub async fn exchange(&mut self, payload: &str) -> Result<String, TransportError> {
        self.write(payload)?;
        self.read_response().await
    }
}

/// Newline-separated, trimmed lines. Blank lines and lines that are not valid
/// UTF-8 are dropped one by one.
pub fn decode_lines(raw: &[u8]) -> String {
    raw.split(|byte| *byte == b'\n')
        .filter_map(|line| std::str::from_utf8(line).ok())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
