#![allow(dead_code)]

use pulsebus::config::{ActorConfig, LoopConfig, TransportConfig};
use pulsebus::firmware::{FirmwareError, FirmwareToolchain};
use pulsebus::transport::{parse_frame, SerialChannel, SerialConnector};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const MOCK_PORT: &str = "/dev/ttyMOCK0";
pub const MOCK_SERIAL: &str = "MOCK-0001";

/// Actor config with timings short enough for tests.
pub fn test_config(name: &str) -> ActorConfig {
    let mut config = ActorConfig::default();
    config.name = name.to_string();
    config.device.port = MOCK_PORT.to_string();
    config.device.serial_number = MOCK_SERIAL.to_string();
    config.transport = TransportConfig {
        arrival_timeout_ms: 20,
        settle_window_ms: 5,
        poll_tick_ms: 1,
    };
    config.loop_timing = LoopConfig {
        waiting_time_ms: 10,
        heartbeat_interval_ms: 20,
        join_timeout_ms: 500,
    };
    config.reprogram.dtr_low_ms = 1;
    config.reprogram.reboot_settle_ms = 1;
    config
}

#[derive(Debug, Default)]
struct BoardState {
    frames: Vec<String>,
    payloads: Vec<String>,
    pending: VecDeque<u8>,
    scripted: VecDeque<Vec<(Duration, Vec<u8>)>>,
    later: VecDeque<(Instant, Vec<u8>)>,
    dtr_levels: Vec<bool>,
}

impl BoardState {
    /// Moves chunks whose release time has passed into the input buffer.
    fn release_due(&mut self) {
        let now = Instant::now();
        while self.later.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, chunk)) = self.later.pop_front() {
                self.pending.extend(chunk);
            }
        }
    }
}

/// In-memory trigger board. By default it answers every frame with
/// `ACK <payload>`; scripted replies take precedence, and a silent board
/// answers nothing.
#[derive(Clone, Default)]
pub struct MockBoard {
    state: Arc<Mutex<BoardState>>,
    silent: Arc<AtomicBool>,
    write_delay_ms: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    fail_open: Arc<AtomicBool>,
    in_use: Arc<AtomicBool>,
    reentries: Arc<AtomicUsize>,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent(self) -> Self {
        self.silent.store(true, Ordering::SeqCst);
        self
    }

    /// Blocks the writer for `ms` on every frame.
    pub fn slow(self, ms: usize) -> Self {
        self.write_delay_ms.store(ms, Ordering::SeqCst);
        self
    }

    pub fn failing_open(self) -> Self {
        self.fail_open.store(true, Ordering::SeqCst);
        self
    }

    pub fn script_reply(&self, raw: &[u8]) {
        self.script_chunks(&[(0, raw)]);
    }

    /// Next reply arrives in pieces, each `ms` after the frame was written.
    pub fn script_chunks(&self, chunks: &[(u64, &[u8])]) {
        let chunks = chunks
            .iter()
            .map(|(ms, raw)| (Duration::from_millis(*ms), raw.to_vec()))
            .collect();
        self.state.lock().unwrap().scripted.push_back(chunks);
    }

    /// Bytes already waiting before anything is written.
    pub fn preload(&self, raw: &[u8]) {
        self.state.lock().unwrap().pending.extend(raw.iter().copied());
    }

    pub fn frames(&self) -> Vec<String> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.state.lock().unwrap().payloads.clone()
    }

    pub fn dtr_levels(&self) -> Vec<bool> {
        self.state.lock().unwrap().dtr_levels.clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Times a channel method was entered while another was still running.
    pub fn reentries(&self) -> usize {
        self.reentries.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InUse<'_> {
        if self.in_use.swap(true, Ordering::SeqCst) {
            self.reentries.fetch_add(1, Ordering::SeqCst);
        }
        InUse(&self.in_use)
    }

    pub fn channel(&self) -> Box<dyn SerialChannel> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Box::new(MockChannel { board: self.clone() })
    }

    pub fn connector(&self) -> Arc<dyn SerialConnector> {
        Arc::new(MockConnector { board: self.clone() })
    }
}

struct InUse<'a>(&'a AtomicBool);

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MockChannel {
    board: MockBoard,
}

impl SerialChannel for MockChannel {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let _in_use = self.board.enter();
        let delay = self.board.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay as u64));
        }

        let frame = String::from_utf8_lossy(bytes).to_string();
        let payload = parse_frame(&frame).map(|(payload, _)| payload.to_string()).unwrap_or_default();
        let mut state = self.board.state.lock().unwrap();
        let chunks = match state.scripted.pop_front() {
            Some(chunks) => chunks,
            None if self.board.silent.load(Ordering::SeqCst) => Vec::new(),
            None => vec![(Duration::ZERO, format!("ACK {}\r\n", payload).into_bytes())],
        };
        let written_at = Instant::now();
        for (offset, chunk) in chunks {
            state.later.push_back((written_at + offset, chunk));
        }
        state.release_due();
        state.frames.push(frame);
        state.payloads.push(payload);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let _in_use = self.board.enter();
        let mut state = self.board.state.lock().unwrap();
        state.release_due();
        Ok(state.pending.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let _in_use = self.board.enter();
        let mut state = self.board.state.lock().unwrap();
        state.release_due();
        let mut read = 0;
        while read < buf.len() {
            match state.pending.pop_front() {
                Some(byte) => {
                    buf[read] = byte;
                    read += 1;
                }
                None => break,
            }
        }
        Ok(read)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.board.state.lock().unwrap().dtr_levels.push(level);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.board.state.lock().unwrap().pending.clear();
        Ok(())
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.board.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockConnector {
    board: MockBoard,
}

impl SerialConnector for MockConnector {
    fn open(&self, port: &str, _baud_rate: u32) -> io::Result<Box<dyn SerialChannel>> {
        if self.board.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{} not found", port)));
        }
        Ok(self.board.channel())
    }
}

/// Firmware toolchain that records its invocations instead of running them.
#[derive(Default)]
pub struct MockToolchain {
    pub fail_compile: bool,
    pub fail_upload: bool,
    pub calls: Mutex<Vec<String>>,
}

impl MockToolchain {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn result(&self, tool: &str, fail: bool) -> Result<(), FirmwareError> {
        if fail {
            Err(FirmwareError::ToolFailed {
                tool: tool.to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("{} failed", tool),
            })
        } else {
            Ok(())
        }
    }
}

impl FirmwareToolchain for MockToolchain {
    fn compile(&self, sketch_dir: &Path, fqbn: &str, _output_dir: &Path) -> Result<(), FirmwareError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("compile {} {}", fqbn, sketch_dir.display()));
        self.result("compile", self.fail_compile)
    }

    fn upload(&self, sketch_dir: &Path, fqbn: &str, port: &str) -> Result<(), FirmwareError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("upload {} {} {}", fqbn, port, sketch_dir.display()));
        self.result("upload", self.fail_upload)
    }
}
