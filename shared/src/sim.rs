/*!
Simulated KStat board.

Speaks the handshake, answers setup commands and emits synthetic scan
streams, so the backend can be exercised without hardware. Clones share
state, so a test can keep one clone for inspection after handing the other to
the code under test.
*/

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::LinkError;
use crate::link::DeviceLink;
use crate::protocol::{ABORT_BYTE, DONE_MARKER, SAMPLE_TAG, SCAN_DELIMITER};

/// Encode one binary sample record as the instrument sends it
pub fn encode_record(potential: u16, current: i32, backward: Option<i32>) -> Vec<u8> {
    let mut record = Vec::with_capacity(13);
    record.extend_from_slice(SAMPLE_TAG);
    record.extend_from_slice(&potential.to_le_bytes());
    record.extend_from_slice(&current.to_le_bytes());
    if let Some(b) = backward {
        record.extend_from_slice(&b.to_le_bytes());
    }
    record.push(b'\n');
    record
}

/// Handshake misbehaviour to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFault {
    None,
    /// Every acknowledgement echoes the wrong length
    WrongAck,
    /// Acknowledgements are fine, receipts echo the wrong length
    WrongReceipt,
    /// The first `failures` acknowledgements are wrong
    FlakyAck { failures: u32 },
    /// The first `rounds` announcements get no answer at all
    Silent { rounds: u32 },
}

/// When the scan stream of a started experiment becomes readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// The whole stream is queued as soon as the command is received
    Immediate,
    /// Nothing is sent until the host aborts
    Hold,
}

#[derive(Debug)]
struct SimState {
    fault: HandshakeFault,
    stream_mode: StreamMode,
    scans: usize,
    samples_per_scan: usize,
    idle_read_delay: Duration,
    input: Vec<u8>,
    output: VecDeque<u8>,
    pending_len: Option<usize>,
    announcements: u32,
    aborts: u32,
    commands: Vec<String>,
}

/// In-memory instrument implementing [`DeviceLink`]
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// A well-behaved device emitting one scan of 10 samples per experiment
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                fault: HandshakeFault::None,
                stream_mode: StreamMode::Immediate,
                scans: 1,
                samples_per_scan: 10,
                idle_read_delay: Duration::from_millis(1),
                input: Vec::new(),
                output: VecDeque::new(),
                pending_len: None,
                announcements: 0,
                aborts: 0,
                commands: Vec::new(),
            })),
        }
    }

    pub fn with_fault(self, fault: HandshakeFault) -> Self {
        self.lock().fault = fault;
        self
    }

    pub fn with_stream_mode(self, mode: StreamMode) -> Self {
        self.lock().stream_mode = mode;
        self
    }

    pub fn with_scans(self, scans: usize, samples_per_scan: usize) -> Self {
        {
            let mut state = self.lock();
            state.scans = scans;
            state.samples_per_scan = samples_per_scan;
        }
        self
    }

    /// Number of `!{n}` announcements received
    pub fn announcements(&self) -> u32 {
        self.lock().announcements
    }

    /// Number of abort bytes received
    pub fn aborts(&self) -> u32 {
        self.lock().aborts
    }

    /// Command bodies received after a matching acknowledgement, trimmed
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not hide the recorded traffic
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SimState {
    fn respond(&mut self, line: &str) {
        self.output.extend(line.as_bytes());
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        if line.first() == Some(&b'!') {
            self.announcements += 1;
            let text = String::from_utf8_lossy(&line[1..]).trim().to_string();
            let Ok(len) = text.parse::<usize>() else {
                debug!("Simulator: bad announcement {:?}", text);
                return;
            };

            let n = self.announcements;
            match self.fault {
                HandshakeFault::Silent { rounds } if n <= rounds => return,
                HandshakeFault::WrongAck => self.respond(&format!("@ACK {}\n", len + 1)),
                HandshakeFault::FlakyAck { failures } if n <= failures => {
                    self.respond(&format!("@ACK {}\n", len + 1))
                }
                _ => self.respond(&format!("@ACK {}\n", len)),
            }
            self.pending_len = Some(len);
            return;
        }

        if self.pending_len.take().is_none() {
            debug!("Simulator: unexpected line {:?}", String::from_utf8_lossy(&line));
            return;
        }

        let received = line.len().saturating_sub(2);
        if self.fault == HandshakeFault::WrongReceipt {
            self.respond(&format!("@RCV {}\n", received + 1));
        } else {
            self.respond(&format!("@RCV {}\n", received));
        }

        let text = String::from_utf8_lossy(&line).trim().to_string();
        let mnemonic: String = text.chars().take(2).collect();
        self.commands.push(text);
        self.dispatch(&mnemonic);
    }

    fn dispatch(&mut self, mnemonic: &str) {
        match mnemonic {
            "EA" => {
                self.respond("A\n");
                self.respond("ADC ready\n");
                self.output.extend(DONE_MARKER);
            }
            "EG" => {
                self.respond("G\n");
                self.respond("Gain set\n");
                self.respond("POT_GAIN\n");
                self.output.extend(DONE_MARKER);
            }
            "EC" | "EL" => self.queue_stream(false),
            "ED" | "ES" => self.queue_stream(true),
            _ => {}
        }
    }

    fn queue_stream(&mut self, dual: bool) {
        if self.stream_mode == StreamMode::Hold {
            return;
        }

        for scan in 0..self.scans {
            if scan > 0 {
                self.output.extend(SCAN_DELIMITER);
            }
            for i in 0..self.samples_per_scan {
                // A ramp with a current well outside the saturation band
                let potential = 31_168u16.wrapping_add((i as u16).wrapping_mul(16));
                let current = 20_000 + 1_000 * i as i32 + 100 * scan as i32;
                let backward = dual.then_some(current / 2);
                self.output.extend(encode_record(potential, current, backward));
            }
        }
        self.output.extend(DONE_MARKER);
        info!("🧪 Simulator queued {} scan(s) of {} samples", self.scans, self.samples_per_scan);
    }

    fn abort(&mut self) {
        self.aborts += 1;
        self.output.clear();
        self.pending_len = None;
        for _ in 0..3 {
            self.respond("@ABORT\n");
        }
    }
}

impl DeviceLink for SimulatedDevice {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut state = self.lock();
        for &byte in bytes {
            if byte == ABORT_BYTE && state.input.is_empty() {
                state.abort();
                continue;
            }
            state.input.push(byte);
            if byte == b'\n' {
                let line = std::mem::take(&mut state.input);
                state.handle_line(line);
            }
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let (n, delay) = {
            let mut state = self.lock();
            let n = buf.len().min(state.output.len());
            for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
                *slot = byte;
            }
            (n, state.idle_read_delay)
        };
        if n == 0 {
            // Stand in for the port's read timeout
            thread::sleep(delay);
        }
        Ok(n)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut state = self.lock();
        let Some(end) = state.output.iter().position(|&b| b == b'\n') else {
            // Timed out: hand back whatever partial line is buffered
            return Ok(state.output.drain(..).collect());
        };
        Ok(state.output.drain(..=end).collect())
    }
}
