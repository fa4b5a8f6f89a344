/*!
KStat command protocol and scan stream decoder.

Every command is announced with its length first:

```text
host   -> "!{n}\r\n"
device -> "@ACK {n}\n"
host   -> command body
device -> "@RCV {n}\n"
```

A wrong echo is retried after a delay, up to the attempt budget. A silent
device (empty line within the read timeout) gets a fresh budget each time,
bounded by the number of unresponsive rounds the policy allows.

Scan data arrives as a binary stream of `B\n`-tagged little-endian records,
`S\n` between scans and `@DONE\n` at the end.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use tracing::{debug, info, warn};

use crate::command::CommandFrame;
use crate::error::{ProtocolError, Result};
use crate::link::DeviceLink;
use crate::protocol::{
    ABORT_BYTE, DONE_MARKER, SAMPLE_TAG, SCAN_DELIMITER, STREAM_CHUNK_BYTES, WARMUP_SAMPLES,
};
use crate::scan::{CurrentShape, Scan, ScanSample};
use crate::units::{IvGain, PgaGain, SampleRate};

/// Shared cancellation flag for a running measurement
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handshake retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per budget when the device echoes the wrong length
    pub attempts: u32,
    /// Pause before re-announcing after a wrong echo
    pub retry_delay: Duration,
    /// How many fresh budgets a silent device gets before giving up
    pub max_unresponsive_rounds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(1),
            max_unresponsive_rounds: 10,
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Longest sleep between cancellation checks while pausing
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Sleep for `delay` in slices; false when `cancel` was set meanwhile
fn pause(delay: Duration, cancel: &CancelToken) -> bool {
    let mut left = delay;
    while !left.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = left.min(PAUSE_SLICE);
        thread::sleep(slice);
        left -= slice;
    }
    !cancel.is_cancelled()
}

/// Command sender bound to a retry policy
#[derive(Debug, Clone, Default)]
pub struct Codec {
    policy: RetryPolicy,
}

impl Codec {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Announce, send and confirm one command
    pub fn send_command(&self, link: &mut dyn DeviceLink, frame: &CommandFrame) -> Result<()> {
        self.send_command_until(link, frame, &CancelToken::new())
    }

    /// [`Codec::send_command`] that gives up with [`ProtocolError::Cancelled`]
    /// once `cancel` is set. The token is checked before every announcement
    /// and during retry pauses.
    pub fn send_command_until(&self, link: &mut dyn DeviceLink, frame: &CommandFrame, cancel: &CancelToken) -> Result<()> {
        let len = frame.announced_len();
        let announcement = format!("!{}\r\n", len);
        let expected_ack = format!("@ACK {}\n", len);
        let expected_rcv = format!("@RCV {}\n", len);
        let body = frame.to_bytes();

        let mut attempt = 0u32;
        let mut silent_rounds = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            attempt += 1;
            debug!("→ {} (attempt {}, {})", frame, attempt, hex::encode(&body));
            link.write_all(announcement.as_bytes())?;
            let ack = link.read_line()?;

            if ack.is_empty() {
                silent_rounds += 1;
                if silent_rounds >= self.policy.max_unresponsive_rounds {
                    return Err(ProtocolError::Unresponsive { rounds: silent_rounds });
                }
                warn!("KStat unresponsive, trying again ({}/{})", silent_rounds, self.policy.max_unresponsive_rounds);
                attempt = 0;
                continue;
            }

            let (expected, got) = if ack == expected_ack.as_bytes() {
                link.write_all(&body)?;
                let receipt = link.read_line()?;
                if receipt == expected_rcv.as_bytes() {
                    info!("Command {} sent to KStat", frame);
                    return Ok(());
                }
                (&expected_rcv, receipt)
            } else {
                (&expected_ack, ack)
            };

            if attempt >= self.policy.attempts {
                return Err(ProtocolError::HandshakeExhausted {
                    attempts: attempt,
                    expected: expected.clone(),
                    got: lossy(&got),
                });
            }

            warn!(
                "Sending {} not successful (expected {:?}, got {:?}), retrying in {:?}",
                frame.mnemonic(),
                expected,
                lossy(&got),
                self.policy.retry_delay
            );
            if !pause(self.policy.retry_delay, cancel) {
                return Err(ProtocolError::Cancelled);
            }
        }
    }

    /// Hold the working electrode at `mv`
    pub fn idle(&self, link: &mut dyn DeviceLink, mv: f64) -> Result<()> {
        self.send_command(link, &CommandFrame::idle(mv))
    }

    /// Abort whatever the instrument is running and drain its reply
    pub fn abort(&self, link: &mut dyn DeviceLink) -> Result<()> {
        link.write_all(&[ABORT_BYTE])?;
        for _ in 0..3 {
            link.read_line()?;
        }
        debug!("Abort sent");
        Ok(())
    }

    /// Configure the ADC and check that the instrument confirmed it
    pub fn setup_adc(
        &self,
        link: &mut dyn DeviceLink,
        buffer: bool,
        rate: SampleRate,
        pga: PgaGain,
    ) -> Result<()> {
        self.send_command(link, &CommandFrame::setup_adc(buffer, rate, pga))?;

        let mut last = Vec::new();
        for _ in 0..3 {
            last = link.read_line()?;
        }
        if last != DONE_MARKER {
            return Err(ProtocolError::Setup { mnemonic: "EA", detail: lossy(&last) });
        }
        info!("ADC settings updated (PGA {}, {}, buffer {})", pga.value(), rate, buffer);
        Ok(())
    }

    /// Select the transimpedance gain and check that the instrument confirmed it
    pub fn set_gain(&self, link: &mut dyn DeviceLink, gain: IvGain) -> Result<()> {
        self.send_command(link, &CommandFrame::set_gain(gain))?;

        let mut echoed = Vec::new();
        let mut last = Vec::new();
        for i in 0..4 {
            last = link.read_line()?;
            if i == 2 {
                echoed = last.clone();
            }
        }
        if last != DONE_MARKER {
            return Err(ProtocolError::Setup { mnemonic: "EG", detail: lossy(&last) });
        }
        info!("Gain settings updated: {} ({})", gain, lossy(&echoed).trim());
        Ok(())
    }

    /// Read the scan stream until a chunk carries the terminal marker.
    ///
    /// The marker is looked for in the latest chunk only. There is no idle
    /// timeout because preconditioning can keep the device quiet for minutes;
    /// `cancel` is the way out, and it aborts the instrument before returning.
    pub fn read_scan_stream(&self, link: &mut dyn DeviceLink, cancel: &CancelToken) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(STREAM_CHUNK_BYTES * 4);
        let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];

        loop {
            if cancel.is_cancelled() {
                warn!("Cancellation requested, aborting instrument");
                self.abort(link)?;
                return Err(ProtocolError::Cancelled);
            }

            let n = link.read_chunk(&mut chunk)?;
            buffer.extend_from_slice(&chunk[..n]);

            if n > 0 && contains(&chunk[..n], DONE_MARKER) {
                info!("Data received ({} bytes)", buffer.len());
                return Ok(buffer.freeze());
            }
        }
    }
}

#[derive(Default)]
struct RecordGroup<'a> {
    records: Vec<&'a [u8]>,
    terminated: bool,
}

/// Split a stream into per-scan groups of raw sample records
fn group_records(bytes: &[u8], shape: CurrentShape) -> Result<Vec<RecordGroup<'_>>> {
    let pattern = format!(r"(?s-u)(B\n.{{{}}}\n*)|(S\n)|(@DONE\n)", shape.body_len());
    let re = Regex::new(&pattern).map_err(|e| ProtocolError::malformed(e.to_string()))?;

    let mut groups = vec![RecordGroup::default()];
    for m in re.find_iter(bytes) {
        let record = m.as_bytes();
        let current = groups.len() - 1;
        if record == SCAN_DELIMITER {
            groups.push(RecordGroup::default());
        } else if record == DONE_MARKER {
            groups[current].terminated = true;
        } else {
            groups[current].records.push(record);
        }
    }

    if !groups.last().map(|g| g.terminated).unwrap_or(false) {
        return Err(ProtocolError::MissingTerminator);
    }
    if groups.last().map(|g| g.records.is_empty()).unwrap_or(false) {
        groups.pop();
    }

    Ok(groups)
}

/// Unpack one `B\n`-tagged record; `None` when the framing is off
fn parse_record(record: &[u8], shape: CurrentShape) -> Option<ScanSample> {
    let body_end = SAMPLE_TAG.len() + shape.body_len();
    // Exactly one trailing newline
    if record.len() != body_end + 1 {
        return None;
    }

    let potential = u16::from_le_bytes([record[2], record[3]]);
    let current = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
    let backward = match shape {
        CurrentShape::Single => None,
        CurrentShape::Dual => Some(i32::from_le_bytes([record[8], record[9], record[10], record[11]])),
    };

    Some(ScanSample { potential, current, backward })
}

/// Currents in this band come from a saturated or reset converter
fn is_saturated(current: i32) -> bool {
    (-16..=15).contains(&current)
}

/// Decode a complete scan stream.
///
/// Returns one [`Scan`] per group with the first three samples of each
/// dropped. `frame_count_hint` is the configured repeat count and is only
/// used to flag mismatches.
pub fn decode_scan_stream(bytes: &[u8], shape: CurrentShape, frame_count_hint: usize) -> Result<Vec<Scan>> {
    let groups = group_records(bytes, shape)?;

    let mut scans = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let mut samples = Vec::with_capacity(group.records.len());
        for record in &group.records {
            match parse_record(record, shape) {
                Some(sample) if shape == CurrentShape::Single && is_saturated(sample.current) => {
                    debug!("Dropping saturated sample in scan {}", index);
                }
                Some(sample) => samples.push(sample),
                None => debug!("Skipping malformed record in scan {}: {}", index, hex::encode(record)),
            }
        }

        let kept = samples.split_off(WARMUP_SAMPLES.min(samples.len()));
        scans.push(Scan::new(shape, kept));
    }

    if scans.len() != frame_count_hint {
        warn!("Decoded {} scans, expected {}", scans.len(), frame_count_hint);
    }

    Ok(scans)
}

/// Decode a cyclic or linear sweep stream
pub fn decode_single_current(bytes: &[u8], frame_count_hint: usize) -> Result<Vec<Scan>> {
    decode_scan_stream(bytes, CurrentShape::Single, frame_count_hint)
}

/// Decode a differential pulse or square wave stream
pub fn decode_dual_current(bytes: &[u8], frame_count_hint: usize) -> Result<Vec<Scan>> {
    decode_scan_stream(bytes, CurrentShape::Dual, frame_count_hint)
}
