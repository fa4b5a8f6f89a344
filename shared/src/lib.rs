/*!
# Shared Types and Utilities

This crate contains the instrument-facing half of the KStat backend: the
serial link, the command protocol and the scan data decoder.

## Core Types

- [`CommandFrame`] - one ASCII command with its arguments
- [`Scan`] / [`ScanSample`] - decoded voltammetry data
- [`DeviceLink`] - byte transport to the instrument

## Modules

- [`codec`] - handshake, retries, scan stream reading and decoding
- [`command`] - command construction
- [`link`] - serial and in-memory links
- [`scan`] - decoded data types
- [`sim`] - simulated instrument for tests and dry runs
- [`units`] - mV/DAC and ADC/ampere conversions
- [`error`] - common error types
*/

pub mod codec;
pub mod command;
pub mod error;
pub mod link;
pub mod scan;
pub mod sim;
pub mod units;

// Re-export commonly used types
pub use codec::{CancelToken, Codec, RetryPolicy};
pub use command::CommandFrame;
pub use error::{LinkError, ProtocolError, Result};
pub use link::{DeviceLink, SerialLink};
pub use scan::{CurrentShape, Scan, ScanSample};
pub use units::{IvGain, PgaGain, SampleRate};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// DAC codes per millivolt (65536 codes over 4096 mV)
    pub const DAC_CODES_PER_MV: f64 = 65536.0 / 4096.0;

    /// DAC code of 0 mV
    pub const DAC_ZERO_OFFSET: f64 = 32768.0;

    /// Full-scale ADC count (2^23 - 1)
    pub const ADC_FULL_SCALE: f64 = 8_388_607.0;

    /// Terminal marker closing every data stream and setup reply
    pub const DONE_MARKER: &[u8] = b"@DONE\n";

    /// Marker between consecutive scans
    pub const SCAN_DELIMITER: &[u8] = b"S\n";

    /// Tag in front of every binary sample record
    pub const SAMPLE_TAG: &[u8] = b"B\n";

    /// Byte that aborts a running experiment
    pub const ABORT_BYTE: u8 = b'a';

    /// Chunk size used when draining a scan stream
    pub const STREAM_CHUNK_BYTES: usize = 2500;

    /// Samples dropped from the start of every scan (instrument warm-up)
    pub const WARMUP_SAMPLES: usize = 3;
}
