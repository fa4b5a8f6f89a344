/*!
Common error types for the KStat backend components.

Transport failures ([`LinkError`]) are what the serial link reports. The codec
retries the retryable ones and wraps whatever is left into a
[`ProtocolError`], which is what callers of the codec see.
*/

use thiserror::Error;

/// Result type used by the protocol codec
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Byte-level transport failures
#[derive(Error, Debug)]
pub enum LinkError {
    /// I/O errors from the underlying port
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The port could not be opened or configured
    #[error("Serial port error: {0}")]
    Port(#[from] serialport::Error),

    /// The link was closed on the far side
    #[error("Link closed")]
    Closed,
}

/// Failures of the command handshake or the scan data stream
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The device answered, but never with the expected echo
    #[error("Handshake failed after {attempts} attempts: expected {expected:?}, got {got:?}")]
    HandshakeExhausted {
        attempts: u32,
        expected: String,
        got: String,
    },

    /// The device did not answer at all, even after refreshed retry budgets
    #[error("Device unresponsive after {rounds} rounds")]
    Unresponsive { rounds: u32 },

    /// The scan stream did not end with the terminal marker
    #[error("Data transmission failed: terminal marker missing")]
    MissingTerminator,

    /// The stream or a response line could not be interpreted
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// A setup command (ADC, gain) completed its handshake but not its work
    #[error("Setup command {mnemonic} not confirmed: {detail}")]
    Setup { mnemonic: &'static str, detail: String },

    /// The running measurement was cancelled and the instrument aborted
    #[error("Measurement cancelled")]
    Cancelled,

    /// Transport failure
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

impl ProtocolError {
    /// Create a new malformed data error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether repeating the same exchange can reasonably succeed.
    ///
    /// Handshake mismatches and silent links are retried inside the codec;
    /// everything else is fatal to the current measurement.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandshakeExhausted { .. } | Self::Unresponsive { .. } => true,
            Self::Link(LinkError::Io(e)) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        Self::Link(LinkError::Io(e))
    }
}
