/*!
Byte-level transport to the instrument.

The codec only needs three primitives: write everything, read a chunk of up to
N bytes within the read timeout, and read one LF-terminated line within the
read timeout. Both reads return whatever arrived before the timeout, which may
be nothing. An empty read is how a silent device shows up; a port that
reaches end of stream (the board was unplugged) reports [`LinkError::Closed`].
*/

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::LinkError;

/// Transport contract the protocol codec relies on
pub trait DeviceLink: Send {
    /// Write all bytes and flush
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Read up to `buf.len()` bytes, returning early when the read timeout
    /// elapses. Returns the number of bytes stored, 0 on timeout.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Read up to and including the next `\n`. Returns the partial line (or
    /// an empty vector) when the read timeout elapses first.
    fn read_line(&mut self) -> Result<Vec<u8>, LinkError>;
}

impl<L: DeviceLink + ?Sized> DeviceLink for Box<L> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).write_all(bytes)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        (**self).read_chunk(buf)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        (**self).read_line()
    }
}

/// Serial port link to a KStat/DStat board
pub struct SerialLink {
    port_name: String,
    timeout: Duration,
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open a serial port with the given baud rate and read timeout
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, LinkError> {
        let port = serialport::new(port_name, baud_rate).timeout(timeout).open()?;
        info!("🔌 Opened {} at {} baud", port_name, baud_rate);

        Ok(Self {
            port_name: port_name.to_string(),
            timeout,
            port,
        })
    }

    /// Find the first port whose name or USB product string contains `hint`
    ///
    /// The boards enumerate as `/dev/serial/by-id/usb-...DStat...` on Linux.
    pub fn find_port(hint: &str) -> Result<Option<String>, LinkError> {
        let ports = serialport::available_ports()?;
        let found = ports.into_iter().find(|p| {
            if p.port_name.contains(hint) {
                return true;
            }
            match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => usb
                    .product
                    .as_deref()
                    .map(|product| product.contains(hint))
                    .unwrap_or(false),
                _ => false,
            }
        });
        Ok(found.map(|p| p.port_name))
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
}

/// Fill `buf` from `reader` until it is full, the reader times out or
/// `timeout` elapses. End of stream before any byte is [`LinkError::Closed`].
fn read_chunk_from<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(LinkError::Closed),
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => break,
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            break;
        }
    }

    Ok(filled)
}

/// Read up to and including the next `\n`. End of stream before any byte is
/// [`LinkError::Closed`]; a partial line is returned as is.
fn read_line_from<R: Read + ?Sized>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>, LinkError> {
    let deadline = Instant::now() + timeout;
    let mut line = Vec::with_capacity(32);
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) if line.is_empty() => return Err(LinkError::Closed),
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(e) if is_timeout(&e) => break,
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            debug!("Line read timed out after {} bytes", line.len());
            break;
        }
    }

    Ok(line)
}

impl DeviceLink for SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        read_chunk_from(&mut self.port, buf, self.timeout)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        read_line_from(&mut self.port, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Reader that times out once its data is used up, like an idle port
    struct Quiet(Cursor<Vec<u8>>);

    impl Read for Quiet {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(io::Error::from(io::ErrorKind::TimedOut)),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn test_lines_and_timeouts() {
        let mut port = Quiet(Cursor::new(b"@ACK 9\n@RC".to_vec()));
        let timeout = Duration::from_secs(1);

        assert_eq!(read_line_from(&mut port, timeout).unwrap(), b"@ACK 9\n".to_vec());
        assert_eq!(read_line_from(&mut port, timeout).unwrap(), b"@RC".to_vec());
        assert!(read_line_from(&mut port, timeout).unwrap().is_empty());

        let mut buf = [0u8; 8];
        assert_eq!(read_chunk_from(&mut port, &mut buf, timeout).unwrap(), 0);
    }

    #[test]
    fn test_end_of_stream_is_closed() {
        let timeout = Duration::from_secs(1);
        let mut port = Cursor::new(b"@DONE".to_vec());

        assert_eq!(read_line_from(&mut port, timeout).unwrap(), b"@DONE".to_vec());
        assert!(matches!(read_line_from(&mut port, timeout), Err(LinkError::Closed)));

        let mut buf = [0u8; 4];
        let mut port = Cursor::new(b"B\n".to_vec());
        assert_eq!(read_chunk_from(&mut port, &mut buf, timeout).unwrap(), 2);
        assert!(matches!(read_chunk_from(&mut port, &mut buf, timeout), Err(LinkError::Closed)));
    }
}
