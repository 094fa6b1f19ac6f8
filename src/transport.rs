//! The byte link to the radio.
//!
//! Both engine threads hold the same [Transport] behind an `Arc`, so reads
//! and writes go through `&self`. A read that times out with nothing
//! received is not an error, it returns `Ok(0)` so the receiver can check
//! for shutdown and go around again.

use serial2::SerialPort;
use std::{
    collections::VecDeque,
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

/// Default baud rate of the radio's USB serial bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// How long a single read blocks before giving control back.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A shared, thread-safe byte link.
pub trait Transport: Send + Sync {
    /// Read whatever is available into `buf`. Returns `Ok(0)` when the read
    /// timeout elapsed without any data.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf`.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;
}

impl Transport for SerialPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match SerialPort::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        SerialPort::write_all(self, buf)
    }
}

/// Open a serial port and give it a short read timeout so readers stay
/// responsive to shutdown.
pub fn open_serial(
    path: impl AsRef<Path>,
    baud_rate: u32,
    poll_interval: Duration,
) -> io::Result<SerialPort> {
    let mut port = SerialPort::open(path, baud_rate)?;
    port.set_read_timeout(poll_interval)?;
    Ok(port)
}

/// One direction of an in-memory link.
#[derive(Debug, Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Pipe {
    fn push(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(data);
        self.ready.notify_all();
        Ok(())
    }

    fn pull(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let guard = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut bytes, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |b| {
                b.is_empty() && !self.closed.load(Ordering::SeqCst)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if bytes.is_empty() && self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }

        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

/// Build a connected pair of in-memory endpoints. The [HostEnd] is a
/// [Transport] for the engine; the [DeviceEnd] plays the radio.
pub fn memory_link(poll_interval: Duration) -> (HostEnd, DeviceEnd) {
    let to_device = Arc::new(Pipe::default());
    let to_host = Arc::new(Pipe::default());

    let host = HostEnd {
        outbound: Arc::clone(&to_device),
        inbound: Arc::clone(&to_host),
        poll_interval,
    };
    let device = DeviceEnd {
        outbound: to_host,
        inbound: to_device,
    };

    (host, device)
}

/// Host side of an in-memory link.
#[derive(Debug)]
pub struct HostEnd {
    outbound: Arc<Pipe>,
    inbound: Arc<Pipe>,
    poll_interval: Duration,
}

impl Transport for HostEnd {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inbound.pull(buf, self.poll_interval)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.outbound.push(buf)
    }
}

/// Device side of an in-memory link. Reads the enveloped commands the host
/// wrote and injects raw UCI frames back.
#[derive(Debug)]
pub struct DeviceEnd {
    outbound: Arc<Pipe>,
    inbound: Arc<Pipe>,
}

impl DeviceEnd {
    /// Send raw bytes to the host.
    pub fn inject(&self, bytes: &[u8]) -> io::Result<()> {
        self.outbound.push(bytes)
    }

    /// Wait up to `timeout` for the next enveloped command from the host and
    /// return the UCI command bytes inside it.
    pub fn next_command(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;

        let mut envelope = [0u8; 3];
        if self.pull_exact(&mut envelope, deadline)? < envelope.len() {
            return Ok(None);
        }

        // the envelope is always written whole, so the body is already here
        let mut command = vec![0u8; envelope[2] as usize];
        let body_deadline = Instant::now() + Duration::from_millis(100);
        let got = self.pull_exact(&mut command, body_deadline)?;
        if got < command.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("envelope declared {} bytes, got {}", command.len(), got),
            ));
        }

        Ok(Some(command))
    }

    /// Close both directions; the host sees a broken pipe on its next read.
    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    fn pull_exact(&self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            filled += self.inbound.pull(&mut buf[filled..], deadline - now)?;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_read_times_out_empty() {
        let (host, _device) = memory_link(Duration::from_millis(5));
        let mut buf = [0u8; 4];
        assert_eq!(host.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn device_sees_host_commands() {
        let (host, device) = memory_link(Duration::from_millis(5));
        host.write_all(&[0x01, 0x00, 0x02, 0xAB, 0xCD]).unwrap();

        let cmd = device.next_command(Duration::from_millis(50)).unwrap();
        assert_eq!(cmd, Some(vec![0xAB, 0xCD]));
        assert_eq!(device.next_command(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn injected_bytes_reach_host() {
        let (host, device) = memory_link(Duration::from_millis(5));
        device.inject(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(host.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(host.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
    }

    #[test]
    fn closed_link_is_an_error() {
        let (host, device) = memory_link(Duration::from_millis(5));
        device.close();
        let mut buf = [0u8; 1];
        assert_eq!(
            host.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert!(host.write_all(&[0]).is_err());
    }
}
