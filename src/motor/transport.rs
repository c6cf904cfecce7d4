// Serial transport and clock capabilities used by the stepper bus
//
// The bus never touches a serial port or the system clock directly: both are
// injected so the same codec runs against real hardware or the simulator.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Byte-level access to a half-duplex serial link
pub trait SerialTransport {
    /// Write all bytes and flush
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Number of received bytes waiting to be read
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` already-received bytes without blocking
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drop everything currently sitting in the receive buffer
    fn discard_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        while self.bytes_available()? > 0 {
            if self.read_available(&mut scratch)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Monotonic time source with an explicit suspension point
pub trait Clock {
    /// Time elapsed since the clock was created
    fn now(&self) -> Duration;

    /// Block the calling context for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `Instant` and `thread::sleep`
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// `SerialTransport` over a `serialport` handle
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
}

impl SerialPortTransport {
    /// Open a port with a short read timeout; the bus does its own deadline handling
    pub fn open(port_name: &str, baudrate: u32) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(5))
            .open()?;
        Ok(Self { port })
    }
}

impl SerialTransport for SerialPortTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.bytes_available()?;
        if available == 0 {
            return Ok(0);
        }
        let len = available.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
