//! Serial transport for the floor bus.
//!
//! The session owns exactly one boxed [`BusTransport`]; every bus write
//! goes through it. The trait exists so the emulated floor and the tests
//! can stand in for a physical serial port.

use std::io;
use std::io::{Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::debug;

use super::error::BusError;
use super::DEFAULT_BAUD_RATE;

/// Byte stream plus the control-line and drain surface the bus needs.
pub trait BusTransport: Send {
    /// Write the whole buffer to the bus.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Block until previously written bytes have left the hardware.
    fn drain(&mut self) -> io::Result<()>;

    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Non-blocking-ish read into `buf`; returns the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard any unread received bytes.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Drive the outgoing daisy-chain enable line.
    fn set_daisy(&mut self, enabled: bool) -> io::Result<()>;
}

/// Information about an available serial port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// USB vendor ID (if USB device).
    pub vid: Option<u16>,
    /// USB product ID (if USB device).
    pub pid: Option<u16>,
    /// Product name (if available).
    pub product: Option<String>,
}

/// List the serial ports available on this machine.
pub fn list_ports() -> Vec<PortInfo> {
    serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| {
            let (vid, pid, product) = match info.port_type {
                SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid), usb.product),
                _ => (None, None, None),
            };
            PortInfo {
                name: info.port_name,
                vid,
                pid,
                product,
            }
        })
        .collect()
}

/// Physical serial port transport.
///
/// The daisy-chain enable line rides on RTS and DTR together, matching
/// the bus dongle's wiring.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baud_rate: u32,
    /// Bytes written since the last drain, used to size the drain wait.
    unflushed: usize,
}

impl SerialTransport {
    /// Open and configure a port for bus traffic (8N1, no flow control).
    pub fn open(name: &str, baud_rate: Option<u32>) -> Result<Self, BusError> {
        let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
        let mut port = serialport::new(name, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| BusError::SerialError(e.to_string()))?;

        port.set_data_bits(serialport::DataBits::Eight)
            .map_err(|e| BusError::SerialError(e.to_string()))?;
        port.set_parity(serialport::Parity::None)
            .map_err(|e| BusError::SerialError(e.to_string()))?;
        port.set_stop_bits(serialport::StopBits::One)
            .map_err(|e| BusError::SerialError(e.to_string()))?;
        port.set_flow_control(serialport::FlowControl::None)
            .map_err(|e| BusError::SerialError(e.to_string()))?;

        debug!(port = name, baud, "serial port open");
        Ok(Self {
            port,
            baud_rate: baud,
            unflushed: 0,
        })
    }

    fn map_err(e: serialport::Error) -> io::Error {
        io::Error::other(e.to_string())
    }
}

impl BusTransport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.unflushed += data.len();
        self.port.write_all(data)
    }

    fn drain(&mut self) -> io::Result<()> {
        // flush() maps to tcdrain, which can block far longer than the
        // actual transmission on some USB adapters. Waiting out the
        // transmit time of the unflushed bytes is both bounded and
        // sufficient: write_all already handed them to the kernel.
        let bits = (self.unflushed as u64) * 10; // start + 8 data + stop
        let ms = bits * 1_000 / u64::from(self.baud_rate.max(1));
        std::thread::sleep(Duration::from_millis(ms + 1));
        self.unflushed = 0;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(Self::map_err)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(Self::map_err)
    }

    fn set_daisy(&mut self, enabled: bool) -> io::Result<()> {
        self.port
            .write_request_to_send(enabled)
            .map_err(Self::map_err)?;
        self.port
            .write_data_terminal_ready(enabled)
            .map_err(Self::map_err)
    }
}

/// Daisy-chain enable line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// The first unaddressed node is permitted to transmit.
    Enabled,
    /// Normal traffic; no node holds the enable line from the master.
    Disabled,
}

/// Tracks the enable line so transitions are pushed to hardware exactly
/// once and confirmed (drained) before the next bus write.
#[derive(Debug)]
pub struct DaisyLine {
    state: LineState,
}

impl DaisyLine {
    /// A new line controller; the line is assumed disabled.
    pub fn new() -> Self {
        Self {
            state: LineState::Disabled,
        }
    }

    /// Current line state.
    pub fn state(&self) -> LineState {
        self.state
    }

    /// Transition the line, flushing the change to hardware. A no-op when
    /// the line is already in the requested state.
    pub fn set(&mut self, transport: &mut dyn BusTransport, enabled: bool) -> io::Result<()> {
        let target = if enabled {
            LineState::Enabled
        } else {
            LineState::Disabled
        };
        if self.state == target {
            return Ok(());
        }
        transport.set_daisy(enabled)?;
        transport.drain()?;
        self.state = target;
        debug!(state = ?self.state, "daisy line");
        Ok(())
    }
}

impl Default for DaisyLine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        daisy_calls: Vec<bool>,
        drains: usize,
    }

    impl BusTransport for RecordingTransport {
        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn drain(&mut self) -> io::Result<()> {
            self.drains += 1;
            Ok(())
        }
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(0)
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn set_daisy(&mut self, enabled: bool) -> io::Result<()> {
            self.daisy_calls.push(enabled);
            Ok(())
        }
    }

    #[test]
    fn transitions_only_on_change() {
        let mut line = DaisyLine::new();
        let mut transport = RecordingTransport::default();

        line.set(&mut transport, false).unwrap();
        assert!(transport.daisy_calls.is_empty());

        line.set(&mut transport, true).unwrap();
        line.set(&mut transport, true).unwrap();
        line.set(&mut transport, false).unwrap();
        assert_eq!(transport.daisy_calls, vec![true, false]);
        assert_eq!(line.state(), LineState::Disabled);
    }

    #[test]
    fn transition_is_drained_before_returning() {
        let mut line = DaisyLine::new();
        let mut transport = RecordingTransport::default();
        line.set(&mut transport, true).unwrap();
        assert_eq!(transport.drains, 1);
    }
}
