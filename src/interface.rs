//! Serial port access for the UPDI link
//!
//! UPDI framing is plain UART with even parity and two stop bits, driven
//! half-duplex over a single wire with TX tied to RX. [UpdiPort] is the
//! seam between the link layer and the host serial hardware; [Interface]
//! is the `serialport`-backed implementation used in production, while the
//! test suite substitutes a scripted target.

use std::{thread::sleep, time::Duration};

use log::{debug, info};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{
    command,
    error::{Error, LinkError},
};

/// Baud rate used to stretch a zero frame into a BREAK condition. One
/// character at 300 baud holds the line low for ~30 ms, comfortably above
/// the 24.6 ms the PHY requires.
pub const BREAK_BAUD: u32 = 300;

/// Default programming baud rate
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-byte read timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Half-duplex serial access as the UPDI link consumes it
///
/// Reads are bounded by the port timeout and may return fewer bytes than
/// requested; the link layer decides whether a short read is a fault.
pub trait UpdiPort {
    /// Change the baud rate without reopening the port
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError>;

    /// Currently configured baud rate
    fn baud_rate(&self) -> u32;

    /// Change the per-read timeout
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), LinkError>;

    /// Write all bytes. Every byte will be echoed back by the TX/RX tie.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Read up to `buf.len()` bytes, returning how many arrived before the
    /// timeout. A return of 0 means the line stayed silent.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Discard anything pending in the receive buffer
    fn clear_input(&mut self) -> Result<(), LinkError>;

    /// Hold the line low long enough to reset the UPDI PHY. A double BREAK
    /// is guaranteed to push the PHY state machine into a known state.
    fn send_break(&mut self, double: bool) -> Result<(), LinkError>;

    /// Drive the DTR output, used by power-toggle activation
    fn set_dtr(&mut self, level: bool) -> Result<(), LinkError>;

    /// Drive the RTS output, used by power-toggle activation
    fn set_rts(&mut self, level: bool) -> Result<(), LinkError>;
}

/// Wrapper around a host serial port configured for UPDI framing
pub struct Interface {
    serial_port: Box<dyn SerialPort>,
    baud: u32,
}

impl Interface {
    /// Open `port_name` with UPDI framing (8E2) at the given baud rate
    pub fn open(port_name: &str, baud: u32) -> Result<Self, Error> {
        info!("Opening port '{}' at {} baud", port_name, baud);

        let serial_port = serialport::new(port_name, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::Two)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|err| match err.kind() {
                serialport::ErrorKind::NoDevice => Error::SerialNotFound(port_name.to_string()),
                _ => Error::from(err),
            })?;

        Ok(Interface {
            serial_port,
            baud,
        })
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial_port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.serial_port.as_mut()
    }
}

impl UpdiPort for Interface {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError> {
        self.serial_port.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.serial_port.set_timeout(timeout)?;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.serial_port.write_all(bytes)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn send_break(&mut self, double: bool) -> Result<(), LinkError> {
        debug!("Sending {}break", if double { "double " } else { "" });

        let baud = self.baud;

        // A BREAK is just a slower zero frame. Drop to 300 baud with a
        // single stop bit, write 0x00, and wait for its echo.
        self.serial_port.set_baud_rate(BREAK_BAUD)?;
        self.serial_port.set_stop_bits(StopBits::One)?;

        self.serial_port.write_all(&[command::BREAK])?;
        self.serial_port.flush()?;
        let _ = self.read(&mut [0u8; 1])?;

        if double {
            sleep(Duration::from_millis(100));
            self.serial_port.write_all(&[command::BREAK])?;
            self.serial_port.flush()?;
            let _ = self.read(&mut [0u8; 1])?;
        }

        self.serial_port.set_baud_rate(baud)?;
        self.serial_port.set_stop_bits(StopBits::Two)?;
        self.serial_port.clear(serialport::ClearBuffer::Input)?;

        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), LinkError> {
        self.serial_port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), LinkError> {
        self.serial_port.write_request_to_send(level)?;
        Ok(())
    }
}
