//! Establish and drive the half-duplex UPDI link
//!
//! The [Connection] struct owns the serial port and implements the UPDI
//! datalink: SYNCH framing, echo suppression for the TX/RX tie, BREAK
//! recovery, guard-time management, and the typed instruction
//! transactions the upper layers are built from.
//!
//! Every byte written to the wire comes straight back through the receive
//! path because TX is tied to RX. [Connection::send] therefore consumes
//! exactly one echo byte per transmitted byte and verifies it before any
//! inbound byte is treated as a reply; a corrupted echo resets the PHY
//! with a double BREAK.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{
    command::{self, AddressWidth, CommandType},
    error::{Error, LinkError, ProtocolError},
    interface::UpdiPort,
};

pub mod activation;

/// Guard-time value programmed into CTRLA during init: 2 idle cycles
/// between frames. The power-on default of 128 cycles costs ~1 ms per
/// transaction at programming baud rates.
pub const DEFAULT_GUARD_TIME: u8 = 0x06;

/// Length of the System Information Block we request
pub const SIB_LENGTH: usize = 32;

/// An active UPDI link to a target device
pub struct Connection {
    port: Box<dyn UpdiPort>,
    address_width: AddressWidth,
    guard_time: u8,
}

impl Connection {
    /// Wrap an opened port. The link starts with 24-bit addressing until
    /// the SIB reveals the device generation.
    pub fn new(port: Box<dyn UpdiPort>) -> Self {
        Connection {
            port,
            address_width: AddressWidth::TwentyFour,
            guard_time: DEFAULT_GUARD_TIME,
        }
    }

    /// Initialize the link: a BREAK handshake to reset the PHY, then the
    /// session parameters, verified by reading STATUSA.
    pub fn begin(&mut self) -> Result<(), Error> {
        // An initial BREAK doubles as a handshake; it is harmless when the
        // PHY is already idle.
        self.port.send_break(false)?;
        self.init()
    }

    /// Program the session parameters and verify the link is alive. On
    /// failure the PHY is reset with a double BREAK and the sequence is
    /// retried once.
    pub fn init(&mut self) -> Result<(), Error> {
        self.init_session_parameters()?;

        if self.check()? {
            return Ok(());
        }

        debug!("UPDI not responding, attempting double-break recovery");
        self.port.send_break(true)?;
        self.init_session_parameters()?;

        if self.check()? {
            return Ok(());
        }

        Err(Error::Link(LinkError::InitFailed))
    }

    /// Reset the PHY with a double BREAK and re-run init. Used as the one
    /// automatic recovery step after a link fault.
    pub fn recover(&mut self) -> Result<(), Error> {
        self.port.send_break(true)?;
        self.init()
    }

    fn init_session_parameters(&mut self) -> Result<(), Error> {
        // Disable collision detection, then enable the inter-byte delay
        // and drop the guard time.
        self.stcs(command::CS_CTRLB, command::CTRLB_CCDETDIS)?;
        self.stcs(command::CS_CTRLA, command::CTRLA_IBDLY | self.guard_time)
    }

    fn check(&mut self) -> Result<bool, Error> {
        match self.ldcs_raw(command::CS_STATUSA) {
            Ok(value) if value != 0 => {
                debug!("UPDI init OK, STATUSA = {:#04x}", value);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(Error::Link(err)) => {
                debug!("UPDI check failed: {}", err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Address width used for LDS/STS/ST_PTR encodings
    pub fn address_width(&self) -> AddressWidth {
        self.address_width
    }

    /// Switch the address width once the device generation is known
    pub fn set_address_width(&mut self, width: AddressWidth) {
        self.address_width = width;
    }

    /// Lower or raise the inter-frame guard time on the target. Takes
    /// effect at the next init.
    pub fn set_guard_time(&mut self, gtval: u8) -> Result<(), Error> {
        self.guard_time = gtval & 0x07;
        self.stcs(command::CS_CTRLA, command::CTRLA_IBDLY | self.guard_time)
    }

    /// Transmit bytes and consume their echoes. Any discrepancy between a
    /// sent byte and its echo resets the PHY and surfaces a link fault.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.port.write_all(bytes)?;

        let mut echo = vec![0u8; bytes.len()];
        self.read_exact(&mut echo, CommandType::Ldcs.timeout())?;

        for (&sent, &echoed) in bytes.iter().zip(echo.iter()) {
            if sent != echoed {
                warn!("Echo mismatch: sent {:#04x}, got {:#04x}", sent, echoed);
                // Leave the PHY in a known state for whoever retries.
                self.port.send_break(true)?;
                return Err(Error::Link(LinkError::EchoMismatch { sent, echoed }));
            }
        }

        Ok(())
    }

    /// Receive exactly `size` reply bytes within the instruction timeout
    fn receive(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        let mut response = vec![0u8; size];
        self.read_exact(&mut response, timeout)?;
        Ok(response)
    }

    fn read_exact(&mut self, buf: &mut [u8], per_byte: Duration) -> Result<(), Error> {
        let mut filled = 0;
        let deadline = Instant::now() + per_byte * buf.len() as u32;

        while filled < buf.len() {
            let n = self.port.read(&mut buf[filled..])?;
            filled += n;
            if n == 0 && Instant::now() >= deadline {
                return Err(Error::Link(LinkError::Timeout));
            }
        }

        Ok(())
    }

    fn expect_ack(&mut self, context: &'static str) -> Result<(), Error> {
        let response = self.receive(1, CommandType::St.timeout())?;
        if response[0] != command::ACK {
            return Err(Error::Protocol(ProtocolError::MissingAck {
                context,
                received: response[0],
            }));
        }
        Ok(())
    }

    fn ldcs_raw(&mut self, cs: u8) -> Result<u8, Error> {
        self.send(&command::ldcs(cs))?;
        let response = self.receive(1, CommandType::Ldcs.timeout())?;
        Ok(response[0])
    }

    /// Read a control/status register. A link fault is answered with one
    /// BREAK-and-retry before it surfaces.
    pub fn ldcs(&mut self, cs: u8) -> Result<u8, Error> {
        match self.ldcs_raw(cs) {
            Err(Error::Link(err)) => {
                debug!("LDCS fault ({}), recovering", err);
                self.init()?;
                self.ldcs_raw(cs)
            }
            other => other,
        }
    }

    /// Write a control/status register; no reply is expected
    pub fn stcs(&mut self, cs: u8, value: u8) -> Result<(), Error> {
        self.send(&command::stcs(cs, value))
    }

    /// Load a single byte from the data space
    pub fn ld8(&mut self, address: u32) -> Result<u8, Error> {
        self.send(&command::lds8(self.address_width, address))?;
        let response = self.receive(1, CommandType::Lds.timeout())?;
        Ok(response[0])
    }

    /// Load a word from the data space
    pub fn ld16(&mut self, address: u32) -> Result<[u8; 2], Error> {
        self.send(&command::lds16(self.address_width, address))?;
        let response = self.receive(2, CommandType::Lds.timeout())?;
        Ok([response[0], response[1]])
    }

    /// Store a single byte to the data space. STS is two-phase: the
    /// address and the data byte are each acknowledged.
    pub fn st8(&mut self, address: u32, value: u8) -> Result<(), Error> {
        self.send(&command::sts8(self.address_width, address))?;
        self.expect_ack("STS address")?;
        self.send(&[value])?;
        self.expect_ack("STS data")
    }

    /// Store a word to the data space
    pub fn st16(&mut self, address: u32, value: u16) -> Result<(), Error> {
        self.send(&command::sts16(self.address_width, address))?;
        self.expect_ack("STS address")?;
        self.send(&value.to_le_bytes())?;
        self.expect_ack("STS data")
    }

    /// Load the internal pointer with an address
    pub fn st_ptr(&mut self, address: u32) -> Result<(), Error> {
        self.send(&command::st_ptr(self.address_width, address))?;
        self.expect_ack("ST_PTR")
    }

    /// Store bytes through the auto-incrementing pointer, one ACK each
    pub fn st_ptr_inc(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut frame = command::st_ptr_inc8().to_vec();
        frame.push(data[0]);
        self.send(&frame)?;
        self.expect_ack("ST ptr++")?;

        for &value in &data[1..] {
            self.send(&[value])?;
            self.expect_ack("ST ptr++")?;
        }

        Ok(())
    }

    /// Store words through the auto-incrementing pointer with the response
    /// signature disabled: the whole block goes out back-to-back and no
    /// ACKs are produced. ACKs are re-enabled afterwards.
    pub fn st_ptr_inc16_rsd(&mut self, data: &[u8]) -> Result<(), Error> {
        debug_assert!(data.len() % 2 == 0);

        let ctrla_ack_on = command::CTRLA_IBDLY | self.guard_time;
        let ctrla_ack_off = ctrla_ack_on | command::CTRLA_RSD;

        self.stcs(command::CS_CTRLA, ctrla_ack_off)?;

        self.send(&command::st_ptr_inc16())?;
        self.send(data)?;

        self.stcs(command::CS_CTRLA, ctrla_ack_on)
    }

    /// Load `size` bytes through the auto-incrementing pointer
    pub fn ld_ptr_inc(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        self.send(&command::ld_ptr_inc8())?;
        self.receive(size, CommandType::Ld.timeout())
    }

    /// Load `words` words through the auto-incrementing pointer
    pub fn ld_ptr_inc16(&mut self, words: usize) -> Result<Vec<u8>, Error> {
        self.send(&command::ld_ptr_inc16())?;
        self.receive(words * 2, CommandType::Ld.timeout())
    }

    /// Arm the REPEAT counter so the next instruction executes `count`
    /// times
    pub fn repeat(&mut self, count: usize) -> Result<(), Error> {
        if count > command::MAX_REPEAT_SIZE {
            return Err(Error::Protocol(ProtocolError::OversizedBlock {
                requested: count,
                max: command::MAX_REPEAT_SIZE,
            }));
        }
        self.send(&command::repeat(count))
    }

    /// Write an activation key; no reply is expected
    pub fn key(&mut self, key: &[u8; 8]) -> Result<(), Error> {
        self.send(&command::key(key))
    }

    /// Request the System Information Block
    pub fn read_sib(&mut self) -> Result<[u8; SIB_LENGTH], Error> {
        self.send(&command::sib())?;
        let response = self.receive(SIB_LENGTH, CommandType::Sib.timeout())?;
        let mut sib = [0u8; SIB_LENGTH];
        sib.copy_from_slice(&response);
        Ok(sib)
    }

    /// Block-read `size` bytes starting at `address` using the pointer
    /// fast path. Limited to one REPEAT block.
    pub fn read_data(&mut self, address: u32, size: usize) -> Result<Vec<u8>, Error> {
        debug!("Reading {} bytes from {:#08x}", size, address);

        if size > command::MAX_REPEAT_SIZE {
            return Err(Error::Protocol(ProtocolError::OversizedBlock {
                requested: size,
                max: command::MAX_REPEAT_SIZE,
            }));
        }

        self.st_ptr(address)?;
        if size > 1 {
            self.repeat(size)?;
        }
        self.ld_ptr_inc(size)
    }

    /// Block-read `words` words starting at `address`
    pub fn read_data_words(&mut self, address: u32, words: usize) -> Result<Vec<u8>, Error> {
        debug!("Reading {} words from {:#08x}", words, address);

        if words > command::MAX_REPEAT_SIZE / 2 {
            return Err(Error::Protocol(ProtocolError::OversizedBlock {
                requested: words,
                max: command::MAX_REPEAT_SIZE / 2,
            }));
        }

        self.st_ptr(address)?;
        if words > 1 {
            self.repeat(words)?;
        }
        self.ld_ptr_inc16(words)
    }

    /// Block-write bytes starting at `address`, chunked at the REPEAT
    /// limit. Small writes go through direct stores.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        match data.len() {
            0 => return Ok(()),
            1 => return self.st8(address, data[0]),
            2 => {
                self.st8(address, data[0])?;
                return self.st8(address + 1, data[1]);
            }
            _ => {}
        }

        let mut address = address;
        for chunk in data.chunks(command::MAX_REPEAT_SIZE) {
            self.st_ptr(address)?;
            self.repeat(chunk.len())?;
            self.st_ptr_inc(chunk)?;
            address += chunk.len() as u32;
        }

        Ok(())
    }

    /// Block-write words starting at `address` using the RSD fast path
    pub fn write_data_words(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        if data.len() % 2 != 0 {
            return Err(Error::Alignment(format!(
                "word write of odd length {}",
                data.len()
            )));
        }

        if data.len() == 2 {
            return self.st16(address, u16::from_le_bytes([data[0], data[1]]));
        }

        if data.len() > command::MAX_REPEAT_SIZE * 2 {
            return Err(Error::Protocol(ProtocolError::OversizedBlock {
                requested: data.len(),
                max: command::MAX_REPEAT_SIZE * 2,
            }));
        }

        self.st_ptr(address)?;
        self.repeat(data.len() / 2)?;
        self.st_ptr_inc16_rsd(data)
    }

    /// Give the activation strategies access to the raw port
    pub(crate) fn port_mut(&mut self) -> &mut dyn UpdiPort {
        self.port.as_mut()
    }
}

/// Simple deadline helper for the various status polling loops
pub(crate) struct Timeout {
    deadline: Instant,
}

impl Timeout {
    pub(crate) fn new(duration: Duration) -> Self {
        Timeout {
            deadline: Instant::now() + duration,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }
}

pub use activation::HighVoltage;
