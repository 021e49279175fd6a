//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::targets::MemoryKind;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error on the UPDI link")]
    #[diagnostic(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Device ID mismatch: read {read:02X?}, expected {expected:02X?}")]
    #[diagnostic(
        code(updiflash::device_id_mismatch),
        help("Check that the part on the board matches the --device argument")
    )]
    DeviceIdMismatch { expected: [u8; 3], read: [u8; 3] },

    #[error("The device is locked")]
    #[diagnostic(
        code(updiflash::locked),
        help(
            "Use --chip-erase-locked to erase and unlock the device, or \
             --user-row-locked to write the user row while it stays locked"
        )
    )]
    Locked,

    #[error("Timeout waiting for the NVM controller to become ready {during}")]
    #[diagnostic(code(updiflash::nvm_timeout))]
    NvmTimeout { during: &'static str },

    #[error("The NVM controller flagged a write error (code {code})")]
    #[diagnostic(code(updiflash::nvm_error))]
    NvmError { code: u8 },

    #[error("Memory '{0}' is not present on this device")]
    #[diagnostic(code(updiflash::unsupported_memory))]
    UnsupportedMemory(MemoryKind),

    #[error("Memory '{0}' is not writable")]
    #[diagnostic(code(updiflash::memory_not_writable))]
    MemoryNotWritable(MemoryKind),

    #[error("{0}")]
    #[diagnostic(code(updiflash::alignment))]
    Alignment(String),

    #[error("Verification failed at address {address:#08x}: wrote {expected:#04x}, read {actual:#04x}")]
    #[diagnostic(
        code(updiflash::verify_mismatch),
        help("Re-run with --erase to program onto a clean device")
    )]
    VerifyMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },

    #[error("Device not recognized, supported devices are: {1}")]
    #[diagnostic(code(updiflash::unrecognized_device))]
    UnrecognizedDevice(String, String),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(updiflash::no_serial),
        help("Make sure a serial adapter is connected to the host system")
    )]
    NoSerial,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(updiflash::serial_not_found),
        help("Make sure the correct adapter is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("Span ending at byte {0} exceeds the region size")]
    #[diagnostic(code(updiflash::out_of_range))]
    OutOfRange(usize),

    #[error("Invalid HEX input: {0}")]
    #[diagnostic(code(updiflash::invalid_hex))]
    InvalidHex(String),

    #[error("File access failed: {0}")]
    #[diagnostic(code(updiflash::file_io))]
    FileIo(String),

    #[error("{0}")]
    #[diagnostic(code(updiflash::invalid_arguments))]
    InvalidArgs(String),
}

/// Faults raised by the half-duplex link itself
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum LinkError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(updiflash::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Timeout waiting for a reply from the device")]
    #[diagnostic(
        code(updiflash::link_timeout),
        help("Check the wiring of the UPDI pin and the series resistor")
    )]
    Timeout,

    #[error("Echo mismatch: sent {sent:#04x}, line echoed {echoed:#04x}")]
    #[diagnostic(
        code(updiflash::echo_mismatch),
        help("The TX/RX tie is returning corrupted data; check for bus contention")
    )]
    EchoMismatch { sent: u8, echoed: u8 },

    #[error("UPDI initialisation failed after BREAK recovery")]
    #[diagnostic(
        code(updiflash::init_failed),
        help("Ensure the device is powered and the UPDI pin is not held by another tool")
    )]
    InitFailed,
}

/// Faults in the UPDI conversation above the byte level
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Expected ACK after {context}, received {received:#04x}")]
    #[diagnostic(code(updiflash::missing_ack))]
    MissingAck { context: &'static str, received: u8 },

    #[error("System information block could not be parsed")]
    #[diagnostic(
        code(updiflash::sib_unparsable),
        help("A garbled SIB usually means line noise; try a lower baud rate")
    )]
    SibUnparsable,

    #[error("The {0} key was not accepted by the device")]
    #[diagnostic(code(updiflash::key_not_accepted))]
    KeyNotAccepted(&'static str),

    #[error("UPDI block transfers are limited to {max} bytes, requested {requested}")]
    #[diagnostic(code(updiflash::oversized_block))]
    OversizedBlock { requested: usize, max: usize },

    #[error("Unsupported NVM controller version '{0}' reported by the device")]
    #[diagnostic(code(updiflash::unsupported_nvm_version))]
    UnsupportedNvmVersion(String),

    #[error("Failed to enter NVM programming mode")]
    #[diagnostic(code(updiflash::progmode_failed))]
    ProgmodeFailed,

    #[error("Failed to chip erase using the NVMErase key")]
    #[diagnostic(code(updiflash::unlock_failed))]
    UnlockFailed,

    #[error("Failed to complete the keyed user-row write")]
    #[diagnostic(code(updiflash::urow_write_failed))]
    UrowWriteFailed,
}

impl From<serialport::Error> for LinkError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            _ => LinkError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Link(err.into())
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Link(err.into())
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> LinkError {
    match kind {
        io::ErrorKind::TimedOut => LinkError::Timeout,
        _ => LinkError::Serial(err.into()),
    }
}
