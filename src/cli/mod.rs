//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use by the [updiflash]
//! command-line application, and are likely not of much use otherwise.
//!
//! [updiflash]: https://crates.io/crates/updiflash

use std::{fs, path::PathBuf};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serialport::SerialPortType;

use crate::{
    connection::HighVoltage,
    error::Error,
    flasher::{Flasher, SessionOptions},
    image_format::{segments_from_hex, segments_to_hex, Segment},
    interface::{Interface, DEFAULT_BAUD},
    progress::ProgressCallbacks,
    targets::{self, MemoryKind},
};

// `clap@4` dropped the `possible_values` attribute; wire strum's VARIANTS
// through a value parser instead. Assumes `strum::EnumString` and
// `strum::VariantNames` are derived for the type.
#[doc(hidden)]
#[macro_export]
macro_rules! clap_enum_variants {
    ($e: ty) => {{
        use clap::builder::TypedValueParser;
        use strum::VariantNames;
        clap::builder::PossibleValuesParser::new(<$e>::VARIANTS).map(|s| s.parse::<$e>().unwrap())
    }};
}

pub use clap_enum_variants;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Baud rate at which to communicate with the target device
    #[arg(short = 'b', long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,
    /// Serial port connected to the target device
    #[arg(short = 'p', long)]
    pub port: Option<String>,
    /// Target device name, e.g. 'atmega4809'
    #[arg(short = 'd', long)]
    pub device: String,
    /// High-voltage activation mode
    #[arg(long, value_enum, default_value_t = HighVoltage::None)]
    pub hv: HighVoltage,
    /// Unlock a locked device by chip-erasing it
    #[arg(long)]
    pub chip_erase_locked: bool,
    /// Write the user row while the device stays locked
    #[arg(long)]
    pub user_row_locked: bool,
}

/// Select a memory region and a span within it
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct MemoryArgs {
    /// Memory region to operate on
    #[arg(short = 'm', long, value_parser = clap_enum_variants!(MemoryKind))]
    pub memory: Option<MemoryKind>,
    /// Offset within the memory region
    #[arg(short = 'o', long, default_value_t = 0)]
    pub offset: u32,
    /// Number of bytes; defaults to the region size
    #[arg(short = 'n', long)]
    pub length: Option<usize>,
    /// Literal bytes, e.g. '-l 0x01 0x02'
    #[arg(short = 'l', long, num_args = 1.., value_parser = parse_byte)]
    pub literals: Option<Vec<u8>>,
    /// Intel-HEX file routed by the AVR offset convention
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,
}

fn parse_byte(raw: &str) -> Result<u8, String> {
    let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        raw.parse()
    };
    parsed.map_err(|_| format!("'{raw}' is not a byte value"))
}

/// Open the serial port and establish a programming session
pub fn connect(args: &ConnectArgs) -> Result<Flasher, Error> {
    let device = targets::by_name(&args.device)?;
    let port_name = match &args.port {
        Some(name) => name.clone(),
        None => detect_port()?,
    };

    info!("Connecting to {} on {}", device.name, port_name);
    let interface = Interface::open(&port_name, args.baud)?;

    let options = SessionOptions {
        chip_erase_locked: args.chip_erase_locked,
        user_row_locked: args.user_row_locked,
        high_voltage: args.hv,
    };

    Flasher::connect(device, Box::new(interface), options)
}

/// Pick the sole plausible serial adapter, preferring USB bridges
fn detect_port() -> Result<String, Error> {
    let ports = serialport::available_ports()?;

    ports
        .iter()
        .find(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
        .or_else(|| ports.first())
        .map(|port| port.port_name.clone())
        .ok_or(Error::NoSerial)
}

/// Map an error onto the process exit code contract: verify failures,
/// id mismatches, lock states and missing tools are all distinguishable.
pub fn exit_code(error: &Error) -> i32 {
    match error {
        Error::UnsupportedMemory(_) | Error::MemoryNotWritable(_) => 2,
        Error::VerifyMismatch { .. } => 3,
        Error::DeviceIdMismatch { .. } => 4,
        Error::NoSerial | Error::SerialNotFound(_) => 5,
        Error::Locked => 6,
        _ => 1,
    }
}

/// Progress bar for memory operations
#[derive(Default)]
pub struct UpdiProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for UpdiProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
                .unwrap()
                .progress_chars("=> "),
        );
        bar.set_message(format!("{addr:#08x}"));
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

/// Read the device signature and report it
pub fn ping(args: &ConnectArgs) -> Result<(), Error> {
    let mut flasher = connect(args)?;
    let signature = flasher.ping()?;
    println!(
        "Ping response: {:02X} {:02X} {:02X}",
        signature[0], signature[1], signature[2]
    );
    flasher.leave_progmode()
}

/// Read memory contents to the console or to a HEX file
pub fn read(connect_args: &ConnectArgs, memory: &MemoryArgs) -> Result<(), Error> {
    let mut flasher = connect(connect_args)?;

    match memory.memory {
        Some(kind) => {
            let region = *flasher.device().memory(kind)?;
            let length = memory
                .length
                .unwrap_or((region.size - memory.offset.min(region.size)) as usize);

            let mut progress = UpdiProgress::default();
            let data = flasher.read(kind, memory.offset, length, Some(&mut progress))?;

            match &memory.file {
                Some(path) => {
                    let base = region.kind.hex_base().unwrap_or(0) + memory.offset;
                    let hex = segments_to_hex(&[Segment::new(base, data)])?;
                    fs::write(path, hex)
                        .map_err(|err| Error::FileIo(format!("{}: {err}", path.display())))?;
                    info!("Wrote {} to {}", kind, path.display());
                }
                None => print_hexdump(memory.offset, &data),
            }
        }
        None => {
            // No region given: read everything that belongs in a HEX file.
            let segments = flasher.read_to_segments()?;
            let hex = segments_to_hex(&segments)?;
            match &memory.file {
                Some(path) => {
                    fs::write(path, hex)
                        .map_err(|err| Error::FileIo(format!("{}: {err}", path.display())))?;
                    info!("Wrote device contents to {}", path.display());
                }
                None => print!("{hex}"),
            }
        }
    }

    flasher.leave_progmode()
}

/// Write literals or a HEX file to the device
pub fn write(
    connect_args: &ConnectArgs,
    memory: &MemoryArgs,
    erase: bool,
    verify: bool,
) -> Result<(), Error> {
    let mut flasher = connect(connect_args)?;
    let mut progress = UpdiProgress::default();

    if let Some(path) = &memory.file {
        let hex = fs::read_to_string(path)
            .map_err(|err| Error::FileIo(format!("{}: {err}", path.display())))?;
        let segments = segments_from_hex(&hex)?;
        flasher.write_from_segments(&segments, erase, verify, false, Some(&mut progress))?;
    } else if let (Some(kind), Some(literals)) = (memory.memory, &memory.literals) {
        if erase {
            flasher.erase(None)?;
        }
        flasher.write(kind, memory.offset, literals, Some(&mut progress))?;
        if verify {
            flasher.verify(kind, memory.offset, literals)?;
        }
    } else {
        return Err(Error::InvalidArgs(
            "write needs either --file or --memory with --literals".into(),
        ));
    }

    info!("Write completed");
    flasher.leave_progmode()
}

/// Compare device contents against literals or a HEX file
pub fn verify(connect_args: &ConnectArgs, memory: &MemoryArgs) -> Result<(), Error> {
    let mut flasher = connect(connect_args)?;

    if let Some(path) = &memory.file {
        let hex = fs::read_to_string(path)
            .map_err(|err| Error::FileIo(format!("{}: {err}", path.display())))?;
        for segment in segments_from_hex(&hex)? {
            let (kind, offset) = targets::route_hex_address(segment.addr)
                .ok_or_else(|| Error::InvalidHex(format!("segment at {:#08x}", segment.addr)))?;
            flasher.verify(kind, offset, &segment.data)?;
        }
    } else if let (Some(kind), Some(literals)) = (memory.memory, &memory.literals) {
        flasher.verify(kind, memory.offset, literals)?;
    } else {
        return Err(Error::InvalidArgs(
            "verify needs either --file or --memory with --literals".into(),
        ));
    }

    println!("Verify OK");
    flasher.leave_progmode()
}

/// Chip-erase the device, or erase one region
pub fn erase(connect_args: &ConnectArgs, memory: Option<MemoryKind>) -> Result<(), Error> {
    let mut flasher = connect(connect_args)?;
    flasher.erase(memory)?;
    info!("Erase completed");
    flasher.leave_progmode()
}

/// Pulse reset and release the device to run
pub fn reset(connect_args: &ConnectArgs) -> Result<(), Error> {
    let mut flasher = connect(connect_args)?;
    flasher.reset_target()?;
    flasher.leave_progmode()
}

fn print_hexdump(offset: u32, data: &[u8]) {
    for (index, line) in data.chunks(16).enumerate() {
        let address = offset as usize + index * 16;
        let bytes = line
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{address:06X}: {bytes}");
    }
}
