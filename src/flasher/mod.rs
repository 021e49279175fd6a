//! Program a target device over an established UPDI link
//!
//! The [Flasher] struct is the public surface of a programming session.
//! It owns the link, the device descriptor and the NVM driver, carries
//! the programming-mode and lock state, and exposes the memory
//! operations: ping, read, write, erase, verify, and whole-image
//! programming from HEX segments.

use log::{debug, info, warn};
use std::time::Duration;

use crate::{
    command,
    connection::{activation, Connection, HighVoltage, Timeout},
    error::{Error, ProtocolError},
    image_format::Segment,
    interface::UpdiPort,
    progress::ProgressCallbacks,
    targets::{route_hex_address, Device, MemoryKind, MemoryRegion, NvmVersion},
};

use self::nvm::NvmDriver;

pub mod nvm;

/// Largest block a single UPDI REPEAT can move; reads are chunked at this
const READ_CHUNK: usize = 0x100;

const UNLOCK_TIMEOUT: Duration = Duration::from_millis(500);
const ENTER_PROGMODE_TIMEOUT: Duration = Duration::from_millis(100);
const UROW_TIMEOUT: Duration = Duration::from_millis(500);

/// Options for establishing a programming session
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionOptions {
    /// Unlock a locked device by chip-erasing it with the NVMErase key
    pub chip_erase_locked: bool,
    /// Keep the device locked and use the user-row key for writes
    pub user_row_locked: bool,
    /// High-voltage activation mode applied before first contact
    pub high_voltage: HighVoltage,
}

/// Decoded System Information Block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SibInfo {
    pub family: String,
    pub nvm: String,
    pub ocd: String,
    pub osc: String,
    pub extra: String,
}

impl SibInfo {
    /// Parse the 32-byte SIB. The vital fields live in fixed-width
    /// columns over the first 19 characters.
    pub fn decode(sib: &[u8]) -> Option<SibInfo> {
        if !sib.is_ascii() || sib.len() < 19 {
            return None;
        }
        let text = std::str::from_utf8(sib).ok()?;

        let family = text.get(0..7)?.trim().to_string();
        let nvm = text.get(8..11)?.trim().split(':').nth(1)?.to_string();
        let ocd = text.get(11..14)?.trim().split(':').nth(1)?.to_string();
        let osc = text.get(15..19)?.trim().to_string();
        let extra = text
            .get(19..)
            .unwrap_or_default()
            .trim_matches(char::from(0))
            .trim()
            .to_string();

        if family.is_empty() || nvm.is_empty() {
            return None;
        }

        Some(SibInfo {
            family,
            nvm,
            ocd,
            osc,
            extra,
        })
    }
}

/// Reborrow a `&mut dyn ProgressCallbacks` out of an `Option` for a single
/// call, so the borrow doesn't outlive that call when done repeatedly in a
/// loop.
fn reborrow_progress<'a>(
    progress: &'a mut Option<&mut dyn ProgressCallbacks>,
) -> Option<&'a mut dyn ProgressCallbacks> {
    match progress {
        Some(p) => Some(&mut **p),
        None => None,
    }
}

/// An active programming session with one device on one serial port
pub struct Flasher {
    connection: Connection,
    device: &'static Device,
    nvm: NvmDriver,
    sib: SibInfo,
    in_progmode: bool,
    locked: bool,
    options: SessionOptions,
}

impl Flasher {
    /// Establish a session: activate the PHY, read and decode the SIB,
    /// select the NVM driver, enter programming mode, and gate on the
    /// device signature.
    pub fn connect(
        device: &'static Device,
        port: Box<dyn UpdiPort>,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(port);

        if let Some(strategy) = activation::strategy(options.high_voltage) {
            strategy.activate(connection.port_mut())?;
        }

        connection.begin()?;

        let sib = Self::read_sib_info(&mut connection)?;
        info!("SIB family '{}', NVM revision '{}'", sib.family, sib.nvm);

        let sib_version = sib
            .nvm
            .chars()
            .next()
            .and_then(NvmVersion::from_sib_digit)
            .ok_or_else(|| ProtocolError::UnsupportedNvmVersion(sib.nvm.clone()))?;

        if sib_version != device.nvm_version {
            warn!(
                "SIB reports NVM {} but descriptor for {} says {}",
                sib_version, device.name, device.nvm_version
            );
        }
        connection.set_address_width(sib_version.address_width());

        let revision = connection.ldcs(command::CS_STATUSA)? >> 4;
        debug!("PDI revision {:#x}", revision);

        let mut flasher = Flasher {
            connection,
            device,
            nvm: NvmDriver::new(device),
            sib,
            in_progmode: false,
            locked: false,
            options,
        };

        flasher.start()?;

        Ok(flasher)
    }

    /// Read the SIB with one BREAK-and-retry, then classify a persistent
    /// failure as Locked or a link fault depending on whether the CS
    /// space still answers with the lock bit raised.
    fn read_sib_info(connection: &mut Connection) -> Result<SibInfo, Error> {
        let first = connection.read_sib();
        if let Ok(raw) = &first {
            if let Some(sib) = SibInfo::decode(raw) {
                return Ok(sib);
            }
        }

        warn!("Unable to read SIB, attempting double-break recovery");
        connection.recover()?;

        match connection.read_sib() {
            Ok(raw) => {
                if let Some(sib) = SibInfo::decode(&raw) {
                    return Ok(sib);
                }
            }
            Err(_) => {}
        }

        // A device that keeps its CS space alive but will not produce a
        // SIB is sitting behind the lock, not behind a broken wire.
        match connection.ldcs(command::ASI_SYS_STATUS) {
            Ok(status) if status & command::SYS_STATUS_LOCKSTATUS != 0 => Err(Error::Locked),
            _ => Err(Error::Protocol(ProtocolError::SibUnparsable)),
        }
    }

    /// Enter programming mode, falling back to the locked-device flows
    /// when the caller asked for them, then gate on the signature.
    fn start(&mut self) -> Result<(), Error> {
        match self.enter_progmode() {
            Ok(()) => {}
            Err(Error::Locked) => {
                if self.options.user_row_locked {
                    info!("Device is locked; continuing for a user-row write");
                    self.locked = true;
                    return Ok(());
                } else if self.options.chip_erase_locked {
                    info!("Device is locked; erasing with the NVMErase key to unlock");
                    self.unlock()?;
                    self.enter_progmode()?;
                } else {
                    return Err(Error::Locked);
                }
            }
            Err(err) => return Err(err),
        }

        self.ping().map(|_| ())
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    pub fn sib(&self) -> &SibInfo {
        &self.sib
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether this session has entered programming mode
    pub fn is_programming(&self) -> bool {
        self.in_progmode
    }

    /// Read the three signature bytes and compare them to the descriptor.
    /// Also logs the device revision and serial number.
    pub fn ping(&mut self) -> Result<[u8; 3], Error> {
        if self.locked {
            return Err(Error::Locked);
        }

        let sigrow = self.device.sigrow_base();
        let raw = self.connection.read_data(sigrow, 3)?;
        let read = [raw[0], raw[1], raw[2]];

        if read != self.device.signature {
            return Err(Error::DeviceIdMismatch {
                expected: self.device.signature,
                read,
            });
        }

        let revision = self.connection.read_data(self.device.syscfg_base + 1, 1)?[0];
        info!(
            "Device ID {:02X}{:02X}{:02X} rev {}",
            read[0],
            read[1],
            read[2],
            (b'A'.wrapping_add(revision)) as char
        );

        let serial = self.connection.read_data(sigrow + 3, 10)?;
        debug!("Device serial number {:02x?}", serial);

        Ok(read)
    }

    /// Read `length` bytes from a memory region
    pub fn read(
        &mut self,
        kind: MemoryKind,
        offset: u32,
        length: usize,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Vec<u8>, Error> {
        if self.locked {
            return Err(Error::Locked);
        }

        let region = *self.device.memory(kind)?;
        if offset as usize + length > region.size as usize {
            return Err(Error::OutOfRange(offset as usize + length));
        }

        if let Some(progress) = progress.as_mut() {
            progress.init(region.base + offset, length);
        }

        let mut data = Vec::with_capacity(length);
        let mut address = region.base + offset;
        let mut remaining = length;

        while remaining > 0 {
            let chunk = remaining.min(READ_CHUNK);
            data.extend(self.connection.read_data(address, chunk)?);
            address += chunk as u32;
            remaining -= chunk;

            if let Some(progress) = progress.as_mut() {
                progress.update(data.len());
            }
        }

        if let Some(progress) = progress.as_mut() {
            progress.finish();
        }

        Ok(data)
    }

    /// Write bytes to a memory region, splitting across pages and
    /// preserving untouched bytes on partially written pages
    pub fn write(
        &mut self,
        kind: MemoryKind,
        offset: u32,
        data: &[u8],
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let region = *self.device.memory(kind)?;
        if offset as usize + data.len() > region.size as usize {
            return Err(Error::OutOfRange(offset as usize + data.len()));
        }

        // A locked device only accepts user-row writes, through the key.
        if self.locked {
            if kind == MemoryKind::UserRow && self.options.user_row_locked {
                return self.write_user_row_locked(&region, offset, data);
            }
            return Err(Error::Locked);
        }

        if region.word_oriented && (offset % 2 != 0 || data.len() % 2 != 0) {
            return Err(Error::Alignment(format!(
                "{} writes must be word aligned (offset {:#x}, length {})",
                kind,
                offset,
                data.len()
            )));
        }

        if let Some(progress) = progress.as_mut() {
            progress.init(region.base + offset, data.len());
        }

        match kind {
            MemoryKind::Flash
            | MemoryKind::Eeprom
            | MemoryKind::UserRow
            | MemoryKind::BootRow => self.write_paged(&region, offset, data, &mut progress)?,
            MemoryKind::Fuses | MemoryKind::Lockbits => {
                for (index, &value) in data.iter().enumerate() {
                    self.nvm.write_fuse(
                        &mut self.connection,
                        region.base + offset + index as u32,
                        value,
                    )?;
                    if let Some(progress) = progress.as_mut() {
                        progress.update(index + 1);
                    }
                }
            }
            MemoryKind::InternalSram => self.connection.write_data(region.base + offset, data)?,
            _ => return Err(Error::MemoryNotWritable(kind)),
        }

        if let Some(progress) = progress.as_mut() {
            progress.finish();
        }

        Ok(())
    }

    /// Page-split a write and commit each page through the NVM driver.
    /// Pages that are only partially covered are read back first so the
    /// untouched bytes survive the commit.
    fn write_paged(
        &mut self,
        region: &MemoryRegion,
        offset: u32,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let page_size = region.page_size.max(1) as usize;

        if region.kind == MemoryKind::UserRow && self.nvm.user_row_single_op() {
            let first_page = offset as usize / page_size;
            let last_page = (offset as usize + data.len() - 1) / page_size;
            if first_page != last_page {
                return Err(Error::Alignment(format!(
                    "user row on {} must be written as a single page operation",
                    self.device.name
                )));
            }
        }

        if page_size == 1 {
            // Byte-granular region: one driver call commits the lot.
            self.commit_page(region.kind, region.base + offset, data)?;
            if let Some(progress) = progress.as_mut() {
                progress.update(data.len());
            }
            return Ok(());
        }

        let mut written = 0usize;
        let end = offset as usize + data.len();
        let mut page_start = (offset as usize / page_size) * page_size;

        while page_start < end {
            let page_end = page_start + page_size;
            let slice_start = page_start.max(offset as usize);
            let slice_end = page_end.min(end);
            let slice = &data[slice_start - offset as usize..slice_end - offset as usize];

            if slice.len() == page_size {
                self.commit_page(region.kind, region.base + page_start as u32, slice)?;
            } else {
                // Overlay into the existing page contents.
                let mut page = self.connection.read_data(
                    region.base + page_start as u32,
                    page_size,
                )?;
                page[slice_start - page_start..slice_end - page_start].copy_from_slice(slice);
                self.commit_page(region.kind, region.base + page_start as u32, &page)?;
            }

            written += slice.len();
            if let Some(progress) = progress.as_mut() {
                progress.update(written);
            }
            page_start = page_end;
        }

        Ok(())
    }

    fn commit_page(&mut self, kind: MemoryKind, address: u32, data: &[u8]) -> Result<(), Error> {
        match kind {
            MemoryKind::Flash => self.nvm.write_flash(&mut self.connection, address, data),
            MemoryKind::Eeprom => self.nvm.write_eeprom(&mut self.connection, address, data),
            MemoryKind::UserRow | MemoryKind::BootRow => {
                self.nvm.write_user_row(&mut self.connection, address, data)
            }
            _ => unreachable!("commit_page only handles NVM page regions"),
        }
    }

    /// Erase the chip, or a single region where the region supports it
    pub fn erase(&mut self, kind: Option<MemoryKind>) -> Result<(), Error> {
        if self.locked {
            return Err(Error::Locked);
        }

        match kind {
            None => self.nvm.chip_erase(&mut self.connection),
            Some(MemoryKind::Eeprom) => self.nvm.erase_eeprom(&mut self.connection),
            Some(MemoryKind::UserRow) => {
                let region = *self.device.memory(MemoryKind::UserRow)?;
                self.nvm
                    .erase_user_row(&mut self.connection, region.base, region.size)
            }
            Some(MemoryKind::Flash) => {
                // No single flash-erase command over UPDI; erase page by
                // page.
                let region = *self.device.memory(MemoryKind::Flash)?;
                let pages = region.size / region.page_size;
                debug!("Erasing {} pages of flash", pages);
                for page in 0..pages {
                    self.nvm.erase_flash_page(
                        &mut self.connection,
                        region.base + page * region.page_size,
                    )?;
                }
                Ok(())
            }
            Some(other) => {
                let _ = self.device.memory(other)?;
                Err(Error::MemoryNotWritable(other))
            }
        }
    }

    /// Read back a region and compare byte-exact against `data`
    pub fn verify(&mut self, kind: MemoryKind, offset: u32, data: &[u8]) -> Result<(), Error> {
        let region = *self.device.memory(kind)?;
        let readback = self.read(kind, offset, data.len(), None)?;

        for (index, (&expected, &actual)) in data.iter().zip(readback.iter()).enumerate() {
            if expected != actual {
                return Err(Error::VerifyMismatch {
                    address: region.base + offset + index as u32,
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    /// Program a set of HEX segments: optional chip erase, then each
    /// segment in ascending address order, optionally verified. A verify
    /// mismatch is reported after all segments have been written unless
    /// `fail_fast` is set.
    pub fn write_from_segments(
        &mut self,
        segments: &[Segment],
        erase: bool,
        verify: bool,
        fail_fast: bool,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        if erase {
            info!("Erasing device");
            self.erase(None)?;
        }

        let mut ordered: Vec<&Segment> = segments.iter().collect();
        ordered.sort_by_key(|segment| segment.addr);

        let mut first_mismatch: Option<Error> = None;

        for segment in ordered {
            let (kind, offset) = route_hex_address(segment.addr)
                .ok_or_else(|| Error::InvalidHex(format!("segment at {:#08x}", segment.addr)))?;

            info!(
                "Writing {} bytes to {} at offset {:#x}",
                segment.data.len(),
                kind,
                offset
            );
            self.write(
                kind,
                offset,
                &segment.data,
                reborrow_progress(&mut progress),
            )?;

            if verify {
                match self.verify(kind, offset, &segment.data) {
                    Ok(()) => debug!("{} verified", kind),
                    Err(err @ Error::VerifyMismatch { .. }) => {
                        if fail_fast {
                            return Err(err);
                        }
                        warn!("{}", err);
                        first_mismatch.get_or_insert(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        match first_mismatch {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read every HEX-visible region into segments at their conventional
    /// offsets
    pub fn read_to_segments(&mut self) -> Result<Vec<Segment>, Error> {
        let mut segments = Vec::new();

        for region in self.device.memories {
            if region.hidden_from_hex || !region.kind.emitted_to_hex() {
                continue;
            }
            let Some(base) = region.kind.hex_base() else {
                continue;
            };

            let data = self.read(region.kind, 0, region.size as usize, None)?;
            segments.push(Segment::new(base, data));
        }

        Ok(segments)
    }

    /// Whether SYS_STATUS reports NVM programming mode
    pub fn in_prog_mode(&mut self) -> Result<bool, Error> {
        let status = self.connection.ldcs(command::ASI_SYS_STATUS)?;
        Ok(status & command::SYS_STATUS_NVMPROG != 0)
    }

    fn wait_unlocked(&mut self, timeout: Duration) -> Result<bool, Error> {
        let deadline = Timeout::new(timeout);

        loop {
            let status = self.connection.ldcs(command::ASI_SYS_STATUS)?;
            if status & command::SYS_STATUS_LOCKSTATUS == 0 {
                return Ok(true);
            }
            if deadline.expired() {
                debug!("Timeout waiting for device to unlock");
                return Ok(false);
            }
        }
    }

    fn wait_urow_prog(&mut self, timeout: Duration, wait_for_high: bool) -> Result<bool, Error> {
        let deadline = Timeout::new(timeout);

        loop {
            let status = self.connection.ldcs(command::ASI_SYS_STATUS)?;
            let high = status & command::SYS_STATUS_UROWPROG != 0;
            if high == wait_for_high {
                return Ok(true);
            }
            if deadline.expired() {
                return Ok(false);
            }
        }
    }

    /// Apply or release the UPDI reset condition
    fn reset(&mut self, apply: bool) -> Result<(), Error> {
        if apply {
            debug!("Apply reset");
            self.connection
                .stcs(command::ASI_RESET_REQ, command::RESET_REQ_SIGNATURE)
        } else {
            debug!("Release reset");
            self.connection.stcs(command::ASI_RESET_REQ, 0x00)
        }
    }

    fn toggle_reset(&mut self) -> Result<(), Error> {
        self.reset(true)?;
        self.reset(false)
    }

    /// Pulse reset without touching programming mode
    pub fn reset_target(&mut self) -> Result<(), Error> {
        self.toggle_reset()
    }

    /// Enter NVM programming mode with the NVMProg key
    pub fn enter_progmode(&mut self) -> Result<(), Error> {
        if self.in_prog_mode()? {
            debug!("Already in NVM programming mode");
            self.in_progmode = true;
            return Ok(());
        }

        info!("Entering NVM programming mode");

        self.reset(true)?;
        self.connection.key(command::KEY_NVMPROG)?;

        let key_status = self.connection.ldcs(command::ASI_KEY_STATUS)?;
        debug!("Key status {:#04x}", key_status);
        if key_status & command::KEY_STATUS_NVMPROG == 0 {
            return Err(Error::Protocol(ProtocolError::KeyNotAccepted("NVMProg")));
        }

        self.toggle_reset()?;

        if !self.wait_unlocked(ENTER_PROGMODE_TIMEOUT)? {
            return Err(Error::Locked);
        }

        if !self.in_prog_mode()? {
            return Err(Error::Protocol(ProtocolError::ProgmodeFailed));
        }

        debug!("Now in NVM programming mode");
        self.in_progmode = true;
        Ok(())
    }

    /// Leave programming mode and disable the UPDI PHY, releasing any
    /// keys
    pub fn leave_progmode(&mut self) -> Result<(), Error> {
        info!("Leaving NVM programming mode");
        self.toggle_reset()?;
        self.in_progmode = false;
        self.connection.stcs(
            command::CS_CTRLB,
            command::CTRLB_UPDIDIS | command::CTRLB_CCDETDIS,
        )
    }

    /// Unlock a locked device by chip erase with the NVMErase key. The
    /// device comes out erased and unlocked.
    pub fn unlock(&mut self) -> Result<(), Error> {
        self.connection.key(command::KEY_CHIPERASE)?;

        let key_status = self.connection.ldcs(command::ASI_KEY_STATUS)?;
        debug!("Key status {:#04x}", key_status);
        if key_status & command::KEY_STATUS_CHIPERASE == 0 {
            return Err(Error::Protocol(ProtocolError::KeyNotAccepted("NVMErase")));
        }

        self.toggle_reset()?;

        if !self.wait_unlocked(UNLOCK_TIMEOUT)? {
            return Err(Error::Protocol(ProtocolError::UnlockFailed));
        }

        self.locked = false;
        Ok(())
    }

    /// Write the user row on a locked device with the NVMUs&te key. The
    /// data is padded to one full page; the device stays locked.
    fn write_user_row_locked(
        &mut self,
        region: &MemoryRegion,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let page_size = region.page_size.max(1) as usize;
        if offset as usize + data.len() > page_size {
            return Err(Error::Alignment(
                "locked user-row writes must fit one page".into(),
            ));
        }

        info!("Writing user row on locked device");

        // The whole page is transferred in one go; pad around the data.
        let mut page = vec![0xFF; page_size];
        page[offset as usize..offset as usize + data.len()].copy_from_slice(data);

        self.connection.key(command::KEY_UROW_WRITE)?;

        let key_status = self.connection.ldcs(command::ASI_KEY_STATUS)?;
        debug!("Key status {:#04x}", key_status);
        if key_status & command::KEY_STATUS_UROWWRITE == 0 {
            return Err(Error::Protocol(ProtocolError::KeyNotAccepted("NVMUs&te")));
        }

        self.toggle_reset()?;

        if !self.wait_urow_prog(UROW_TIMEOUT, true)? {
            return Err(Error::Protocol(ProtocolError::UrowWriteFailed));
        }

        self.connection.write_data(region.base, &page)?;

        self.connection.stcs(
            command::ASI_SYS_CTRLA,
            command::SYS_CTRLA_UROW_FINAL | command::CTRLB_CCDETDIS,
        )?;

        if !self.wait_urow_prog(UROW_TIMEOUT, false)? {
            self.toggle_reset()?;
            return Err(Error::Protocol(ProtocolError::UrowWriteFailed));
        }

        self.connection.stcs(
            command::ASI_KEY_STATUS,
            command::KEY_STATUS_UROWWRITE | command::CTRLB_CCDETDIS,
        )?;

        self.toggle_reset()
    }
}
