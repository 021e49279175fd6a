//! NVM controller drivers for the UPDI device generations
//!
//! Each generation (v0/v2/v3/v5) speaks a different dialect to NVMCTRL:
//! different register layout, different command words, and a different
//! page-buffer discipline. The shared skeleton is always the same:
//! wait-ready, optionally clear the page buffer, stream the data, commit
//! with a command word, and poll the busy bits until the controller is
//! idle again.

use std::time::Duration;

use log::debug;

use crate::{
    connection::{Connection, Timeout},
    error::Error,
    targets::{Device, Family, NvmVersion},
};

/// How long we wait for busy bits to clear on ordinary operations
const READY_TIMEOUT: Duration = Duration::from_millis(100);
/// Chip erase can take far longer than a page operation
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Logical NVM controller actions; each generation maps a subset of these
/// to command words for NVMCTRL.CTRLA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmAction {
    Nop,
    WritePage,
    ErasePage,
    EraseWritePage,
    PageBufferClear,
    ChipErase,
    EepromErase,
    WriteFuse,
    FlashWrite,
    EepromWrite,
    EepromEraseWrite,
    EepromPageErase,
    EepromPageBufferClear,
}

impl NvmVersion {
    /// The command word for an action, where this generation supports it
    pub fn command_word(self, action: NvmAction) -> Option<u8> {
        use NvmAction::*;

        match self {
            NvmVersion::V0 => match action {
                Nop => Some(0x00),
                WritePage => Some(0x01),
                ErasePage => Some(0x02),
                EraseWritePage => Some(0x03),
                PageBufferClear => Some(0x04),
                ChipErase => Some(0x05),
                EepromErase => Some(0x06),
                WriteFuse => Some(0x07),
                _ => None,
            },
            // v3 keeps the v2 command values on the later register
            // layout; neither generation has a page buffer.
            NvmVersion::V2 | NvmVersion::V3 => match action {
                Nop => Some(0x00),
                FlashWrite => Some(0x02),
                ErasePage => Some(0x08),
                EepromWrite => Some(0x12),
                EepromEraseWrite => Some(0x13),
                ChipErase => Some(0x20),
                EepromErase => Some(0x30),
                _ => None,
            },
            NvmVersion::V5 => match action {
                Nop => Some(0x00),
                WritePage => Some(0x04),
                EraseWritePage => Some(0x05),
                ErasePage => Some(0x08),
                PageBufferClear => Some(0x0F),
                EepromWrite => Some(0x14),
                EepromEraseWrite => Some(0x15),
                EepromPageErase => Some(0x17),
                EepromPageBufferClear => Some(0x1F),
                ChipErase => Some(0x20),
                EepromErase => Some(0x30),
                _ => None,
            },
        }
    }
}

/// NVMCTRL register layout of one generation, as offsets from the
/// controller base
struct NvmRegs {
    status: u32,
    data: u32,
    addr: u32,
    busy_mask: u8,
    error_mask: u8,
    error_shift: u8,
}

fn registers(version: NvmVersion) -> NvmRegs {
    match version {
        NvmVersion::V0 | NvmVersion::V2 => NvmRegs {
            status: 0x02,
            data: 0x06,
            addr: 0x08,
            busy_mask: 0x03,
            error_mask: 0x04,
            error_shift: 2,
        },
        NvmVersion::V3 | NvmVersion::V5 => NvmRegs {
            status: 0x06,
            data: 0x08,
            addr: 0x0C,
            busy_mask: 0x03,
            error_mask: 0x70,
            error_shift: 4,
        },
    }
}

/// Driver for the NVM controller of one device
pub struct NvmDriver {
    version: NvmVersion,
    base: u32,
    /// The user row only accepts whole-page single-commit writes (AVR-DU)
    user_row_single_op: bool,
}

impl NvmDriver {
    pub fn new(device: &Device) -> Self {
        NvmDriver {
            version: device.nvm_version,
            base: device.nvmctrl_base,
            user_row_single_op: device.family == Family::AvrDu,
        }
    }

    pub fn version(&self) -> NvmVersion {
        self.version
    }

    pub fn user_row_single_op(&self) -> bool {
        self.user_row_single_op
    }

    /// Execute a command on NVMCTRL.CTRLA
    fn execute(&self, conn: &mut Connection, action: NvmAction) -> Result<(), Error> {
        // The command tables are total over the actions each flow uses;
        // a miss here is a driver bug, not a device condition.
        let word = self
            .version
            .command_word(action)
            .expect("action unsupported by this NVM generation");
        debug!("NVMCMD {:#04x} ({:?})", word, action);
        conn.st8(self.base, word)
    }

    /// Clear any latched command word, on generations that require it
    fn clear_command(&self, conn: &mut Connection) -> Result<(), Error> {
        if self.version != NvmVersion::V0 {
            self.execute(conn, NvmAction::Nop)?;
        }
        Ok(())
    }

    /// Poll the status register until both busy bits clear. A latched
    /// write error surfaces with its code; expiry surfaces as NvmTimeout.
    fn wait_ready(
        &self,
        conn: &mut Connection,
        timeout: Duration,
        during: &'static str,
    ) -> Result<(), Error> {
        let regs = registers(self.version);
        let deadline = Timeout::new(timeout);

        loop {
            let status = conn.ld8(self.base + regs.status)?;

            if status & regs.error_mask != 0 {
                return Err(Error::NvmError {
                    code: (status & regs.error_mask) >> regs.error_shift,
                });
            }
            if status & regs.busy_mask == 0 {
                return Ok(());
            }
            if deadline.expired() {
                return Err(Error::NvmTimeout { during });
            }
        }
    }

    /// Erase the entire device. On locked devices this is refused by the
    /// controller; the key-based unlock flow must be used instead.
    pub fn chip_erase(&self, conn: &mut Connection) -> Result<(), Error> {
        debug!("Chip erase using NVMCTRL");

        self.wait_ready(conn, READY_TIMEOUT, "before chip erase")?;
        self.execute(conn, NvmAction::ChipErase)?;
        let status = self.wait_ready(conn, CHIP_ERASE_TIMEOUT, "after chip erase");
        self.clear_command(conn)?;
        status
    }

    /// Erase a single flash page
    pub fn erase_flash_page(&self, conn: &mut Connection, address: u32) -> Result<(), Error> {
        debug!("Erase flash page at {:#08x}", address);

        self.wait_ready(conn, READY_TIMEOUT, "before flash page erase")?;

        match self.version {
            NvmVersion::V2 | NvmVersion::V3 => {
                // The bufferless generations latch the command first; the
                // dummy write selects the page.
                self.execute(conn, NvmAction::ErasePage)?;
                conn.write_data(address, &[0xFF])?;
            }
            _ => {
                conn.write_data(address, &[0xFF])?;
                self.execute(conn, NvmAction::ErasePage)?;
            }
        }

        let status = self.wait_ready(conn, READY_TIMEOUT, "after flash page erase");
        self.clear_command(conn)?;
        status
    }

    /// Erase the EEPROM in one operation
    pub fn erase_eeprom(&self, conn: &mut Connection) -> Result<(), Error> {
        debug!("Erase EEPROM");

        self.wait_ready(conn, READY_TIMEOUT, "before EEPROM erase")?;
        self.execute(conn, NvmAction::EepromErase)?;
        let status = self.wait_ready(conn, READY_TIMEOUT, "after EEPROM erase");
        self.clear_command(conn)?;
        status
    }

    /// Erase the user row
    pub fn erase_user_row(&self, conn: &mut Connection, address: u32, size: u32) -> Result<(), Error> {
        debug!("Erase user row");

        match self.version {
            NvmVersion::V0 => {
                // EEPROM-backed: each location to be erased needs a dummy
                // write before the page erase.
                self.wait_ready(conn, READY_TIMEOUT, "before user row erase")?;
                for offset in 0..size {
                    conn.write_data(address + offset, &[0xFF])?;
                }
                self.execute(conn, NvmAction::ErasePage)?;
                self.wait_ready(conn, READY_TIMEOUT, "after user row erase")
            }
            // Flash-backed on the later generations
            _ => self.erase_flash_page(conn, address),
        }
    }

    /// Write one page worth of flash
    pub fn write_flash(&self, conn: &mut Connection, address: u32, data: &[u8]) -> Result<(), Error> {
        match self.version {
            NvmVersion::V0 => {
                // ERASE_WRITE_PAGE is the only page op that behaves on all
                // v0 parts regardless of prior erase state.
                self.buffered_write(conn, address, data, true, NvmAction::PageBufferClear, NvmAction::EraseWritePage)
            }
            NvmVersion::V2 | NvmVersion::V3 => {
                self.direct_write(conn, address, data, true, NvmAction::FlashWrite)
            }
            NvmVersion::V5 => {
                self.buffered_write(conn, address, data, true, NvmAction::PageBufferClear, NvmAction::WritePage)
            }
        }
    }

    /// Write one page worth of EEPROM
    pub fn write_eeprom(&self, conn: &mut Connection, address: u32, data: &[u8]) -> Result<(), Error> {
        match self.version {
            NvmVersion::V0 => {
                self.buffered_write(conn, address, data, false, NvmAction::PageBufferClear, NvmAction::EraseWritePage)
            }
            NvmVersion::V2 | NvmVersion::V3 => {
                self.direct_write(conn, address, data, false, NvmAction::EepromEraseWrite)
            }
            NvmVersion::V5 => self.buffered_write(
                conn,
                address,
                data,
                false,
                NvmAction::EepromPageBufferClear,
                NvmAction::EepromEraseWrite,
            ),
        }
    }

    /// Write one page worth of user row
    pub fn write_user_row(&self, conn: &mut Connection, address: u32, data: &[u8]) -> Result<(), Error> {
        match self.version {
            // EEPROM-backed
            NvmVersion::V0 => self.write_eeprom(conn, address, data),
            // Flash-backed, byte access
            NvmVersion::V2 | NvmVersion::V3 => {
                self.direct_write(conn, address, data, false, NvmAction::FlashWrite)
            }
            NvmVersion::V5 => self.buffered_write(
                conn,
                address,
                data,
                false,
                NvmAction::PageBufferClear,
                NvmAction::EraseWritePage,
            ),
        }
    }

    /// Write a single fuse byte
    pub fn write_fuse(&self, conn: &mut Connection, address: u32, value: u8) -> Result<(), Error> {
        match self.version {
            NvmVersion::V0 => {
                // Dedicated fuse-write command taking the target address
                // through the NVMCTRL ADDR/DATA registers.
                let regs = registers(self.version);

                self.wait_ready(conn, READY_TIMEOUT, "before fuse write")?;

                debug!("Load fuse address and data");
                conn.st8(self.base + regs.addr, address as u8)?;
                conn.st8(self.base + regs.addr + 1, (address >> 8) as u8)?;
                conn.st8(self.base + regs.data, value)?;

                self.execute(conn, NvmAction::WriteFuse)?;
                self.wait_ready(conn, READY_TIMEOUT, "after fuse write")
            }
            // Fuses are EEPROM-backed on the later generations
            _ => self.write_eeprom(conn, address, &[value]),
        }
    }

    /// The page-buffer flow: clear the buffer, stream the data into the
    /// page window, commit, and wait for the controller to go idle.
    fn buffered_write(
        &self,
        conn: &mut Connection,
        address: u32,
        data: &[u8],
        word_access: bool,
        buffer_clear: NvmAction,
        commit: NvmAction,
    ) -> Result<(), Error> {
        self.wait_ready(conn, READY_TIMEOUT, "before page buffer clear")?;

        debug!("Clear page buffer");
        self.execute(conn, buffer_clear)?;
        self.wait_ready(conn, READY_TIMEOUT, "after page buffer clear")?;

        if word_access {
            conn.write_data_words(address, data)?;
        } else {
            conn.write_data(address, data)?;
        }

        debug!("Committing page");
        self.execute(conn, commit)?;
        let status = self.wait_ready(conn, READY_TIMEOUT, "after page write");
        self.clear_command(conn)?;
        status
    }

    /// The bufferless flow of v2: latch the write command, then stream
    /// data straight into the region.
    fn direct_write(
        &self,
        conn: &mut Connection,
        address: u32,
        data: &[u8],
        word_access: bool,
        command: NvmAction,
    ) -> Result<(), Error> {
        self.wait_ready(conn, READY_TIMEOUT, "before NVM write")?;

        self.execute(conn, command)?;

        if word_access {
            conn.write_data_words(address, data)?;
        } else {
            conn.write_data(address, data)?;
        }

        let status = self.wait_ready(conn, READY_TIMEOUT, "after NVM write");
        self.clear_command(conn)?;
        status
    }
}
