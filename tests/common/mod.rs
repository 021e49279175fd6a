#![allow(dead_code)]

//! A scripted UPDI target for driving the full stack without hardware
//!
//! [MockPort] implements the serial seam the link layer consumes. Every
//! written byte is echoed back first (the TX/RX tie), then fed to a small
//! state machine that parses UPDI instruction frames and emulates the ASI
//! key/reset/lock logic, a flat memory, and enough of NVMCTRL to satisfy
//! the drivers: the status register always reads idle, command words are
//! recorded, and the erase commands actually erase.

use std::{cell::RefCell, collections::HashMap, collections::VecDeque, rc::Rc, time::Duration};

use updiflash::{
    error::LinkError,
    interface::UpdiPort,
    targets::{Device, MemoryKind, NvmVersion},
};

const ACK: u8 = 0x40;

const CS_CTRLA: usize = 0x02;
const ASI_KEY_STATUS: usize = 0x07;
const ASI_RESET_REQ: usize = 0x08;
const ASI_SYS_CTRLA: usize = 0x0A;

const KEY_STATUS_CHIPERASE: u8 = 1 << 3;
const KEY_STATUS_NVMPROG: u8 = 1 << 4;
const KEY_STATUS_UROWWRITE: u8 = 1 << 5;

const SYS_STATUS_NVMPROG: u8 = 1 << 3;
const SYS_STATUS_UROWPROG: u8 = 1 << 2;
const SYS_STATUS_LOCKSTATUS: u8 = 1 << 0;

const CTRLA_RSD: u8 = 1 << 3;

#[derive(Debug)]
enum Phase {
    Idle,
    Opcode,
    Operand { opcode: u8, needed: usize, got: Vec<u8> },
    StsData { address: u32, needed: usize, got: Vec<u8> },
    StData { unit: usize, units_left: usize, got: Vec<u8> },
}

/// Emulated target state, shared between the port and the test body
pub struct MockTarget {
    pub device: &'static Device,
    pub mem: HashMap<u32, u8>,
    pub locked: bool,
    pub progmode: bool,
    pub urowprog: bool,
    reset_held: bool,
    cs: [u8; 16],
    key_status: u8,
    ptr: u32,
    pending_repeat: usize,
    last_nvm_write: u32,
    /// Every command word written to NVMCTRL.CTRLA, in order
    pub commands: Vec<u8>,
    phase: Phase,
    sib: [u8; 32],
}

impl MockTarget {
    pub fn new(device: &'static Device, locked: bool) -> Self {
        let mut target = MockTarget {
            device,
            mem: HashMap::new(),
            locked,
            progmode: false,
            urowprog: false,
            reset_held: false,
            cs: [0; 16],
            key_status: 0,
            ptr: 0,
            pending_repeat: 0,
            last_nvm_write: 0,
            commands: Vec::new(),
            phase: Phase::Idle,
            sib: [0; 32],
        };
        target.sib = target.build_sib();
        target.erase_nvm();
        target.load_signature();
        target
    }

    fn build_sib(&self) -> [u8; 32] {
        let digit = match self.device.family {
            updiflash::targets::Family::AvrDu => '4',
            updiflash::targets::Family::AvrEx => '3',
            _ => match self.device.nvm_version {
                NvmVersion::V0 => '0',
                NvmVersion::V2 => '2',
                NvmVersion::V3 => '3',
                NvmVersion::V5 => '5',
                _ => unreachable!("unknown NVM version"),
            },
        };
        let text = format!(
            "{:<7} P:{}D:1-3M2 (A3.KV00S.0)",
            self.device.family.sib_family(),
            digit
        );
        let mut sib = [0u8; 32];
        sib[..text.len()].copy_from_slice(text.as_bytes());
        sib
    }

    fn load_signature(&mut self) {
        let sigrow = self.device.sigrow_base();
        for (index, &byte) in self.device.signature.iter().enumerate() {
            self.mem.insert(sigrow + index as u32, byte);
        }
        // Revision and a serial number for the identity logging.
        self.mem.insert(self.device.syscfg_base + 1, 0x01);
        for index in 0..10 {
            self.mem.insert(sigrow + 3 + index, 0xC0 + index as u8);
        }
    }

    fn erase_nvm(&mut self) {
        for kind in [
            MemoryKind::Flash,
            MemoryKind::Eeprom,
            MemoryKind::UserRow,
            MemoryKind::BootRow,
        ] {
            if let Ok(region) = self.device.memory(kind) {
                for address in region.base..region.base + region.size {
                    self.mem.insert(address, 0xFF);
                }
            }
        }
    }

    fn region_of(&self, address: u32) -> Option<&'static updiflash::targets::MemoryRegion> {
        self.device
            .memories
            .iter()
            .find(|region| address >= region.base && address < region.base + region.size)
    }

    pub fn read_mem(&self, address: u32) -> u8 {
        if self.locked && !self.urowprog {
            return 0x00;
        }
        *self.mem.get(&address).unwrap_or(&0x00)
    }

    fn write_mem(&mut self, address: u32, value: u8) {
        let nvmctrl = self.device.nvmctrl_base;
        if address == nvmctrl {
            self.commands.push(value);
            self.execute_nvm_command(value);
            return;
        }
        if self.locked && !self.urowprog {
            return;
        }
        if address < nvmctrl || address >= nvmctrl + 0x10 {
            self.last_nvm_write = address;
        }
        self.mem.insert(address, value);
    }

    fn execute_nvm_command(&mut self, command: u8) {
        let (chip_erase, eeprom_erase, page_erase, fuse_write) = match self.device.nvm_version {
            NvmVersion::V0 => (0x05, 0x06, 0x02, Some(0x07)),
            NvmVersion::V2 => (0x20, 0x30, 0x08, None),
            NvmVersion::V3 | NvmVersion::V5 => (0x20, 0x30, 0x08, None),
            _ => unreachable!("unknown NVM version"),
        };

        if command == chip_erase {
            self.erase_nvm();
        } else if command == eeprom_erase {
            if let Ok(region) = self.device.memory(MemoryKind::Eeprom) {
                for address in region.base..region.base + region.size {
                    self.mem.insert(address, 0xFF);
                }
            }
        } else if command == page_erase || command == 0x17 {
            // Erase the page around the last data-space write; the whole
            // region when it is the quirky EEPROM-backed user row.
            if let Some(region) = self.region_of(self.last_nvm_write) {
                let (start, len) = if region.kind == MemoryKind::UserRow {
                    (region.base, region.size)
                } else {
                    let page = region.page_size.max(1);
                    ((self.last_nvm_write / page) * page, page)
                };
                for address in start..start + len {
                    self.mem.insert(address, 0xFF);
                }
            }
        } else if Some(command) == fuse_write {
            let addr_reg = self.device.nvmctrl_base + 0x08;
            let data_reg = self.device.nvmctrl_base + 0x06;
            let low = *self.mem.get(&addr_reg).unwrap_or(&0) as u32;
            let high = *self.mem.get(&(addr_reg + 1)).unwrap_or(&0) as u32;
            let value = *self.mem.get(&data_reg).unwrap_or(&0);
            self.mem.insert(low | (high << 8), value);
        }
    }

    fn cs_read(&self, cs: usize) -> u8 {
        match cs {
            0x00 => 0x30, // STATUSA: PDI revision
            0x0B => {
                let mut status = 0;
                if self.locked {
                    status |= SYS_STATUS_LOCKSTATUS;
                }
                if self.progmode {
                    status |= SYS_STATUS_NVMPROG;
                }
                if self.urowprog {
                    status |= SYS_STATUS_UROWPROG;
                }
                status
            }
            ASI_KEY_STATUS => self.key_status,
            other => self.cs[other & 0x0F],
        }
    }

    fn cs_write(&mut self, cs: usize, value: u8) {
        match cs {
            ASI_RESET_REQ => {
                if value == 0x59 {
                    self.reset_held = true;
                } else if self.reset_held {
                    self.reset_held = false;
                    self.apply_reset_release();
                }
            }
            ASI_KEY_STATUS => {
                // Writing a bit clears the latched key.
                self.key_status &= !value;
            }
            ASI_SYS_CTRLA => {
                if value & 0x02 != 0 && self.urowprog {
                    self.urowprog = false;
                }
            }
            other => self.cs[other & 0x0F] = value,
        }
    }

    fn apply_reset_release(&mut self) {
        if self.key_status & KEY_STATUS_CHIPERASE != 0 {
            self.locked = false;
            self.erase_nvm();
            self.load_signature();
            self.key_status &= !KEY_STATUS_CHIPERASE;
            self.progmode = false;
            return;
        }
        if self.key_status & KEY_STATUS_UROWWRITE != 0 && self.locked {
            self.urowprog = true;
            self.key_status &= !KEY_STATUS_UROWWRITE;
            return;
        }
        if self.key_status & KEY_STATUS_NVMPROG != 0 {
            if !self.locked {
                self.progmode = true;
            }
            self.key_status &= !KEY_STATUS_NVMPROG;
            return;
        }
        self.progmode = false;
    }

    /// Feed one received byte; returns whatever the target transmits back
    fn feed(&mut self, byte: u8) -> Vec<u8> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                if byte == 0x55 {
                    self.phase = Phase::Opcode;
                }
                vec![]
            }
            Phase::Opcode => self.decode(byte),
            Phase::Operand {
                opcode,
                needed,
                mut got,
            } => {
                got.push(byte);
                if got.len() < needed {
                    self.phase = Phase::Operand { opcode, needed, got };
                    vec![]
                } else {
                    self.execute(opcode, got)
                }
            }
            Phase::StsData {
                address,
                needed,
                mut got,
            } => {
                got.push(byte);
                if got.len() < needed {
                    self.phase = Phase::StsData { address, needed, got };
                    vec![]
                } else {
                    for (index, &value) in got.iter().enumerate() {
                        self.write_mem(address + index as u32, value);
                    }
                    vec![ACK]
                }
            }
            Phase::StData {
                unit,
                units_left,
                mut got,
            } => {
                got.push(byte);
                if got.len() < unit {
                    self.phase = Phase::StData { unit, units_left, got };
                    return vec![];
                }

                for &value in &got {
                    self.write_mem(self.ptr, value);
                    self.ptr += 1;
                }

                let units_left = units_left - 1;
                if units_left > 0 {
                    self.phase = Phase::StData {
                        unit,
                        units_left,
                        got: Vec::new(),
                    };
                }

                if self.cs[CS_CTRLA] & CTRLA_RSD != 0 {
                    vec![]
                } else {
                    vec![ACK]
                }
            }
        }
    }

    fn decode(&mut self, opcode: u8) -> Vec<u8> {
        match opcode >> 5 {
            // LDS
            0 => {
                let needed = self.address_len(opcode);
                self.phase = Phase::Operand {
                    opcode,
                    needed,
                    got: Vec::new(),
                };
                vec![]
            }
            // LD via pointer
            1 => {
                let unit = (opcode & 0x03) as usize + 1;
                let units = self.take_repeat();
                let mut response = Vec::new();
                for _ in 0..units {
                    for _ in 0..unit {
                        response.push(self.read_mem(self.ptr));
                        self.ptr += 1;
                    }
                }
                response
            }
            // STS
            2 => {
                let needed = self.address_len(opcode);
                self.phase = Phase::Operand {
                    opcode,
                    needed,
                    got: Vec::new(),
                };
                vec![]
            }
            // ST: pointer load or pointer-indirect store
            3 => {
                if opcode & 0x0C == 0x08 {
                    let needed = (opcode & 0x03) as usize + 1;
                    self.phase = Phase::Operand {
                        opcode,
                        needed,
                        got: Vec::new(),
                    };
                } else {
                    let unit = (opcode & 0x03) as usize + 1;
                    let units = self.take_repeat();
                    self.phase = Phase::StData {
                        unit,
                        units_left: units,
                        got: Vec::new(),
                    };
                }
                vec![]
            }
            // LDCS
            4 => vec![self.cs_read((opcode & 0x0F) as usize)],
            // REPEAT
            5 => {
                self.phase = Phase::Operand {
                    opcode,
                    needed: 1,
                    got: Vec::new(),
                };
                vec![]
            }
            // STCS
            6 => {
                self.phase = Phase::Operand {
                    opcode,
                    needed: 1,
                    got: Vec::new(),
                };
                vec![]
            }
            // KEY / SIB
            7 => {
                if opcode & 0x04 != 0 {
                    self.sib.to_vec()
                } else {
                    self.phase = Phase::Operand {
                        opcode,
                        needed: 8,
                        got: Vec::new(),
                    };
                    vec![]
                }
            }
            _ => unreachable!(),
        }
    }

    fn execute(&mut self, opcode: u8, operands: Vec<u8>) -> Vec<u8> {
        match opcode >> 5 {
            // LDS: respond with the data
            0 => {
                let address = Self::address_from(&operands);
                let width = (opcode & 0x03) as usize + 1;
                (0..width)
                    .map(|index| self.read_mem(address + index as u32))
                    .collect()
            }
            // STS: ACK the address, data follows
            2 => {
                let address = Self::address_from(&operands);
                let width = (opcode & 0x03) as usize + 1;
                self.phase = Phase::StsData {
                    address,
                    needed: width,
                    got: Vec::new(),
                };
                vec![ACK]
            }
            // ST_PTR: latch the pointer
            3 => {
                self.ptr = Self::address_from(&operands);
                vec![ACK]
            }
            // REPEAT
            5 => {
                self.pending_repeat = operands[0] as usize;
                vec![]
            }
            // STCS
            6 => {
                self.cs_write((opcode & 0x0F) as usize, operands[0]);
                vec![]
            }
            // KEY: bytes arrive reversed
            7 => {
                let mut key = operands;
                key.reverse();
                match key.as_slice() {
                    b"NVMProg " => self.key_status |= KEY_STATUS_NVMPROG,
                    b"NVMErase" => self.key_status |= KEY_STATUS_CHIPERASE,
                    b"NVMUs&te" => self.key_status |= KEY_STATUS_UROWWRITE,
                    _ => {}
                }
                vec![]
            }
            _ => unreachable!(),
        }
    }

    fn address_len(&self, opcode: u8) -> usize {
        match (opcode >> 2) & 0x03 {
            1 => 2,
            2 => 3,
            other => panic!("unsupported address size {other}"),
        }
    }

    fn address_from(operands: &[u8]) -> u32 {
        operands
            .iter()
            .enumerate()
            .fold(0u32, |acc, (index, &byte)| acc | ((byte as u32) << (8 * index)))
    }

    fn take_repeat(&mut self) -> usize {
        let units = self.pending_repeat + 1;
        self.pending_repeat = 0;
        units
    }
}

/// Serial port wrapper feeding the scripted target
pub struct MockPort {
    pub target: Rc<RefCell<MockTarget>>,
    rx: Rc<RefCell<VecDeque<u8>>>,
    baud: u32,
    corrupt_next_echo: Rc<RefCell<bool>>,
}

impl MockPort {
    pub fn new(device: &'static Device, locked: bool) -> (Self, Rc<RefCell<MockTarget>>) {
        let target = Rc::new(RefCell::new(MockTarget::new(device, locked)));
        let port = MockPort {
            target: Rc::clone(&target),
            rx: Rc::new(RefCell::new(VecDeque::new())),
            baud: 115_200,
            corrupt_next_echo: Rc::new(RefCell::new(false)),
        };
        (port, target)
    }

    /// Handle that makes the next echoed byte come back corrupted
    pub fn corruption_handle(&self) -> Rc<RefCell<bool>> {
        Rc::clone(&self.corrupt_next_echo)
    }

    /// Handle onto the receive queue, for echo-accounting assertions
    pub fn rx_handle(&self) -> Rc<RefCell<VecDeque<u8>>> {
        Rc::clone(&self.rx)
    }
}

impl UpdiPort for MockPort {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError> {
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), LinkError> {
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        for &byte in bytes {
            // The TX/RX tie: the echo lands first.
            let mut echoed = byte;
            if std::mem::take(&mut *self.corrupt_next_echo.borrow_mut()) {
                echoed ^= 0x01;
            }
            self.rx.borrow_mut().push_back(echoed);

            for response in self.target.borrow_mut().feed(byte) {
                self.rx.borrow_mut().push_back(response);
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let mut rx = self.rx.borrow_mut();
        let mut filled = 0;
        while filled < buf.len() {
            match rx.pop_front() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                None => break,
            }
        }
        Ok(filled)
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.rx.borrow_mut().clear();
        Ok(())
    }

    fn send_break(&mut self, _double: bool) -> Result<(), LinkError> {
        let mut target = self.target.borrow_mut();
        target.phase = Phase::Idle;
        target.pending_repeat = 0;
        self.rx.borrow_mut().clear();
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), LinkError> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<(), LinkError> {
        Ok(())
    }
}
