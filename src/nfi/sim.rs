//! A simulated NFI block with one NAND chip attached, for testing purposes.
//!
//! The model covers what the driver relies on: write-1-to-clear status flags, self-clearing reset
//! bits, the command/address/data ports, DMA start bits and the SMRA window. The chip behind it
//! has a page register, program-only-clears-bits semantics and block erase.
//!
//! Instead of real BCH codes, the simulator keeps a reference copy of every page programmed with
//! ECC enabled. On an ECC read each field is diffed against that copy and the differences are
//! reported through the status and syndrome registers, one field at a time, the way the engine
//! does. Pages programmed without ECC (or never programmed) always read clean.
//!
//! Protocol violations by the driver, such as a wrong number of address cycles, panic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};

use crc::{Crc, CRC_32_ISO_HDLC};

use super::bch::{FieldStatus, FIELD_META_LEN, MAX_SYNDROMES};
use super::regs::*;
use super::Command;
use crate::geometry::ident::ID_LEN;
use crate::geometry::{BchStrength, NandGeometry, PageSize};
use crate::nand::PageUtil;

/// Stand-in parity generator; only has to be deterministic
const PARITY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Bus address handed out for every DMA buffer
const DMA_WINDOW: u32 = 0x8000_0000;

const STATUS_READY: u8 = 0xC0;
const STATUS_FAIL: u8 = 0x01;

/// Strap pins with both the ECC and page-size fields left unset
const PINS_UNSET: u32 = 0xF0;

/// Chips above this size take a third row address cycle
const SMALL_CHIP_LIMIT: u64 = 128 << 20;

/// Physical description of a simulated chip
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SimChip {
    pub name: &'static str,
    pub id: [u8; ID_LEN],
    pub page_size: usize,

    /// Spare bytes physically present per page
    pub spare_size: usize,
    pub pages_per_block: u32,
    pub blocks: u32,
}

impl SimChip {
    /// 128 MiB, 2048 + 64
    pub const K9F1G08: Self = Self {
        name: "K9F1G08",
        id: [0xEC, 0xF1, 0x00, 0x95, 0x40, 0x00],
        page_size: 2048,
        spare_size: 64,
        pages_per_block: 64,
        blocks: 1024,
    };

    /// 512 MiB, 4096 + 224
    pub const TC58NVG2S0F: Self = Self {
        name: "TC58NVG2S0F",
        id: [0x98, 0xDC, 0x90, 0x26, 0x76, 0x15],
        page_size: 4096,
        spare_size: 224,
        pages_per_block: 64,
        blocks: 2048,
    };

    /// 4 GiB, 8192 + 448; the ID only advertises 256 spare bytes
    pub const MT29F32G08: Self = Self {
        name: "MT29F32G08",
        id: [0x2C, 0xD7, 0x00, 0xB7, 0x00, 0x00],
        page_size: 8192,
        spare_size: 448,
        pages_per_block: 64,
        blocks: 8192,
    };

    pub const ALL: [Self; 3] = [Self::K9F1G08, Self::TC58NVG2S0F, Self::MT29F32G08];

    /// Look up a preset by name, ignoring case
    pub fn by_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|chip| chip.name.eq_ignore_ascii_case(name))
    }

    /// Bytes per page including the spare area
    pub fn raw_page_size(&self) -> usize {
        self.page_size + self.spare_size
    }

    pub fn pages(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    pub fn chip_size(&self) -> u64 {
        self.pages() as u64 * self.page_size as u64
    }

    fn row_cycles(&self) -> usize {
        if self.chip_size() > SMALL_CHIP_LIMIT {
            3
        } else {
            2
        }
    }
}

/// What the data port returns on read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DataOut {
    Nothing,
    Page,
    Id,
    Status,
}

/// A DMA start bit that has been set but not yet serviced
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Transfer {
    Read,
    Write,
}

/// Page data collected between SEQIN and PAGEPROG
#[derive(Debug, Clone)]
struct Program {
    row: u32,
    buf: Box<[u8]>,
    cursor: usize,

    /// Set when the data went through the ECC engine
    ecc: bool,
}

#[derive(Debug, Clone)]
struct FieldReport {
    field: usize,
    status: FieldStatus,
    errors: Vec<(u16, u8)>,
}

#[derive(Debug)]
pub struct SimNfi {
    chip: SimChip,
    regs: HashMap<usize, u32>,
    window: Box<[u8]>,

    /// Raw pages (data + spare); missing pages are erased
    flash: HashMap<u32, Box<[u8]>>,

    /// Content of pages as they were programmed with ECC
    reference: HashMap<u32, Box<[u8]>>,

    /// Blocks whose program and erase operations fail
    failing: HashSet<u32>,

    otp: u32,
    pin: u32,

    command: Option<Command>,
    address: Vec<u8>,
    column: usize,
    row: u32,
    cache: Box<[u8]>,
    cache_row: Option<u32>,
    out: DataOut,
    cursor: usize,
    program: Option<Program>,
    status: u8,

    transfer: Option<Transfer>,
    reports: VecDeque<FieldReport>,
    reading: bool,
    hang: bool,

    commands: Vec<u8>,
    addresses: Vec<u32>,
}

impl SimNfi {
    /// A fresh, fully erased chip
    pub fn new(chip: SimChip) -> Self {
        Self {
            chip,
            regs: HashMap::new(),
            window: vec![ERASED; SMRA_WINDOW_LEN].into_boxed_slice(),
            flash: HashMap::new(),
            reference: HashMap::new(),
            failing: HashSet::new(),
            otp: 0,
            pin: PINS_UNSET,
            command: None,
            address: Vec::new(),
            column: 0,
            row: 0,
            cache: vec![ERASED; chip.raw_page_size()].into_boxed_slice(),
            cache_row: None,
            out: DataOut::Nothing,
            cursor: 0,
            program: None,
            status: STATUS_READY,
            transfer: None,
            reports: VecDeque::new(),
            reading: false,
            hang: false,
            commands: Vec::new(),
            addresses: Vec::new(),
        }
    }

    pub fn chip(&self) -> &SimChip {
        &self.chip
    }

    /// Set the OTP and strap-pin power-on words
    pub fn set_power_on(&mut self, otp: u32, pin: u32) {
        self.otp = otp;
        self.pin = pin;
    }

    /// The SMRA window
    pub fn window(&self) -> &[u8] {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.window
    }

    /// Raw content of a page, data and spare
    pub fn raw_page(&self, page: u32) -> Vec<u8> {
        match self.flash.get(&page) {
            Some(content) => content.to_vec(),
            None => vec![ERASED; self.chip.raw_page_size()],
        }
    }

    /// Flip the bits in `mask` at `offset` of a raw page
    pub fn inject(&mut self, page: u32, offset: usize, mask: u8) {
        let raw = self.chip.raw_page_size();
        let content = self
            .flash
            .entry(page)
            .or_insert_with(|| vec![ERASED; raw].into_boxed_slice());
        if let Some(byte) = content.get_mut(offset) {
            *byte ^= mask;
        }
    }

    /// Make every program and erase in `block` report failure. Erases leave the block untouched.
    pub fn fail_block(&mut self, block: u32) {
        self.failing.insert(block);
    }

    /// Write a factory bad block marker into the first page of `block`
    pub fn set_factory_bad(&mut self, block: u32) {
        let page = block * self.chip.pages_per_block;
        self.inject(page, self.chip.page_size, ERASED);
    }

    /// When set, DMA transfers start but never complete
    pub fn hang_dma(&mut self, hang: bool) {
        self.hang = hang;
    }

    /// Every command byte written since the last [SimNfi::clear_log]
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    /// Every SMADDR word written since the last [SimNfi::clear_log]
    pub fn addresses(&self) -> &[u32] {
        &self.addresses
    }

    pub fn clear_log(&mut self) {
        self.commands.clear();
        self.addresses.clear();
    }

    /// Present one field's ECC report: status byte, error addresses and error values.
    ///
    /// Every other field's status byte is cleared.
    pub fn present_field(&mut self, field: usize, status: FieldStatus, errors: &[(u16, u8)]) {
        for word in 0..SMECC_ST_COUNT {
            self.regs.insert(REG_SMECC_ST0 + word * 4, 0);
        }
        self.present_extra_status(field, status);

        let mut addrs = [0u16; MAX_SYNDROMES];
        let mut values = [0u8; MAX_SYNDROMES];
        for (i, &(addr, value)) in errors.iter().take(MAX_SYNDROMES).enumerate() {
            addrs[i] = addr;
            values[i] = value;
        }

        for reg in 0..BCH_ECC_ADDR_COUNT {
            let word = addrs[reg * 2] as u32 | (addrs[reg * 2 + 1] as u32) << 16;
            self.regs.insert(REG_BCH_ECC_ADDR0 + reg * 4, word);
        }
        for reg in 0..BCH_ECC_DATA_COUNT {
            let mut word = [0u8; 4];
            word.copy_from_slice(&values[reg * 4..][..4]);
            self.regs
                .insert(REG_BCH_ECC_DATA0 + reg * 4, u32::from_le_bytes(word));
        }

        self.set_flags(SMISR_ECC_FIELD);
    }

    /// Set another field's status byte, leaving the rest of the report alone
    pub fn present_extra_status(&mut self, field: usize, status: FieldStatus) {
        let Some(index) = field.checked_sub(1) else {
            return;
        };
        if index / 4 >= SMECC_ST_COUNT {
            return;
        }

        let reg = REG_SMECC_ST0 + (index / 4) * 4;
        let shift = (index % 4) * 8;
        let word = (self.reg(reg) & !(0xFF << shift)) | (status.to_byte() as u32) << shift;
        self.regs.insert(reg, word);
    }

    /// Replace the flash contents with a raw image of `pages() * raw_page_size()` bytes.
    ///
    /// Loaded pages have no ECC reference and always read clean.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        self.flash.clear();
        self.reference.clear();

        let mut buf = vec![0; self.chip.raw_page_size()];
        for page in 0..self.chip.pages() {
            read.read_exact(&mut buf)?;
            if !buf.is_erased() {
                self.flash.insert(page, buf.clone().into_boxed_slice());
            }
        }

        Ok(())
    }

    /// Write the raw flash contents out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let erased = vec![ERASED; self.chip.raw_page_size()];
        for page in 0..self.chip.pages() {
            let content = self.flash.get(&page).map_or(&erased[..], |content| content);
            write.write_all(content)?;
        }

        Ok(())
    }

    fn reg(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn set_flags(&mut self, flags: u32) {
        let isr = self.reg(REG_SMISR) | flags;
        self.regs.insert(REG_SMISR, isr);
    }

    fn window_index(offset: usize, width: usize) -> Option<usize> {
        let index = offset.checked_sub(REG_SMRA0)?;
        (index + width <= SMRA_WINDOW_LEN).then_some(index)
    }

    /// Page size selected by SMCSR
    fn logical_page(&self) -> usize {
        match (self.reg(REG_SMCSR) & SMCSR_PSIZE_MASK) >> 16 {
            0 => 512,
            1 => 2048,
            2 => 4096,
            _ => 8192,
        }
    }

    fn redundant_len(&self) -> usize {
        std::cmp::min(
            (self.reg(REG_SMREACTL) & SMREACTL_SIZE_MASK) as usize,
            SMRA_WINDOW_LEN,
        )
    }

    /// The codeword shape the engine is configured for, if ECC is enabled
    fn ecc_geometry(&self) -> Option<NandGeometry> {
        let csr = self.reg(REG_SMCSR);
        if csr & SMCSR_ECC_EN == 0 {
            return None;
        }

        let strength = match csr & SMCSR_BCH_MASK {
            SMCSR_BCH_T8 => BchStrength::T8,
            SMCSR_BCH_T12 => BchStrength::T12,
            SMCSR_BCH_T24 => BchStrength::T24,
            _ => return None,
        };
        let page = PageSize::from_bytes(self.logical_page())?;
        NandGeometry::new(page, self.redundant_len(), strength).ok()
    }

    fn erased_page(&self) -> Box<[u8]> {
        vec![ERASED; self.chip.raw_page_size()].into_boxed_slice()
    }

    fn write_command(&mut self, code: u8) {
        self.commands.push(code);

        let Some(command) = Command::from_code(code) else {
            log::warn!("sim: ignoring unknown command {code:#04x}");
            return;
        };

        match command {
            Command::Read0 | Command::Erase1 | Command::RndOut | Command::RndIn => {
                self.command = Some(command);
                self.address.clear();
            }
            Command::ReadId => {
                self.command = Some(command);
                self.address.clear();
                self.out = DataOut::Id;
                self.cursor = 0;
            }
            Command::Seqin => {
                self.command = Some(command);
                self.address.clear();
                self.program = Some(Program {
                    row: 0,
                    buf: self.erased_page(),
                    cursor: 0,
                    ecc: false,
                });
            }
            Command::ReadStart => {
                self.cache = self.flash.get(&self.row).cloned().unwrap_or_else(|| self.erased_page());
                self.cache_row = Some(self.row);
                self.out = DataOut::Page;
                self.cursor = self.column;
            }
            Command::RndOutStart => {
                self.out = DataOut::Page;
                self.cursor = self.column;
            }
            Command::PageProg | Command::CachedProg => self.program_page(),
            Command::Erase2 => self.erase_block(),
            Command::Status => self.out = DataOut::Status,
            Command::Reset => {
                self.command = None;
                self.address.clear();
                self.out = DataOut::Nothing;
                self.program = None;
                self.status = STATUS_READY;
            }
            // Mapped to READ0 by the driver
            Command::ReadOob => panic!("sim: READOOB reached the bus"),
        }
    }

    fn write_address(&mut self, value: u32) {
        self.addresses.push(value);
        self.address.push(value as u8);
        if value & SMADDR_ENDADDR != 0 {
            self.end_address();
        }
    }

    fn end_address(&mut self) {
        let bytes = std::mem::take(&mut self.address);
        let rows = self.chip.row_cycles();
        let command = self.command;

        let (columns, rows) = match command {
            Some(Command::Read0 | Command::Seqin) => (2, rows),
            Some(Command::Erase1) => (0, rows),
            Some(Command::RndOut | Command::RndIn) => (2, 0),
            Some(Command::ReadId) => (1, 0),
            _ => panic!("sim: address phase without a command ({command:?})"),
        };
        assert_eq!(
            bytes.len(),
            columns + rows,
            "sim: wrong number of address cycles for {command:?}"
        );

        if command == Some(Command::ReadId) {
            return;
        }
        if columns == 2 {
            self.column = bytes[0] as usize | (bytes[1] as usize) << 8;
        }
        if rows > 0 {
            self.row = bytes[columns..]
                .iter()
                .enumerate()
                .fold(0, |row, (i, &byte)| row | (byte as u32) << (8 * i));
        }

        let (column, row) = (self.column, self.row);
        if let Some(program) = self.program.as_mut() {
            match command {
                Some(Command::Seqin) => {
                    program.row = row;
                    program.cursor = column;
                }
                Some(Command::RndIn) => program.cursor = column,
                _ => (),
            }
        }
    }

    fn program_page(&mut self) {
        let Some(program) = self.program.take() else {
            log::warn!("sim: PAGEPROG without SEQIN");
            self.status = STATUS_READY | STATUS_FAIL;
            return;
        };

        let block = program.row / self.chip.pages_per_block;
        if program.row >= self.chip.pages() {
            self.status = STATUS_READY | STATUS_FAIL;
            return;
        }

        let erased = self.erased_page();
        let content = self.flash.entry(program.row).or_insert(erased);
        for (cell, &byte) in content.iter_mut().zip(program.buf.iter()) {
            *cell &= byte;
        }

        // A worn block still takes the bits, it just reports failure
        if self.failing.contains(&block) {
            self.reference.remove(&program.row);
            self.status = STATUS_READY | STATUS_FAIL;
            return;
        }

        if program.ecc {
            let content = content.clone();
            self.reference.insert(program.row, content);
        } else {
            self.reference.remove(&program.row);
        }
        self.status = STATUS_READY;
    }

    fn erase_block(&mut self) {
        let block = self.row / self.chip.pages_per_block;
        if block >= self.chip.blocks || self.failing.contains(&block) {
            self.status = STATUS_READY | STATUS_FAIL;
            return;
        }

        let pages = block * self.chip.pages_per_block..(block + 1) * self.chip.pages_per_block;
        for page in pages {
            self.flash.remove(&page);
            self.reference.remove(&page);
        }
        self.status = STATUS_READY;
    }

    fn read_data(&mut self) -> u8 {
        let byte = match self.out {
            DataOut::Nothing => ERASED,
            DataOut::Page => self.cache.get(self.cursor).copied().unwrap_or(ERASED),
            DataOut::Id => self.chip.id.get(self.cursor).copied().unwrap_or(0),
            DataOut::Status => return self.status,
        };
        self.cursor += 1;
        byte
    }

    fn write_data(&mut self, byte: u8) {
        match self.program.as_mut() {
            Some(program) => {
                if let Some(cell) = program.buf.get_mut(program.cursor) {
                    *cell = byte;
                }
                program.cursor += 1;
            }
            None => log::warn!("sim: data write outside of a program operation"),
        }
    }

    fn write_smcsr(&mut self, value: u32) {
        if value & SMCSR_SWRST != 0 {
            self.transfer = None;
            self.reports.clear();
            self.reading = false;
        }
        if value & SMCSR_DRD_EN != 0 {
            self.transfer = Some(Transfer::Read);
        }
        if value & SMCSR_DWR_EN != 0 {
            self.transfer = Some(Transfer::Write);
        }

        let value = value & !(SMCSR_SWRST | SMCSR_DRD_EN | SMCSR_DWR_EN);
        self.regs.insert(REG_SMCSR, value);
    }

    fn write_dmaccsr(&mut self, value: u32) {
        if value & DMACCSR_SWRST != 0 {
            self.transfer = None;
        }
        self.regs
            .insert(REG_DMACCSR, value & !(DMACCSR_SWRST | DMACCSR_BUSY));
    }

    fn clear_flags(&mut self, value: u32) {
        let clear = value & (SMISR_DMA_DONE | SMISR_ECC_FIELD | SMISR_RB0_EDGE);
        let isr = self.reg(REG_SMISR) & !clear;
        self.regs.insert(REG_SMISR, isr);

        if clear & SMISR_ECC_FIELD != 0 && self.reading {
            self.reports.pop_front();
            self.present_next();
        }
    }

    /// Show the next queued field report, or finish the read when there are none left
    fn present_next(&mut self) {
        match self.reports.front().cloned() {
            Some(report) => self.present_field(report.field, report.status, &report.errors),
            None => {
                for word in 0..SMECC_ST_COUNT {
                    self.regs.insert(REG_SMECC_ST0 + word * 4, 0);
                }
                self.reading = false;
                self.set_flags(SMISR_DMA_DONE);
            }
        }
    }

    /// Fill each field's parity slot in the window
    fn generate_parity(&mut self, geometry: &NandGeometry, data: &[u8]) {
        let spare = self.redundant_len();
        let Some(base) = spare.checked_sub(geometry.eccbytes()) else {
            return;
        };
        let (field_len, parity_len) = (geometry.field_len(), geometry.parity_len());

        for index in 0..geometry.total_field_count() {
            let mut digest = PARITY_CRC.digest();
            if let Some(field) = data.get(index * field_len..(index + 1) * field_len) {
                digest.update(field);
            }
            let meta = parity_len * index;
            digest.update(&self.window[meta..meta + FIELD_META_LEN]);
            let code = digest.finalize().to_le_bytes();

            let slot = base + parity_len * index;
            for (k, byte) in self.window[slot..slot + parity_len].iter_mut().enumerate() {
                *byte = code[k % 4] ^ k as u8;
            }
        }
    }

    fn dma_write(&mut self, data: &[u8]) {
        let page = self.logical_page();
        let spare = self.redundant_len();
        let auto = self.reg(REG_SMCSR) & SMCSR_REDUN_AUTO_WEN != 0;

        let geometry = self.ecc_geometry();
        if let (true, Some(geometry)) = (auto, &geometry) {
            self.generate_parity(geometry, data);
        }

        match self.program.as_mut() {
            Some(program) => {
                let start = program.cursor;
                for (cell, &byte) in program.buf.iter_mut().skip(start).zip(&data[..data.len().min(page)]) {
                    *cell = byte;
                }
                if auto {
                    for (cell, &byte) in program.buf.iter_mut().skip(page).zip(&self.window[..spare]) {
                        *cell = byte;
                    }
                }
                program.ecc = geometry.is_some();
            }
            None => log::warn!("sim: DMA write outside of a program operation"),
        }

        self.set_flags(SMISR_DMA_DONE);
    }

    fn dma_read(&mut self, data: &mut [u8]) {
        let len = data.len().min(self.logical_page()).min(self.cache.len());
        data[..len].copy_from_slice(&self.cache[..len]);

        self.reports = self.find_errors();
        self.reading = true;
        self.present_next();
    }

    /// Diff the page register against the reference copy, field by field
    fn find_errors(&self) -> VecDeque<FieldReport> {
        let mut reports = VecDeque::new();

        if self.reg(REG_SMCSR) & SMCSR_ECC_CHK == 0 {
            return reports;
        }
        let Some(geometry) = self.ecc_geometry() else {
            return reports;
        };
        let Some(reference) = self.cache_row.and_then(|row| self.reference.get(&row)) else {
            return reports;
        };
        let Some(parity_base) = self.redundant_len().checked_sub(geometry.eccbytes()) else {
            return reports;
        };

        let page = geometry.page_bytes();
        let field_len = geometry.field_len();
        let parity_len = geometry.parity_len();
        let first_parity = field_len + geometry.padding_len() - parity_len;

        // Metadata and parity slots of neighbouring fields overlap; each byte is reported once
        let mut claimed = HashSet::new();
        for index in 0..geometry.total_field_count() {
            let data = (0..field_len).map(|a| (index * field_len + a, a));
            let meta = (0..FIELD_META_LEN).map(|k| (page + parity_len * index + k, field_len + k));
            let parity = (0..parity_len)
                .map(|k| (page + parity_base + parity_len * index + k, first_parity + k));

            let mut errors = Vec::new();
            for (raw, address) in data.chain(meta).chain(parity) {
                let flip = match (self.cache.get(raw), reference.get(raw)) {
                    (Some(now), Some(then)) => now ^ then,
                    _ => 0,
                };
                if flip != 0 && claimed.insert(raw) {
                    errors.push((address as u16, flip));
                }
            }

            if errors.is_empty() {
                continue;
            }
            let status = if errors.len() > geometry.correctable() {
                FieldStatus::Uncorrectable
            } else {
                FieldStatus::Correctable(errors.len())
            };
            reports.push_back(FieldReport {
                field: index + 1,
                status,
                errors,
            });
        }

        reports
    }
}

impl NfiBus for SimNfi {
    fn read32(&mut self, offset: usize) -> u32 {
        match offset {
            REG_SMISR => self.reg(REG_SMISR) | SMISR_RB0,
            REG_SMDATA => self.read_data() as u32,
            _ => match Self::window_index(offset, 4) {
                Some(i) => {
                    let mut word = [0u8; 4];
                    word.copy_from_slice(&self.window[i..i + 4]);
                    u32::from_le_bytes(word)
                }
                None => self.reg(offset),
            },
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        match offset {
            REG_DMACCSR => self.write_dmaccsr(value),
            REG_SMCSR => self.write_smcsr(value),
            REG_SMISR => self.clear_flags(value),
            REG_SMCMD => self.write_command(value as u8),
            REG_SMADDR => self.write_address(value),
            REG_SMDATA => self.write_data(value as u8),
            _ => match Self::window_index(offset, 4) {
                Some(i) => self.window[i..i + 4].copy_from_slice(&value.to_le_bytes()),
                None => {
                    self.regs.insert(offset, value);
                }
            },
        }
    }

    fn read8(&mut self, offset: usize) -> u8 {
        match Self::window_index(offset, 1) {
            Some(i) => self.window[i],
            None => self.read32(offset) as u8,
        }
    }

    fn write8(&mut self, offset: usize, value: u8) {
        match Self::window_index(offset, 1) {
            Some(i) => self.window[i] = value,
            None => self.write32(offset, value as u32),
        }
    }

    fn dma_address(&mut self, _buf: &[u8]) -> u32 {
        DMA_WINDOW
    }

    fn dma_sync(&mut self, buf: DmaSync<'_>) {
        if self.hang {
            return;
        }

        match (self.transfer.take(), buf) {
            (Some(Transfer::Write), DmaSync::ToDevice(data)) => self.dma_write(data),
            (Some(Transfer::Read), DmaSync::FromDevice(data)) => self.dma_read(data),
            (transfer, _) => log::warn!("sim: DMA sync does not match the start bit ({transfer:?})"),
        }
    }

    fn delay_ns(&mut self, _ns: u32) {}
}

impl PowerOnSource for SimNfi {
    fn otp_word(&mut self) -> u32 {
        self.otp
    }

    fn pin_word(&mut self) -> u32 {
        self.pin
    }
}

#[cfg(test)]
const TINY_CHIP: SimChip = SimChip {
    name: "tiny",
    id: [0xEC, 0xF1, 0x00, 0x95, 0x40, 0x00],
    page_size: 512,
    spare_size: 16,
    pages_per_block: 4,
    blocks: 4,
};

#[test]
fn test_status_flags_clear_on_write() {
    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.set_flags(SMISR_DMA_DONE | SMISR_ECC_FIELD);
    assert_ne!(sim.read32(REG_SMISR) & SMISR_RB0, 0);

    sim.write32(REG_SMISR, SMISR_DMA_DONE);
    assert_eq!(sim.read32(REG_SMISR) & SMISR_DMA_DONE, 0);
    assert_ne!(sim.read32(REG_SMISR) & SMISR_ECC_FIELD, 0);
}

#[test]
fn test_reset_bits_self_clear() {
    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.write32(REG_SMCSR, SMCSR_SWRST | SMCSR_ECC_EN);
    assert_eq!(sim.read32(REG_SMCSR), SMCSR_ECC_EN);
    sim.write32(REG_DMACCSR, DMACCSR_EN | DMACCSR_SWRST);
    assert_eq!(sim.read32(REG_DMACCSR), DMACCSR_EN);
}

#[test]
fn test_program_only_clears_bits() {
    let mut sim = SimNfi::new(SimChip::K9F1G08);
    for byte in [0xF0u8, 0x3C] {
        sim.write32(REG_SMCMD, Command::Seqin.code() as u32);
        for addr in [0x00, 0x00, 0x05, SMADDR_ENDADDR] {
            sim.write32(REG_SMADDR, addr);
        }
        sim.write32(REG_SMDATA, byte as u32);
        sim.write32(REG_SMCMD, Command::PageProg.code() as u32);
    }
    assert_eq!(sim.raw_page(5)[0], 0x30);
    assert!(sim.raw_page(5)[1..].is_erased());

    sim.write32(REG_SMCMD, Command::Erase1.code() as u32);
    sim.write32(REG_SMADDR, 0x05);
    sim.write32(REG_SMADDR, SMADDR_ENDADDR);
    sim.write32(REG_SMCMD, Command::Erase2.code() as u32);
    assert!(sim.raw_page(5).is_erased());
}

#[test]
#[should_panic(expected = "wrong number of address cycles")]
fn test_short_address_panics() {
    let mut sim = SimNfi::new(SimChip::TC58NVG2S0F);
    sim.write32(REG_SMCMD, Command::Read0.code() as u32);
    for addr in [0x00, 0x00, 0x01 | SMADDR_ENDADDR] {
        sim.write32(REG_SMADDR, addr);
    }
}

#[test]
fn test_read_id() {
    let mut sim = SimNfi::new(SimChip::TC58NVG2S0F);
    sim.write32(REG_SMCMD, Command::ReadId.code() as u32);
    sim.write32(REG_SMADDR, SMADDR_ENDADDR);
    let id: Vec<u8> = (0..ID_LEN).map(|_| sim.read32(REG_SMDATA) as u8).collect();
    assert_eq!(id, SimChip::TC58NVG2S0F.id);
}

#[test]
fn test_present_field_registers() {
    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.present_field(6, FieldStatus::Correctable(3), &[(1, 0xAA), (0x7FF, 0xBB), (9, 0xCC)]);

    assert_eq!(sim.read32(REG_SMECC_ST0), 0);
    assert_eq!(sim.read32(REG_SMECC_ST0 + 4), 0x0D << 8);
    assert_eq!(sim.read32(REG_BCH_ECC_ADDR0), 0x07FF_0001);
    assert_eq!(sim.read32(REG_BCH_ECC_ADDR0 + 4), 9);
    assert_eq!(sim.read32(REG_BCH_ECC_DATA0), 0x00CC_BBAA);
    assert_ne!(sim.read32(REG_SMISR) & SMISR_ECC_FIELD, 0);
}

#[test]
fn test_load_save() -> anyhow::Result<()> {
    let mut sim = SimNfi::new(TINY_CHIP);
    sim.inject(3, 10, 0x0F);
    sim.inject(15, 527, 0x80);

    let mut image = Vec::new();
    sim.save(&mut image)?;
    assert_eq!(image.len(), 16 * 528);
    assert_eq!(image[3 * 528 + 10], 0xF0);

    let mut copy = SimNfi::new(TINY_CHIP);
    copy.load(&mut image.as_slice())?;
    assert_eq!(copy.raw_page(15), sim.raw_page(15));
    assert!(copy.raw_page(0).is_erased());
    Ok(())
}

#[test]
fn test_presets() {
    assert_eq!(SimChip::by_name("k9f1g08"), Some(SimChip::K9F1G08));
    assert_eq!(SimChip::by_name("nope"), None);
    assert_eq!(SimChip::K9F1G08.row_cycles(), 2);
    assert_eq!(SimChip::TC58NVG2S0F.row_cycles(), 3);
    assert_eq!(SimChip::MT29F32G08.chip_size(), 4096 << 20);
}
