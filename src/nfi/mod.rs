//! Driver for the NAND Flash Interface (NFI) controller with hardware BCH ECC.
//!
//! [NfiController] owns the register bus and everything learned while probing: the chip's
//! identity, the geometry and OOB layout in use, the DMA engine state and the ECC counters. Page
//! transfers go through the DMA engine; everything else (OOB, IDs, status, bad block markers) is
//! moved one byte at a time through the data port.

pub mod bch;
pub mod dma;
pub mod regs;
pub mod sim;
pub mod window;

use crate::error::{check_len, NandError, Result};
use crate::geometry::ident::{ChipInfo, ID_LEN};
use crate::geometry::layout::OobLayout;
use crate::geometry::{self, ConfigWarning, NandGeometry, PowerOnConfig};
use bch::ErrorReport;
use dma::{DmaController, DmaSetup, DmaState, EccStats};
use regs::*;
use window::RedundantArea;

const STATUS_FAIL: u8 = 0x01;

/// Value programmed into the bad block marker
const BAD_BLOCK_MARKER: [u8; 2] = [0x00, 0x00];

/// NAND command opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    Read0 = 0x00,
    ReadStart = 0x30,
    /// Read the spare area; sent to the chip as READ0 at column `page_size`
    ReadOob = 0x50,
    RndOut = 0x05,
    RndOutStart = 0xE0,
    Seqin = 0x80,
    RndIn = 0x85,
    PageProg = 0x10,
    CachedProg = 0x15,
    Erase1 = 0x60,
    Erase2 = 0xD0,
    Status = 0x70,
    ReadId = 0x90,
    Reset = 0xFF,
}

impl Command {
    const ALL: [Self; 14] = [
        Self::Read0,
        Self::ReadStart,
        Self::ReadOob,
        Self::RndOut,
        Self::RndOutStart,
        Self::Seqin,
        Self::RndIn,
        Self::PageProg,
        Self::CachedProg,
        Self::Erase1,
        Self::Erase2,
        Self::Status,
        Self::ReadId,
        Self::Reset,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.code() == code)
    }
}

/// Bound on busy-wait loops
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Poll {
    /// Spins before giving up; `None` waits forever
    pub limit: Option<u32>,
}

impl Poll {
    /// Spin until `done` returns true
    pub fn until<B>(
        &self,
        bus: &mut B,
        what: &'static str,
        mut done: impl FnMut(&mut B) -> bool,
    ) -> Result<()> {
        let mut spins = 0;
        while !done(bus) {
            self.spin(&mut spins, what)?;
        }
        Ok(())
    }

    /// One iteration of a polling loop the caller writes itself
    pub fn spin(&self, spins: &mut u32, what: &'static str) -> Result<()> {
        *spins += 1;
        match self.limit {
            Some(limit) if *spins > limit => Err(NandError::DeviceTimeout(what)),
            _ => {
                std::hint::spin_loop();
                Ok(())
            }
        }
    }
}

/// Controller settings that are not read from the device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NfiConfig {
    /// SMTCR timing word
    pub timing: u32,

    /// Bound on every busy-wait; `None` waits forever
    pub poll_limit: Option<u32>,
}

impl Default for NfiConfig {
    fn default() -> Self {
        Self {
            timing: SMTCR_DEFAULT,
            poll_limit: None,
        }
    }
}

/// Write a command with its address cycles, then wait as the command class requires
fn send<B: NfiBus>(
    bus: &mut B,
    poll: Poll,
    row_cycles: usize,
    command: Command,
    column: Option<usize>,
    row: Option<u32>,
) -> Result<()> {
    log::trace!("command {command:?} column {column:?} row {row:?}");
    bus.write32(REG_SMCMD, command.code() as u32);

    if command == Command::ReadId {
        bus.write32(REG_SMADDR, SMADDR_ENDADDR);
    } else {
        if let Some(column) = column {
            bus.write32(REG_SMADDR, (column & 0xFF) as u32);
            let high = ((column >> 8) & 0xFF) as u32;
            let end = if row.is_none() { SMADDR_ENDADDR } else { 0 };
            bus.write32(REG_SMADDR, high | end);
        }
        if let Some(row) = row {
            for cycle in 0..row_cycles {
                let byte = (row >> (8 * cycle)) & 0xFF;
                let end = if cycle + 1 == row_cycles {
                    SMADDR_ENDADDR
                } else {
                    0
                };
                bus.write32(REG_SMADDR, byte | end);
            }
        }
    }

    match command {
        Command::Seqin
        | Command::PageProg
        | Command::CachedProg
        | Command::Erase1
        | Command::Erase2
        | Command::RndIn
        | Command::Status => return Ok(()),
        Command::Reset => {
            bus.write32(REG_SMCMD, Command::Status.code() as u32);
            bus.write32(REG_SMCMD, Command::Reset.code() as u32);
        }
        Command::RndOut => {
            bus.write32(REG_SMCMD, Command::RndOutStart.code() as u32);
            bus.delay_ns(10);
            return Ok(());
        }
        Command::Read0 => bus.write32(REG_SMCMD, Command::ReadStart.code() as u32),
        _ => (),
    }

    wait_ready(bus, poll)
}

fn wait_ready<B: NfiBus>(bus: &mut B, poll: Poll) -> Result<()> {
    poll.until(bus, "device ready", |bus| {
        bus.read32(REG_SMISR) & SMISR_RB0 != 0
    })
}

fn read_id_bytes<B: NfiBus>(bus: &mut B, poll: Poll) -> Result<[u8; ID_LEN]> {
    send(bus, poll, 0, Command::ReadId, None, None)?;
    let mut id = [0; ID_LEN];
    for byte in id.iter_mut() {
        *byte = bus.read32(REG_SMDATA) as u8;
    }
    Ok(id)
}

/// A probed NFI controller and its attached chip
#[derive(Debug)]
pub struct NfiController<B> {
    bus: B,
    chip: ChipInfo,
    geometry: NandGeometry,
    layout: OobLayout,
    warnings: Vec<ConfigWarning>,
    dma: DmaController,
    redundant: RedundantArea,
    stats: EccStats,
    poll: Poll,
}

impl<B: NfiBus> NfiController<B> {
    /// Bring up the controller, identify the chip and settle on a geometry.
    ///
    /// `power_on` is usually [PowerOnConfig::read] of the SYS block.
    pub fn probe(mut bus: B, power_on: PowerOnConfig, config: NfiConfig) -> Result<Self> {
        let poll = Poll {
            limit: config.poll_limit,
        };

        bus.write32(REG_FMICSR, FMICSR_NAND_EN);
        bus.write32(REG_SMTCR, config.timing);
        bus.modify32(REG_SMCSR, |v| (v & !SMCSR_CS_MASK) | SMCSR_CS0);
        bus.write32(REG_NFECR, NFECR_WP_UNLOCK);

        bus.modify32(REG_SMCSR, |v| v | SMCSR_SWRST);
        poll.until(&mut bus, "controller reset", |bus| {
            bus.read32(REG_SMCSR) & SMCSR_SWRST == 0
        })?;

        send(&mut bus, poll, 0, Command::Reset, None, None)?;
        let id = read_id_bytes(&mut bus, poll)?;
        let chip = ChipInfo::decode(&id)?;
        log::info!(
            "found NAND {:02x}:{:02x}, {} MiB, {} + {} byte pages, {} KiB blocks",
            chip.maker,
            chip.device,
            chip.chip_size >> 20,
            chip.page_size,
            chip.oob_size,
            chip.block_size >> 10
        );

        let selection = geometry::select(chip.page_size, chip.oob_size, power_on)?;
        let geometry = selection.geometry;

        bus.modify32(REG_SMCSR, |v| {
            (v & !SMCSR_PSIZE_MASK) | geometry.page_size.smcsr_bits()
        });
        bus.write32(REG_SMREACTL, geometry.oob_size as u32);
        bus.modify32(REG_SMCSR, |v| v | SMCSR_PROT_3BEN);
        bus.modify32(REG_SMCSR, |v| v | SMCSR_REDUN_AUTO_WEN);
        match geometry.strength.smcsr_bits() {
            Some(bits) => {
                bus.modify32(REG_SMCSR, |v| (v & !SMCSR_BCH_MASK) | bits);
                bus.modify32(REG_SMCSR, |v| v | SMCSR_ECC_EN | SMCSR_ECC_CHK);
            }
            None => bus.modify32(REG_SMCSR, |v| v & !(SMCSR_ECC_EN | SMCSR_ECC_CHK)),
        }

        Ok(Self {
            bus,
            chip,
            geometry,
            layout: selection.layout,
            warnings: selection.warnings,
            dma: DmaController::new(poll),
            redundant: RedundantArea::new(geometry.oob_size),
            stats: EccStats::default(),
            poll,
        })
    }

    pub fn chip(&self) -> &ChipInfo {
        &self.chip
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    pub fn layout(&self) -> &OobLayout {
        &self.layout
    }

    /// Disagreements between the power-on setting and the chip, found while probing
    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    pub fn stats(&self) -> EccStats {
        self.stats
    }

    pub fn dma_state(&self) -> DmaState {
        self.dma.state()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Number of addressable pages
    pub fn pages(&self) -> u32 {
        self.chip.pages()
    }

    pub fn blocks(&self) -> u32 {
        self.chip.blocks()
    }

    pub fn pages_per_block(&self) -> u32 {
        self.chip.pages_per_block()
    }

    /// Issue a command; `column` and `row` are sent when present.
    ///
    /// [Command::ReadOob] is translated to READ0 at column `page_size + column`.
    pub fn command(
        &mut self,
        command: Command,
        column: Option<usize>,
        row: Option<u32>,
    ) -> Result<()> {
        let (command, column) = match command {
            Command::ReadOob => (
                Command::Read0,
                Some(column.unwrap_or(0) + self.geometry.page_bytes()),
            ),
            command => (command, column),
        };
        send(
            &mut self.bus,
            self.poll,
            self.chip.row_cycles(),
            command,
            column,
            row,
        )
    }

    /// Read bytes from the data port
    pub fn read_buf(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.bus.read32(REG_SMDATA) as u8;
        }
    }

    /// Write bytes to the data port
    pub fn write_buf(&mut self, buf: &[u8]) {
        for &byte in buf {
            self.bus.write32(REG_SMDATA, byte as u32);
        }
    }

    pub fn read_id(&mut self) -> Result<[u8; ID_LEN]> {
        read_id_bytes(&mut self.bus, self.poll)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.command(Command::Reset, None, None)
    }

    fn status(&mut self) -> Result<u8> {
        self.command(Command::Status, None, None)?;
        Ok(self.bus.read32(REG_SMDATA) as u8)
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if page < self.pages() {
            Ok(())
        } else {
            Err(NandError::OutOfRange {
                what: "page",
                index: page,
            })
        }
    }

    fn check_block(&self, block: u32) -> Result<()> {
        if block < self.blocks() {
            Ok(())
        } else {
            Err(NandError::OutOfRange {
                what: "block",
                index: block,
            })
        }
    }

    fn dma_setup(&self) -> DmaSetup {
        DmaSetup {
            strength: self.geometry.strength,
            redundant_len: self.geometry.oob_size,
        }
    }

    /// Program one page with hardware ECC.
    ///
    /// The user bytes of `oob` (everything before the parity region) are written as given; on
    /// return the parity region of `oob` holds the parity the engine generated.
    pub fn write_page(&mut self, page: u32, data: &[u8], oob: &mut [u8]) -> Result<()> {
        self.check_page(page)?;
        check_len("page", data, self.geometry.page_bytes())?;
        check_len("oob", oob, self.geometry.oob_size)?;

        let ecc_offset = self.layout.ecc_offset();
        self.command(Command::Seqin, Some(0), Some(page))?;

        self.redundant.fill_erased();
        self.redundant.overlay(&oob[..ecc_offset]);
        self.redundant.store(&mut self.bus);

        let setup = self.dma_setup();
        self.dma.write(&mut self.bus, data, &setup)?;

        self.redundant.load(&mut self.bus);
        oob[ecc_offset..].copy_from_slice(&self.redundant.as_slice()[ecc_offset..]);

        self.command(Command::PageProg, None, None)?;
        wait_ready(&mut self.bus, self.poll)?;
        if self.status()? & STATUS_FAIL != 0 {
            log::error!("program failed on page {page}");
            return Err(NandError::ProgramFailed(page));
        }

        Ok(())
    }

    /// Read one page, correcting it in place.
    ///
    /// `oob` receives the spare area (with metadata and parity corrections applied). Returns one
    /// report per field that needed correction.
    pub fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> Result<Vec<ErrorReport>> {
        check_len("page", data, self.geometry.page_bytes())?;
        self.read_oob(page, oob)?;

        self.command(Command::Read0, Some(0), Some(page))?;
        let setup = self.dma_setup();
        let result = self.dma.read(
            &mut self.bus,
            data,
            &setup,
            &self.geometry,
            &mut self.stats,
            page,
        );

        self.redundant.load(&mut self.bus);
        oob.copy_from_slice(self.redundant.as_slice());

        let reports = result?;
        if !reports.is_empty() {
            log::debug!("page {page}: corrected {} field(s)", reports.len());
        }
        Ok(reports)
    }

    /// Read the spare area of a page into `oob` and the SMRA window
    pub fn read_oob(&mut self, page: u32, oob: &mut [u8]) -> Result<()> {
        self.check_page(page)?;
        check_len("oob", oob, self.geometry.oob_size)?;

        self.command(Command::ReadOob, Some(0), Some(page))?;
        self.read_buf(oob);

        self.redundant.overlay(oob);
        self.redundant.store(&mut self.bus);
        Ok(())
    }

    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        self.check_block(block)?;

        let row = block * self.pages_per_block();
        self.command(Command::Erase1, None, Some(row))?;
        self.command(Command::Erase2, None, None)?;
        wait_ready(&mut self.bus, self.poll)?;
        if self.status()? & STATUS_FAIL != 0 {
            log::error!("erase failed on block {block}");
            return Err(NandError::EraseFailed(block));
        }

        Ok(())
    }

    /// Does the first page of `block` carry a bad block marker?
    pub fn is_bad(&mut self, block: u32) -> Result<bool> {
        self.check_block(block)?;

        let row = block * self.pages_per_block();
        self.command(Command::ReadOob, Some(0), Some(row))?;
        let mut marker = [0];
        self.read_buf(&mut marker);
        Ok(marker[0] != ERASED)
    }

    pub fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.check_block(block)?;

        let row = block * self.pages_per_block();
        let column = self.geometry.page_bytes();
        log::warn!("marking block {block} bad");

        self.command(Command::Seqin, Some(column), Some(row))?;
        self.write_buf(&BAD_BLOCK_MARKER);
        self.command(Command::PageProg, None, None)?;
        wait_ready(&mut self.bus, self.poll)?;
        if self.status()? & STATUS_FAIL != 0 {
            return Err(NandError::ProgramFailed(row));
        }

        Ok(())
    }
}

#[cfg(test)]
const TEST_CONFIG: NfiConfig = NfiConfig {
    timing: SMTCR_DEFAULT,
    poll_limit: Some(10_000),
};

#[cfg(test)]
fn test_controller(sim: sim::SimNfi) -> Result<NfiController<sim::SimNfi>> {
    let mut sim = sim;
    let power_on = PowerOnConfig::read(&mut sim);
    NfiController::probe(sim, power_on, TEST_CONFIG)
}

#[cfg(test)]
fn test_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn test_probe() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    assert_eq!(nfi.geometry().page_bytes(), 2048);
    assert_eq!(nfi.geometry().oob_size, 64);
    assert_eq!(nfi.geometry().strength, geometry::BchStrength::T8);
    assert_eq!(nfi.layout().eccbytes, 60);
    assert_eq!(nfi.pages(), 65536);
    assert!(nfi.warnings().is_empty());

    let bus = nfi.bus_mut();
    assert_eq!(bus.read32(REG_FMICSR), FMICSR_NAND_EN);
    assert_eq!(bus.read32(REG_SMTCR), SMTCR_DEFAULT);
    assert_eq!(bus.read32(REG_NFECR), NFECR_WP_UNLOCK);
    assert_eq!(bus.read32(REG_SMREACTL), 64);

    let csr = bus.read32(REG_SMCSR);
    assert_eq!(csr & SMCSR_PSIZE_MASK, 0x10000);
    assert_eq!(csr & SMCSR_BCH_MASK, SMCSR_BCH_T8);
    assert_eq!(csr & SMCSR_CS_MASK, SMCSR_CS0);
    for bit in [
        SMCSR_ECC_EN,
        SMCSR_ECC_CHK,
        SMCSR_PROT_3BEN,
        SMCSR_REDUN_AUTO_WEN,
    ] {
        assert_ne!(csr & bit, 0);
    }
    Ok(())
}

#[test]
fn test_probe_needs_page_override() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    assert!(matches!(
        test_controller(SimNfi::new(SimChip::MT29F32G08)),
        Err(NandError::Geometry(geometry::GeometryError::OobTooSmall {
            oob_size: 256,
            eccbytes: 368
        }))
    ));

    // Strap pins: ECC unset, 8 KiB pages
    let mut sim = SimNfi::new(SimChip::MT29F32G08);
    sim.set_power_on(0, 0xE0);
    let mut nfi = test_controller(sim)?;
    assert_eq!(nfi.geometry().strength, geometry::BchStrength::T12);
    assert_eq!(nfi.geometry().oob_size, 376);

    let data = test_pattern(8192, 3);
    let mut oob = vec![0xFF; 376];
    oob[4..8].copy_from_slice(b"meta");
    nfi.write_page(1000, &data, &mut oob)?;

    let mut data_out = vec![0; 8192];
    let mut oob_out = vec![0; 376];
    nfi.bus_mut().inject(1000, 8191, 0x01);
    let reports = nfi.read_page(1000, &mut data_out, &mut oob_out)?;
    assert_eq!(data_out, data);
    assert_eq!(&oob_out[4..8], b"meta");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].field, 16);
    Ok(())
}

#[test]
fn test_write_read_round_trip() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::TC58NVG2S0F))?;
    let oob_size = nfi.geometry().oob_size;
    let ecc_offset = nfi.layout().ecc_offset();
    assert_eq!(ecc_offset, 104);

    let data = test_pattern(4096, 7);
    let mut oob = vec![0xFF; oob_size];
    oob[4..ecc_offset].copy_from_slice(&test_pattern(100, 1));
    let user = oob.clone();
    nfi.write_page(77, &data, &mut oob)?;

    // User bytes untouched, parity filled in
    assert_eq!(oob[..ecc_offset], user[..ecc_offset]);
    assert_ne!(oob[ecc_offset..], user[ecc_offset..]);

    let mut data_out = vec![0; 4096];
    let mut oob_out = vec![0; oob_size];
    let reports = nfi.read_page(77, &mut data_out, &mut oob_out)?;
    assert!(reports.is_empty());
    assert_eq!(data_out, data);

    // The written marker lands in bytes 2-3
    assert_eq!(oob_out[..4], [0xFF, 0xFF, 0x00, 0x00]);
    assert_eq!(oob_out[4..], oob[4..]);
    assert_eq!(nfi.stats(), EccStats::default());
    assert_eq!(nfi.dma_state(), DmaState::Idle);
    Ok(())
}

#[test]
fn test_read_corrects_bitflips() -> anyhow::Result<()> {
    use bch::CorrectionTarget;
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    let data = test_pattern(2048, 0x40);
    let mut oob = vec![0xFF; 64];
    nfi.write_page(9, &data, &mut oob)?;

    let mut clean = vec![0; 2048];
    let mut clean_oob = vec![0; 64];
    nfi.read_page(9, &mut clean, &mut clean_oob)?;

    // A data byte and a metadata byte of field 1, a parity byte of field 2
    let bus = nfi.bus_mut();
    bus.inject(9, 100, 0x10);
    bus.inject(9, 2048 + 1, 0x20);
    bus.inject(9, 2048 + 22, 0x0C);

    let mut data_out = vec![0; 2048];
    let mut oob_out = vec![0; 64];
    let reports = nfi.read_page(9, &mut data_out, &mut oob_out)?;
    assert_eq!(data_out, data);
    assert_eq!(oob_out, clean_oob);

    assert_eq!(reports.len(), 2);
    assert_eq!((reports[0].field, reports[0].error_count), (1, 2));
    assert_eq!(reports[0].corrections[0].target, CorrectionTarget::Data);
    assert_eq!(reports[0].corrections[1].target, CorrectionTarget::Window);
    assert_eq!(reports[1].field, 2);
    assert_eq!(reports[1].corrections[0].offset, 22);
    assert_eq!(nfi.stats().corrected, 3);
    Ok(())
}

#[test]
fn test_read_uncorrectable() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    let data = test_pattern(2048, 0x11);
    let mut oob = vec![0xFF; 64];
    nfi.write_page(3, &data, &mut oob)?;
    nfi.write_page(4, &data, &mut oob)?;

    // One more than T8 can repair
    for offset in 0..9 {
        nfi.bus_mut().inject(3, offset * 50, 0x01);
    }

    let mut data_out = vec![0; 2048];
    let mut oob_out = vec![0; 64];
    assert!(matches!(
        nfi.read_page(3, &mut data_out, &mut oob_out),
        Err(NandError::Uncorrectable { page: 3, field: 1 })
    ));
    assert_eq!(nfi.stats().failed, 1);
    assert_eq!(nfi.stats().corrected, 0);
    assert_eq!(nfi.dma_state(), DmaState::Idle);
    assert_eq!(nfi.bus_mut().read32(REG_SMISR) & SMISR_DMA_DONE, 0);

    // The engine recovers for the next page
    let reports = nfi.read_page(4, &mut data_out, &mut oob_out)?;
    assert!(reports.is_empty());
    assert_eq!(data_out, data);
    Ok(())
}

#[test]
fn test_erased_page_reads_clean() -> anyhow::Result<()> {
    use crate::nand::PageUtil;
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    let mut data = vec![0; 2048];
    let mut oob = vec![0; 64];
    assert!(nfi.read_page(500, &mut data, &mut oob)?.is_empty());
    assert!(data.is_erased());
    assert!(oob.is_erased());
    Ok(())
}

#[test]
fn test_no_ecc() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    // Strap pins all low: no ECC, 2 KiB pages
    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.set_power_on(0, 0x00);
    let mut nfi = test_controller(sim)?;
    assert!(!nfi.geometry().ecc_enabled());
    assert_eq!(nfi.geometry().oob_size, 8);
    assert_eq!(
        nfi.bus_mut().read32(REG_SMCSR) & (SMCSR_ECC_EN | SMCSR_ECC_CHK),
        0
    );

    let data = test_pattern(2048, 9);
    let mut oob = vec![0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3, 4];
    nfi.write_page(0, &data, &mut oob)?;
    nfi.bus_mut().inject(0, 5, 0x80);

    let mut data_out = vec![0; 2048];
    let mut oob_out = vec![0; 8];
    assert!(nfi.read_page(0, &mut data_out, &mut oob_out)?.is_empty());
    assert_eq!(oob_out, [0xFF, 0xFF, 0x00, 0x00, 1, 2, 3, 4]);
    assert_eq!(data_out[5], data[5] ^ 0x80);
    Ok(())
}

#[test]
fn test_erase_and_failures() -> anyhow::Result<()> {
    use crate::nand::PageUtil;
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    let data = test_pattern(2048, 5);
    let mut oob = vec![0xFF; 64];
    nfi.write_page(64, &data, &mut oob)?;
    nfi.erase_block(1)?;
    assert!(nfi.bus().raw_page(64).is_erased());

    nfi.bus_mut().fail_block(2);
    assert!(matches!(
        nfi.erase_block(2),
        Err(NandError::EraseFailed(2))
    ));
    assert!(matches!(
        nfi.write_page(130, &data, &mut oob),
        Err(NandError::ProgramFailed(130))
    ));
    assert!(matches!(
        nfi.erase_block(1024),
        Err(NandError::OutOfRange {
            what: "block",
            index: 1024
        })
    ));
    Ok(())
}

#[test]
fn test_buffer_checks() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    let mut oob = vec![0xFF; 64];
    assert!(matches!(
        nfi.write_page(0, &[0; 512], &mut oob),
        Err(NandError::BufferSize {
            what: "page",
            expected: 2048,
            found: 512
        })
    ));
    assert!(matches!(
        nfi.write_page(65536, &[0; 2048], &mut oob),
        Err(NandError::OutOfRange { what: "page", .. })
    ));
    assert!(matches!(
        nfi.read_oob(0, &mut [0; 16]),
        Err(NandError::BufferSize { what: "oob", .. })
    ));
    Ok(())
}

#[test]
fn test_bad_block_markers() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.set_factory_bad(3);
    let mut nfi = test_controller(sim)?;

    assert!(nfi.is_bad(3)?);
    assert!(!nfi.is_bad(4)?);
    nfi.mark_bad(4)?;
    assert!(nfi.is_bad(4)?);
    assert_eq!(nfi.bus().raw_page(4 * 64)[2048..2050], [0x00, 0x00]);
    Ok(())
}

#[test]
fn test_address_framing() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    // 128 MiB: two row cycles
    let mut nfi = test_controller(SimNfi::new(SimChip::K9F1G08))?;
    let mut oob = vec![0; 64];
    nfi.bus_mut().clear_log();
    nfi.read_oob(0x1234, &mut oob)?;
    assert_eq!(nfi.bus().commands(), [0x00, 0x30]);
    assert_eq!(
        nfi.bus().addresses(),
        [0x00, 0x08, 0x34, 0x12 | SMADDR_ENDADDR]
    );

    nfi.bus_mut().clear_log();
    nfi.erase_block(3)?;
    assert_eq!(nfi.bus().commands(), [0x60, 0xD0, 0x70]);
    assert_eq!(nfi.bus().addresses(), [0xC0, SMADDR_ENDADDR]);

    // 512 MiB: three row cycles
    let mut nfi = test_controller(SimNfi::new(SimChip::TC58NVG2S0F))?;
    let mut oob = vec![0; 224];
    nfi.bus_mut().clear_log();
    nfi.read_oob(0x12345, &mut oob)?;
    assert_eq!(
        nfi.bus().addresses(),
        [0x00, 0x10, 0x45, 0x23, 0x01 | SMADDR_ENDADDR]
    );
    Ok(())
}

#[test]
fn test_id_and_reset() -> anyhow::Result<()> {
    use sim::{SimChip, SimNfi};

    let mut nfi = test_controller(SimNfi::new(SimChip::TC58NVG2S0F))?;
    nfi.bus_mut().clear_log();
    assert_eq!(nfi.read_id()?, SimChip::TC58NVG2S0F.id);
    assert_eq!(nfi.bus().addresses(), [SMADDR_ENDADDR]);

    nfi.bus_mut().clear_log();
    nfi.reset()?;
    assert_eq!(nfi.bus().commands(), [0xFF, 0x70, 0xFF]);
    assert!(nfi.bus().addresses().is_empty());
    Ok(())
}

#[test]
fn test_command_codes() {
    for command in Command::ALL {
        assert_eq!(Command::from_code(command.code()), Some(command));
    }
    assert_eq!(Command::from_code(0x42), None);
}
