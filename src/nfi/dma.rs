//! The NFI's DMA engine, driven as a small state machine:
//!
//! ```text
//! Idle -> ResetRequested -> Armed -> Running -> Completed -> Idle
//!                                           \-> Aborted   -/
//! ```
//!
//! Every step is observed by polling; the engine never raises an interrupt in this driver.

use super::bch::{self, ErrorReport};
use super::regs::*;
use super::Poll;
use crate::error::{NandError, Result};
use crate::geometry::{BchStrength, NandGeometry};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum DmaState {
    #[default]
    Idle,
    ResetRequested,
    Armed,
    Running,
    Completed,
    Aborted,
}

/// ECC outcome counters, kept across transfers
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EccStats {
    /// Bytes repaired by the syndrome decoder
    pub corrected: u64,

    /// Page reads lost to uncorrectable fields
    pub failed: u64,
}

/// What the engine must be configured with before a transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaSetup {
    pub strength: BchStrength,

    /// Bytes of the SMRA window taking part in the transfer
    pub redundant_len: usize,
}

#[derive(Debug, Default)]
pub struct DmaController {
    state: DmaState,
    poll: Poll,
}

impl DmaController {
    pub fn new(poll: Poll) -> Self {
        Self {
            state: DmaState::Idle,
            poll,
        }
    }

    pub fn state(&self) -> DmaState {
        self.state
    }

    fn expect(&self, expected: DmaState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NandError::DmaState {
                expected,
                found: self.state,
            })
        }
    }

    /// Wait for the engine to go idle, then reset it
    pub fn reset<B: NfiBus>(&mut self, bus: &mut B) -> Result<()> {
        self.expect(DmaState::Idle)?;
        self.state = DmaState::ResetRequested;

        self.poll.until(bus, "DMA engine idle", |bus| {
            bus.read32(REG_DMACCSR) & DMACCSR_BUSY == 0
        })?;
        bus.modify32(REG_DMACCSR, |v| v | DMACCSR_EN | DMACCSR_SWRST);
        self.poll.until(bus, "DMA engine reset", |bus| {
            bus.read32(REG_DMACCSR) & DMACCSR_SWRST == 0
        })
    }

    /// Program everything a transfer of `buf` needs, short of starting it
    pub fn arm<B: NfiBus>(&mut self, bus: &mut B, buf: &[u8], setup: &DmaSetup) -> Result<()> {
        self.expect(DmaState::ResetRequested)?;

        bus.write32(REG_SMISR, SMISR_DMA_DONE);
        bus.modify32(REG_SMIER, |v| v & !SMIER_DMA_IE);

        let addr = bus.dma_address(buf);
        bus.write32(REG_DMACSAR, addr);
        bus.write32(REG_DMACIER, DMACIER_TABORT);
        bus.write32(REG_SMISR, SMISR_RB0_EDGE);

        match setup.strength.smcsr_bits() {
            Some(bits) => {
                bus.modify32(REG_SMCSR, |v| (v & !SMCSR_BCH_MASK) | bits);
                bus.modify32(REG_SMCSR, |v| v | SMCSR_ECC_EN | SMCSR_ECC_CHK);
            }
            None => bus.modify32(REG_SMCSR, |v| v & !(SMCSR_ECC_EN | SMCSR_ECC_CHK)),
        }

        bus.write32(REG_SMREACTL, setup.redundant_len as u32);
        bus.modify32(REG_SMIER, |v| v & !SMIER_ECC_FIELD_IE);
        bus.write32(REG_SMISR, SMISR_ECC_FIELD);
        bus.modify32(REG_SMCSR, |v| (v & !SMCSR_CS_MASK) | SMCSR_CS0);

        self.state = DmaState::Armed;
        Ok(())
    }

    /// Program `data` (plus the SMRA window) and wait for the engine to finish
    pub fn run_write<B: NfiBus>(&mut self, bus: &mut B, data: &[u8]) -> Result<()> {
        self.expect(DmaState::Armed)?;
        self.state = DmaState::Running;

        // Mark the page as written
        for marker in [REG_SMRA0 + 3, REG_SMRA0 + 2] {
            if bus.read8(marker) == ERASED {
                bus.write8(marker, 0);
            }
        }

        bus.modify32(REG_SMCSR, |v| v | SMCSR_DWR_EN);
        bus.dma_sync(DmaSync::ToDevice(data));
        self.poll.until(bus, "DMA write", |bus| {
            bus.read32(REG_SMISR) & SMISR_DMA_DONE != 0
        })?;

        self.state = DmaState::Completed;
        Ok(())
    }

    /// Read a page into `data`, repairing fields as the engine reports them
    pub fn run_read<B: NfiBus>(
        &mut self,
        bus: &mut B,
        data: &mut [u8],
        geometry: &NandGeometry,
        stats: &mut EccStats,
        page: u32,
    ) -> Result<Vec<ErrorReport>> {
        self.expect(DmaState::Armed)?;
        self.state = DmaState::Running;

        bus.modify32(REG_SMCSR, |v| v | SMCSR_DRD_EN);
        bus.dma_sync(DmaSync::FromDevice(data));

        if bus.read32(REG_SMCSR) & SMCSR_ECC_CHK == 0 {
            self.poll.until(bus, "DMA read", |bus| {
                bus.read32(REG_SMISR) & SMISR_DMA_DONE != 0
            })?;
            self.state = DmaState::Completed;
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        let mut spins = 0;
        loop {
            if bus.read32(REG_SMISR) & SMISR_ECC_FIELD != 0 {
                match bch::correct(bus, geometry, data) {
                    Ok(fixed) => {
                        stats.corrected += fixed
                            .iter()
                            .map(|report| report.corrections.len() as u64)
                            .sum::<u64>();
                        bus.write32(REG_SMISR, SMISR_ECC_FIELD);
                        reports.extend(fixed);
                    }
                    Err(bch::Uncorrectable { field }) => {
                        stats.failed += 1;
                        bus.write32(REG_SMISR, SMISR_ECC_FIELD);
                        bus.write32(REG_DMACCSR, DMACCSR_EN | DMACCSR_SWRST);
                        bus.modify32(REG_SMCSR, |v| v | SMCSR_SWRST);
                        self.state = DmaState::Aborted;
                        log::error!("page {page}: uncorrectable ECC error in field {field}");
                        return Err(NandError::Uncorrectable { page, field });
                    }
                }
            }

            let status = bus.read32(REG_SMISR);
            if status & SMISR_DMA_DONE != 0 && status & SMISR_ECC_FIELD == 0 {
                break;
            }
            self.poll.spin(&mut spins, "DMA read")?;
        }

        self.state = DmaState::Completed;
        Ok(reports)
    }

    /// Clear the finished flag and return to `Idle`
    pub fn finish<B: NfiBus>(&mut self, bus: &mut B) -> Result<()> {
        if !matches!(self.state, DmaState::Completed | DmaState::Aborted) {
            return Err(NandError::DmaState {
                expected: DmaState::Completed,
                found: self.state,
            });
        }

        bus.write32(REG_SMISR, SMISR_DMA_DONE);
        self.state = DmaState::Idle;
        Ok(())
    }

    /// Force the engine and controller back to a known state after a failed step
    fn recover<B: NfiBus>(&mut self, bus: &mut B) {
        log::warn!("resetting DMA engine from {:?}", self.state);
        bus.write32(REG_DMACCSR, DMACCSR_EN | DMACCSR_SWRST);
        bus.modify32(REG_SMCSR, |v| v | SMCSR_SWRST);
        bus.write32(REG_SMISR, SMISR_DMA_DONE | SMISR_ECC_FIELD);
        self.state = DmaState::Idle;
    }

    /// Bring the state machine back to `Idle` however the transfer ended
    fn settle<B: NfiBus, T>(&mut self, bus: &mut B, result: Result<T>) -> Result<T> {
        match self.state {
            DmaState::Idle => (),
            DmaState::Completed | DmaState::Aborted => self.finish(bus)?,
            DmaState::ResetRequested | DmaState::Armed | DmaState::Running => self.recover(bus),
        }
        result
    }

    /// A complete write transfer
    pub fn write<B: NfiBus>(&mut self, bus: &mut B, data: &[u8], setup: &DmaSetup) -> Result<()> {
        self.expect(DmaState::Idle)?;
        let result = self.write_steps(bus, data, setup);
        self.settle(bus, result)
    }

    fn write_steps<B: NfiBus>(&mut self, bus: &mut B, data: &[u8], setup: &DmaSetup) -> Result<()> {
        self.reset(bus)?;
        self.arm(bus, data, setup)?;
        self.run_write(bus, data)
    }

    /// A complete read transfer, with in-place correction
    pub fn read<B: NfiBus>(
        &mut self,
        bus: &mut B,
        data: &mut [u8],
        setup: &DmaSetup,
        geometry: &NandGeometry,
        stats: &mut EccStats,
        page: u32,
    ) -> Result<Vec<ErrorReport>> {
        self.expect(DmaState::Idle)?;
        let result = self.read_steps(bus, data, setup, geometry, stats, page);
        self.settle(bus, result)
    }

    fn read_steps<B: NfiBus>(
        &mut self,
        bus: &mut B,
        data: &mut [u8],
        setup: &DmaSetup,
        geometry: &NandGeometry,
        stats: &mut EccStats,
        page: u32,
    ) -> Result<Vec<ErrorReport>> {
        self.reset(bus)?;
        self.arm(bus, data, setup)?;
        self.run_read(bus, data, geometry, stats, page)
    }
}

#[cfg(test)]
const TEST_POLL: Poll = Poll {
    limit: Some(10_000),
};

#[test]
fn test_state_order() {
    use super::sim::{SimChip, SimNfi};

    let mut bus = SimNfi::new(SimChip::K9F1G08);
    let mut dma = DmaController::new(TEST_POLL);
    let setup = DmaSetup {
        strength: BchStrength::T8,
        redundant_len: 64,
    };
    let buf = [0u8; 2048];

    assert!(matches!(
        dma.arm(&mut bus, &buf, &setup),
        Err(NandError::DmaState {
            expected: DmaState::ResetRequested,
            found: DmaState::Idle
        })
    ));
    assert!(dma.finish(&mut bus).is_err());

    dma.reset(&mut bus).unwrap();
    assert_eq!(dma.state(), DmaState::ResetRequested);
    assert!(dma.reset(&mut bus).is_err());

    dma.arm(&mut bus, &buf, &setup).unwrap();
    assert_eq!(dma.state(), DmaState::Armed);
    assert_eq!(bus.read32(REG_SMREACTL), 64);
    let csr = bus.read32(REG_SMCSR);
    assert_eq!(csr & SMCSR_BCH_MASK, SMCSR_BCH_T8);
    assert_ne!(csr & SMCSR_ECC_EN, 0);
    assert_ne!(csr & SMCSR_ECC_CHK, 0);
    assert_eq!(csr & SMCSR_CS_MASK, SMCSR_CS0);
}

#[test]
fn test_arm_without_ecc() {
    use super::sim::{SimChip, SimNfi};

    let mut bus = SimNfi::new(SimChip::K9F1G08);
    bus.write32(REG_SMCSR, SMCSR_ECC_EN | SMCSR_ECC_CHK);
    let mut dma = DmaController::new(TEST_POLL);
    let setup = DmaSetup {
        strength: BchStrength::None,
        redundant_len: 8,
    };

    dma.reset(&mut bus).unwrap();
    dma.arm(&mut bus, &[0u8; 16], &setup).unwrap();
    assert_eq!(
        bus.read32(REG_SMCSR) & (SMCSR_ECC_EN | SMCSR_ECC_CHK),
        0
    );
}

#[test]
fn test_dirty_marker() {
    use super::sim::{SimChip, SimNfi};

    let mut bus = SimNfi::new(SimChip::K9F1G08);
    let mut dma = DmaController::new(TEST_POLL);
    let setup = DmaSetup {
        strength: BchStrength::T8,
        redundant_len: 64,
    };

    bus.window_mut()[..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x5A]);
    dma.write(&mut bus, &[0xA5; 2048], &setup).unwrap();
    assert_eq!(dma.state(), DmaState::Idle);
    assert_eq!(&bus.window()[..4], [0xFF, 0xFF, 0x00, 0x5A]);
    assert_eq!(bus.read32(REG_SMISR) & SMISR_DMA_DONE, 0);
}

#[test]
fn test_timeout_recovers() {
    use super::sim::{SimChip, SimNfi};

    let mut bus = SimNfi::new(SimChip::K9F1G08);
    bus.hang_dma(true);
    let mut dma = DmaController::new(TEST_POLL);
    let setup = DmaSetup {
        strength: BchStrength::T8,
        redundant_len: 64,
    };

    assert!(matches!(
        dma.write(&mut bus, &[0u8; 2048], &setup),
        Err(NandError::DeviceTimeout("DMA write"))
    ));
    assert_eq!(dma.state(), DmaState::Idle);
}
