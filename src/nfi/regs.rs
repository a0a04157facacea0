//! Register map of the NAND Flash Interface (NFI), and the bus abstraction used to reach it.
//!
//! Offsets and bit positions here are fixed by the silicon; everything else in the driver goes
//! through [NfiBus] so that it can run against real MMIO or against [super::sim::SimNfi].

use std::sync::atomic::{fence, Ordering};

/* SYS power-on setting words */
pub const REG_SYS_PWRONOTP: usize = 0x004;
pub const REG_SYS_PWRONPIN: usize = 0x008;

/* DMA controller */
pub const REG_DMACCSR: usize = 0x400;
pub const REG_DMACSAR: usize = 0x408;
pub const REG_DMACBCR: usize = 0x40C;
pub const REG_DMACIER: usize = 0x410;
pub const REG_DMACISR: usize = 0x414;

pub const DMACCSR_EN: u32 = 1 << 0;
pub const DMACCSR_SWRST: u32 = 1 << 1;
pub const DMACCSR_BUSY: u32 = 1 << 9;

/// Target-abort interrupt generation during a DMA transfer
pub const DMACIER_TABORT: u32 = 1 << 0;

/* Global control */
pub const REG_FMICSR: usize = 0x800;
pub const FMICSR_NAND_EN: u32 = 0x08;

/* NAND control and ports */
pub const REG_SMCSR: usize = 0x8A0;
pub const REG_SMTCR: usize = 0x8A4;
pub const REG_SMIER: usize = 0x8A8;
pub const REG_SMISR: usize = 0x8AC;
pub const REG_SMCMD: usize = 0x8B0;
pub const REG_SMADDR: usize = 0x8B4;
pub const REG_SMDATA: usize = 0x8B8;
pub const REG_SMREACTL: usize = 0x8BC;
pub const REG_NFECR: usize = 0x8C0;

pub const SMCSR_SWRST: u32 = 1 << 0;
pub const SMCSR_DRD_EN: u32 = 1 << 1;
pub const SMCSR_DWR_EN: u32 = 1 << 2;
pub const SMCSR_REDUN_AUTO_WEN: u32 = 1 << 4;
pub const SMCSR_ECC_CHK: u32 = 1 << 7;
pub const SMCSR_PROT_3BEN: u32 = 1 << 8;
pub const SMCSR_PSIZE_MASK: u32 = 0x3 << 16;
pub const SMCSR_BCH_MASK: u32 = 0x1F << 18;
pub const SMCSR_BCH_T24: u32 = 0x0004_0000;
pub const SMCSR_BCH_T8: u32 = 0x0010_0000;
pub const SMCSR_BCH_T12: u32 = 0x0020_0000;
pub const SMCSR_ECC_EN: u32 = 1 << 23;
pub const SMCSR_CS_MASK: u32 = 0x3 << 25;
/// Drives CS0 active (CS1 inactive)
pub const SMCSR_CS0: u32 = 0x0400_0000;

pub const SMIER_DMA_IE: u32 = 1 << 0;
pub const SMIER_ECC_FIELD_IE: u32 = 1 << 2;

pub const SMISR_DMA_DONE: u32 = 1 << 0;
pub const SMISR_ECC_FIELD: u32 = 1 << 2;
pub const SMISR_RB0_EDGE: u32 = 1 << 10;
pub const SMISR_RB0: u32 = 1 << 18;

/// Tags the final address byte of an address phase
pub const SMADDR_ENDADDR: u32 = 1 << 31;

pub const SMREACTL_SIZE_MASK: u32 = 0x1FF;

pub const NFECR_WP_UNLOCK: u32 = 1 << 0;

/// Default timing word programmed at bring-up
pub const SMTCR_DEFAULT: u32 = 0x0002_0305;

/* ECC status and syndromes */
pub const REG_SMECC_ST0: usize = 0x8D0;
pub const SMECC_ST_COUNT: usize = 4;
pub const REG_BCH_ECC_ADDR0: usize = 0x900;
pub const BCH_ECC_ADDR_COUNT: usize = 12;
pub const REG_BCH_ECC_DATA0: usize = 0x960;
pub const BCH_ECC_DATA_COUNT: usize = 6;

/// 11 bits of error address per half-word
pub const BCH_ECC_ADDR_MASK: u32 = 0x07FF;

/* Redundant area window */
pub const REG_SMRA0: usize = 0xA00;
/// Bytes available in the SMRA window (118 words)
pub const SMRA_WINDOW_LEN: usize = 472;

/// The erased state of every flash byte
pub const ERASED: u8 = 0xFF;

/// Direction of a DMA transfer, as seen from memory
#[derive(Debug)]
pub enum DmaSync<'a> {
    /// The engine reads `buf` and programs it into flash
    ToDevice(&'a [u8]),

    /// The engine fills `buf` from flash
    FromDevice(&'a mut [u8]),
}

/// Access to the NFI register file.
///
/// Reads take `&mut self` because several ports (the data port in particular) have side effects.
pub trait NfiBus {
    fn read32(&mut self, offset: usize) -> u32;
    fn write32(&mut self, offset: usize, value: u32);
    fn read8(&mut self, offset: usize) -> u8;
    fn write8(&mut self, offset: usize, value: u8);

    /// The address the DMA engine should use for `buf`
    fn dma_address(&mut self, buf: &[u8]) -> u32;

    /// Called once a DMA start bit has been set, before completion is polled.
    fn dma_sync(&mut self, buf: DmaSync<'_>);

    /// Short fixed delay used by a few command classes
    fn delay_ns(&mut self, ns: u32) {
        for _ in 0..ns {
            std::hint::spin_loop();
        }
    }

    /// Read-modify-write helper
    fn modify32(&mut self, offset: usize, f: impl FnOnce(u32) -> u32)
    where
        Self: Sized,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }
}

/// An [NfiBus] over a memory-mapped register block.
///
/// DMA addresses are the buffer's own address, so this is only usable where memory is
/// identity-mapped and DMA-coherent (e.g. early boot with caches off).
#[derive(Debug)]
pub struct MmioBus {
    base: usize,
    len: usize,
}

impl MmioBus {
    /// # Safety
    ///
    /// `base..base + len` must be the mapped NFI (or SYS) register block, and no other code may
    /// access it for the lifetime of this value.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    fn addr(&self, offset: usize, width: usize) -> usize {
        assert!(offset + width <= self.len, "register {offset:#x} outside block");
        self.base + offset
    }
}

impl NfiBus for MmioBus {
    fn read32(&mut self, offset: usize) -> u32 {
        // SAFETY: the constructor's contract covers every in-bounds offset
        unsafe { core::ptr::read_volatile(self.addr(offset, 4) as *const u32) }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        // SAFETY: see read32
        unsafe { core::ptr::write_volatile(self.addr(offset, 4) as *mut u32, value) }
    }

    fn read8(&mut self, offset: usize) -> u8 {
        // SAFETY: see read32
        unsafe { core::ptr::read_volatile(self.addr(offset, 1) as *const u8) }
    }

    fn write8(&mut self, offset: usize, value: u8) {
        // SAFETY: see read32
        unsafe { core::ptr::write_volatile(self.addr(offset, 1) as *mut u8, value) }
    }

    fn dma_address(&mut self, buf: &[u8]) -> u32 {
        buf.as_ptr() as usize as u32
    }

    fn dma_sync(&mut self, _buf: DmaSync<'_>) {
        fence(Ordering::SeqCst);
    }
}

/// Source of the power-on setting words
pub trait PowerOnSource {
    /// The OTP copy of the power-on setting; bit 0 set means it is programmed
    fn otp_word(&mut self) -> u32;

    /// The strap-pin copy, in pin-register bit positions
    fn pin_word(&mut self) -> u32;
}

impl PowerOnSource for MmioBus {
    fn otp_word(&mut self) -> u32 {
        self.read32(REG_SYS_PWRONOTP)
    }

    fn pin_word(&mut self) -> u32 {
        self.read32(REG_SYS_PWRONPIN)
    }
}

#[test]
fn test_mmio_bus() {
    // Ordinary memory stands in for the register block
    let mut block = vec![0u32; 0x400];
    let len = block.len() * 4;
    let mut bus = unsafe { MmioBus::new(block.as_mut_ptr() as usize, len) };

    bus.write32(REG_SMTCR, SMTCR_DEFAULT);
    assert_eq!(bus.read32(REG_SMTCR), SMTCR_DEFAULT);
    bus.modify32(REG_SMCSR, |v| v | SMCSR_SWRST);
    assert_eq!(bus.read32(REG_SMCSR), SMCSR_SWRST);

    bus.write8(REG_SMRA0 + 1, 0xA5);
    assert_eq!(bus.read8(REG_SMRA0 + 1), 0xA5);
    assert_eq!(bus.read32(REG_SMRA0), 0xA5 << 8);

    drop(bus);
    assert_eq!(block[REG_SMTCR / 4], SMTCR_DEFAULT);
}

#[test]
#[should_panic(expected = "outside block")]
fn test_mmio_bus_bounds() {
    let mut block = vec![0u32; 4];
    let mut bus = unsafe { MmioBus::new(block.as_mut_ptr() as usize, 16) };
    bus.read32(REG_SMCSR);
}
