//! Host-side staging copy of the controller's redundant area (SMRA) window.
//!
//! The SMRA window is device memory: the controller reads it while programming a page and the
//! syndrome decoder patches it while reading one. The driver never aliases a caller's OOB buffer
//! onto it; bytes move between the two only through [RedundantArea::store] and
//! [RedundantArea::load].

use super::regs::{NfiBus, ERASED, REG_SMRA0};

#[derive(Debug, Clone)]
pub struct RedundantArea {
    buf: Box<[u8]>,
}

impl RedundantArea {
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![ERASED; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Reset every byte to the erased value
    pub fn fill_erased(&mut self) {
        self.buf.fill(ERASED);
    }

    /// Copy `bytes` over the start of the staging buffer
    pub fn overlay(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.buf.len());
        self.buf[..len].copy_from_slice(&bytes[..len]);
    }

    /// Mirror the staging buffer into the device window
    pub fn store<B: NfiBus>(&self, bus: &mut B) {
        for (i, &byte) in self.buf.iter().enumerate() {
            bus.write8(REG_SMRA0 + i, byte);
        }
    }

    /// Mirror the device window into the staging buffer
    pub fn load<B: NfiBus>(&mut self, bus: &mut B) {
        for (i, byte) in self.buf.iter_mut().enumerate() {
            *byte = bus.read8(REG_SMRA0 + i);
        }
    }
}

#[test]
fn test_overlay() {
    let mut area = RedundantArea::new(8);
    area.overlay(&[1, 2, 3]);
    assert_eq!(area.as_slice(), [1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

    area.overlay(&[9; 12]);
    assert_eq!(area.as_slice(), [9; 8]);

    area.fill_erased();
    assert_eq!(area.as_slice(), [0xFF; 8]);
}

#[test]
fn test_store_load() {
    use super::sim::{SimChip, SimNfi};

    let mut bus = SimNfi::new(SimChip::K9F1G08);
    let mut area = RedundantArea::new(64);
    area.overlay(&[0x12, 0x34, 0x56]);
    area.store(&mut bus);
    assert_eq!(&bus.window()[..4], [0x12, 0x34, 0x56, 0xFF]);

    bus.window_mut()[1] = 0x00;
    area.load(&mut bus);
    assert_eq!(&area.as_slice()[..3], [0x12, 0x00, 0x56]);
}
