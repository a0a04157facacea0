//! Placement of free bytes within the OOB area.
//!
//! ```text
//! 0      4                              oob_size - eccbytes       oob_size
//! +------+----------------------------------+------------------------+
//! | BBM  |        free (user metadata)       |     BCH parity codes    |
//! +------+----------------------------------+------------------------+
//! ```
//!
//! Bytes 0-1 hold the bad block marker and bytes 2-3 the "page written" marker; neither is ever
//! handed out as free space.

/// Bytes reserved at the start of the OOB area
pub const OOB_RESERVED: usize = 4;

/// A contiguous region of the OOB area
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OobRegion {
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OobLayout {
    /// Total parity bytes stored for a page
    pub eccbytes: usize,

    /// The free region, always starting right after the reserved bytes
    pub free: OobRegion,

    /// Number of free bytes available to the user
    pub available: usize,
}

impl OobLayout {
    /// Lay out an OOB area of `oob_size` bytes holding `eccbytes` of parity.
    ///
    /// Returns `None` if the parity and reserved bytes do not fit.
    pub fn compute(oob_size: usize, eccbytes: usize) -> Option<Self> {
        let length = oob_size.checked_sub(eccbytes)?.checked_sub(OOB_RESERVED)?;

        Some(Self {
            eccbytes,
            free: OobRegion {
                offset: OOB_RESERVED,
                length,
            },
            available: length,
        })
    }

    /// Offset of the first parity byte
    pub fn ecc_offset(&self) -> usize {
        self.free.offset + self.free.length
    }
}

#[test]
fn test_compute() {
    let layout = OobLayout::compute(64, 60).unwrap();
    assert_eq!(layout.free, OobRegion { offset: 4, length: 0 });
    assert_eq!(layout.available, 0);
    assert_eq!(layout.ecc_offset(), 4);

    let layout = OobLayout::compute(224, 120).unwrap();
    assert_eq!(layout.free, OobRegion { offset: 4, length: 100 });
    assert_eq!(layout.ecc_offset(), 104);

    assert_eq!(OobLayout::compute(64, 92), None);
    assert_eq!(OobLayout::compute(3, 0), None);
}

#[test]
fn test_compute_is_pure() {
    for (oob, ecc) in [(64, 60), (100, 92), (376, 368), (8, 0)] {
        assert_eq!(OobLayout::compute(oob, ecc), OobLayout::compute(oob, ecc));
    }
}
