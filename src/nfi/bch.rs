//! Decoding of the BCH engine's per-field error reports.
//!
//! When a field fails its parity check the controller raises the field-ECC flag, sets that
//! field's byte in the `SMECC_ST` words, and latches the error byte addresses and XOR values in
//! the `BCH_ECC_ADDR`/`BCH_ECC_DATA` registers. Error addresses are offsets into the field's
//! codeword as the engine sees it:
//!
//! ```text
//! 0            field_len   +3                         field_len + padding_len
//! +-------------+-----------+-------------+---------------------+
//! | field data  | 3 metadata |   (unused)   |     parity code      |
//! +-------------+-----------+-------------+---------------------+
//!                |<------------------ padding_len ------------------>|
//! ```
//!
//! Data errors are fixed in the caller's page buffer; metadata and parity errors are fixed in the
//! SMRA window, where the read path picks them up.

use super::regs::{
    NfiBus, BCH_ECC_ADDR_COUNT, BCH_ECC_ADDR_MASK, BCH_ECC_DATA_COUNT, REG_BCH_ECC_ADDR0,
    REG_BCH_ECC_DATA0, REG_SMECC_ST0, REG_SMRA0, REG_SMREACTL, SMECC_ST_COUNT,
    SMREACTL_SIZE_MASK,
};
use crate::geometry::NandGeometry;

/// Number of metadata bytes each field protects
pub const FIELD_META_LEN: usize = 3;

/// Most errors the syndrome registers can describe at once
pub const MAX_SYNDROMES: usize = BCH_ECC_DATA_COUNT * 4;

/// The status a field reports in its `SMECC_ST` byte
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldStatus {
    Clean,
    Correctable(usize),
    Uncorrectable,
}

impl FieldStatus {
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x03 {
            0b00 => Self::Clean,
            0b01 => Self::Correctable(((byte >> 2) & 0x1F) as usize),
            _ => Self::Uncorrectable,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Clean => 0b00,
            Self::Correctable(count) => 0b01 | ((count as u8 & 0x1F) << 2),
            Self::Uncorrectable => 0b10,
        }
    }
}

/// Where a correction landed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CorrectionTarget {
    /// The page data buffer
    Data,

    /// The SMRA window
    Window,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Correction {
    pub target: CorrectionTarget,
    pub offset: usize,
    pub value: u8,
}

/// Corrections applied to one field
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorReport {
    /// 1-based field index
    pub field: usize,
    pub error_count: usize,
    pub corrections: Vec<Correction>,
}

/// A field the engine could not repair; the whole page is lost
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Uncorrectable {
    pub field: usize,
}

/// The latched error addresses and values, in report order
struct Syndrome {
    addrs: [u16; MAX_SYNDROMES],
    values: [u8; MAX_SYNDROMES],
}

impl Syndrome {
    fn read<B: NfiBus>(bus: &mut B, count: usize) -> Self {
        let mut syndrome = Self {
            addrs: [0; MAX_SYNDROMES],
            values: [0; MAX_SYNDROMES],
        };

        let data_regs = std::cmp::min(count / 4 + 1, BCH_ECC_DATA_COUNT);
        for reg in 0..data_regs {
            let word = bus.read32(REG_BCH_ECC_DATA0 + reg * 4);
            syndrome.values[reg * 4..][..4].copy_from_slice(&word.to_le_bytes());
        }

        let addr_regs = std::cmp::min(count / 2 + 1, BCH_ECC_ADDR_COUNT);
        for reg in 0..addr_regs {
            let word = bus.read32(REG_BCH_ECC_ADDR0 + reg * 4);
            syndrome.addrs[reg * 2] = (word & BCH_ECC_ADDR_MASK) as u16;
            syndrome.addrs[reg * 2 + 1] = ((word >> 16) & BCH_ECC_ADDR_MASK) as u16;
        }

        syndrome
    }
}

/// Map an engine error address to the byte it must be applied to.
///
/// `parity_base` is the window offset of the first field's parity code. Returns `None` for
/// addresses in the unused part of the padding.
pub fn locate(
    geometry: &NandGeometry,
    field: usize,
    address: usize,
    parity_base: usize,
) -> Option<Correction> {
    let field_len = geometry.field_len();
    let parity_len = geometry.parity_len();
    let index = field.checked_sub(1)?;

    let (target, offset) = if address < field_len {
        (CorrectionTarget::Data, index * field_len + address)
    } else if address < field_len + FIELD_META_LEN {
        (
            CorrectionTarget::Window,
            address - field_len + parity_len * index,
        )
    } else {
        // The last parity byte sits at field_len + padding_len - 1
        let first_parity = field_len + geometry.padding_len() - parity_len;
        let within = address.checked_sub(first_parity)?;
        if within >= parity_len {
            return None;
        }
        (
            CorrectionTarget::Window,
            parity_base + parity_len * index + within,
        )
    };

    Some(Correction {
        target,
        offset,
        value: 0,
    })
}

/// Work out every correction for one field, without touching anything
fn plan_field<B: NfiBus>(
    bus: &mut B,
    geometry: &NandGeometry,
    field: usize,
    error_count: usize,
    data_len: usize,
) -> Result<ErrorReport, Uncorrectable> {
    let fail = Uncorrectable { field };

    if error_count > MAX_SYNDROMES {
        log::error!("field {field} reports {error_count} errors, more than can be latched");
        return Err(fail);
    }

    let syndrome = Syndrome::read(bus, error_count);
    let window_len = (bus.read32(REG_SMREACTL) & SMREACTL_SIZE_MASK) as usize;
    let parity_base = window_len
        .checked_sub(geometry.eccbytes())
        .ok_or(fail)?;

    let mut corrections = Vec::with_capacity(error_count);
    for i in 0..error_count {
        let address = syndrome.addrs[i] as usize;
        let mut correction = locate(geometry, field, address, parity_base).ok_or_else(|| {
            log::error!("field {field}: error address {address} is not in the codeword");
            fail
        })?;
        correction.value = syndrome.values[i];

        let limit = match correction.target {
            CorrectionTarget::Data => data_len,
            CorrectionTarget::Window => window_len,
        };
        if correction.offset >= limit {
            log::error!(
                "field {field}: correction at {:?}+{} is out of bounds",
                correction.target,
                correction.offset
            );
            return Err(fail);
        }

        corrections.push(correction);
    }

    Ok(ErrorReport {
        field,
        error_count,
        corrections,
    })
}

fn apply<B: NfiBus>(bus: &mut B, data: &mut [u8], report: &ErrorReport) {
    for correction in &report.corrections {
        log::debug!(
            "field {}: fixing {:?}+{} ^ {:#04x}",
            report.field,
            correction.target,
            correction.offset,
            correction.value
        );
        match correction.target {
            CorrectionTarget::Data => data[correction.offset] ^= correction.value,
            CorrectionTarget::Window => {
                let addr = REG_SMRA0 + correction.offset;
                let byte = bus.read8(addr);
                bus.write8(addr, byte ^ correction.value);
            }
        }
    }
}

/// Scan the field status words and repair every correctable field in place.
///
/// Nothing is modified unless every reported field can be corrected.
pub fn correct<B: NfiBus>(
    bus: &mut B,
    geometry: &NandGeometry,
    data: &mut [u8],
) -> Result<Vec<ErrorReport>, Uncorrectable> {
    let fields = geometry.total_field_count();
    let words = std::cmp::min(fields.div_ceil(4), SMECC_ST_COUNT);

    let mut reports = Vec::new();
    for word in 0..words {
        let status = bus.read32(REG_SMECC_ST0 + word * 4);
        if status == 0 {
            continue;
        }

        for (slot, byte) in status.to_le_bytes().into_iter().enumerate() {
            let field = word * 4 + slot + 1;
            if field > fields {
                break;
            }

            match FieldStatus::from_byte(byte) {
                FieldStatus::Clean => (),
                FieldStatus::Correctable(count) => {
                    reports.push(plan_field(bus, geometry, field, count, data.len())?)
                }
                FieldStatus::Uncorrectable => {
                    log::error!("field {field} is uncorrectable");
                    return Err(Uncorrectable { field });
                }
            }
        }
    }

    for report in &reports {
        apply(bus, data, report);
    }

    Ok(reports)
}

#[cfg(test)]
fn test_setup() -> (super::sim::SimNfi, NandGeometry, Vec<u8>) {
    use super::sim::{SimChip, SimNfi};
    use crate::geometry::{BchStrength, PageSize};

    let mut bus = SimNfi::new(SimChip::K9F1G08);
    bus.write32(REG_SMREACTL, 64);
    for (i, byte) in bus.window_mut()[..64].iter_mut().enumerate() {
        *byte = i as u8;
    }
    let geometry = NandGeometry::new(PageSize::P2048, 64, BchStrength::T8).unwrap();
    let data: Vec<u8> = (0..2048).map(|i| (i * 7) as u8).collect();
    (bus, geometry, data)
}

#[test]
fn test_locate() {
    use crate::geometry::{BchStrength, PageSize};

    let t12 = NandGeometry::new(PageSize::P4096, 224, BchStrength::T12).unwrap();
    let base = 224 - 184;
    let at = |field, address| locate(&t12, field, address, base).map(|c| (c.target, c.offset));

    assert_eq!(at(1, 0), Some((CorrectionTarget::Data, 0)));
    assert_eq!(at(3, 511), Some((CorrectionTarget::Data, 2 * 512 + 511)));
    assert_eq!(at(1, 512), Some((CorrectionTarget::Window, 0)));
    assert_eq!(at(2, 514), Some((CorrectionTarget::Window, 23 + 2)));
    // First parity byte is 512 + 32 - 23 = 521
    assert_eq!(at(1, 521), Some((CorrectionTarget::Window, base)));
    assert_eq!(at(4, 543), Some((CorrectionTarget::Window, base + 3 * 23 + 22)));
    assert_eq!(at(1, 515), None);
    assert_eq!(at(1, 544), None);
    assert_eq!(at(0, 0), None);
}

#[test]
fn test_correct_single_data_error() {
    let (mut bus, geometry, original) = test_setup();
    let window = bus.window().to_vec();
    let mut data = original.clone();
    data[512 + 100] ^= 0x10;

    bus.present_field(2, FieldStatus::Correctable(1), &[(100, 0x10)]);
    let reports = correct(&mut bus, &geometry, &mut data).unwrap();

    assert_eq!(data, original);
    assert_eq!(bus.window(), window);
    assert_eq!(
        reports,
        [ErrorReport {
            field: 2,
            error_count: 1,
            corrections: vec![Correction {
                target: CorrectionTarget::Data,
                offset: 612,
                value: 0x10
            }],
        }]
    );
}

#[test]
fn test_correct_metadata_and_parity() {
    let (mut bus, geometry, original) = test_setup();
    let window = bus.window().to_vec();
    let mut data = original.clone();

    // Field 3: metadata byte 1 is at 15 * 2 + 1, parity byte 2 is at 4 + 15 * 2 + 2
    bus.window_mut()[31] ^= 0x81;
    bus.window_mut()[36] ^= 0x04;
    data[1024 + 100] ^= 0x01;
    bus.present_field(
        3,
        FieldStatus::Correctable(3),
        &[(513, 0x81), (531, 0x04), (100, 0x01)],
    );
    let reports = correct(&mut bus, &geometry, &mut data).unwrap();

    assert_eq!(data, original);
    assert_eq!(bus.window(), window);
    assert_eq!(reports[0].error_count, 3);
    assert_eq!(
        reports[0].corrections[1],
        Correction {
            target: CorrectionTarget::Window,
            offset: 36,
            value: 0x04
        }
    );
}

#[test]
fn test_padding_address_is_uncorrectable() {
    let (mut bus, geometry, original) = test_setup();
    let mut data = original.clone();

    bus.present_field(1, FieldStatus::Correctable(2), &[(7, 0x01), (515, 0x01)]);
    assert_eq!(
        correct(&mut bus, &geometry, &mut data),
        Err(Uncorrectable { field: 1 })
    );
    assert_eq!(data, original);
}

#[test]
fn test_uncorrectable_applies_nothing() {
    let (mut bus, geometry, original) = test_setup();
    let window = bus.window().to_vec();
    let mut data = original.clone();

    bus.present_field(1, FieldStatus::Correctable(1), &[(0, 0xFF)]);
    bus.present_extra_status(2, FieldStatus::Uncorrectable);
    assert_eq!(
        correct(&mut bus, &geometry, &mut data),
        Err(Uncorrectable { field: 2 })
    );
    assert_eq!(data, original);
    assert_eq!(bus.window(), window);
}

#[test]
fn test_too_many_errors() {
    let (mut bus, geometry, original) = test_setup();
    let mut data = original.clone();

    bus.present_field(4, FieldStatus::Correctable(25), &[]);
    assert_eq!(
        correct(&mut bus, &geometry, &mut data),
        Err(Uncorrectable { field: 4 })
    );
    assert_eq!(data, original);
}

#[test]
fn test_status_byte() {
    for status in [
        FieldStatus::Clean,
        FieldStatus::Correctable(0),
        FieldStatus::Correctable(24),
        FieldStatus::Uncorrectable,
    ] {
        assert_eq!(FieldStatus::from_byte(status.to_byte()), status);
    }
    assert_eq!(FieldStatus::from_byte(0xFF), FieldStatus::Uncorrectable);
}
