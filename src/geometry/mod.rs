//! Flash geometry and ECC policy.
//!
//! The controller supports 2/4/8 KiB pages with BCH T8, T12 or T24. The probed page size picks a
//! default strength, and the power-on setting (OTP, or strap pins when the OTP is blank) may
//! override the strength, the page size, or both. All of the rules are tables so they can be
//! checked without touching hardware.

pub mod ident;
pub mod layout;

use thiserror::Error;

use crate::nfi::regs::{
    PowerOnSource, SMCSR_BCH_T12, SMCSR_BCH_T24, SMCSR_BCH_T8, SMRA_WINDOW_LEN,
};
use layout::OobLayout;

/// Bytes added to the parity budget when the power-on setting dictates the OOB size
const OOB_OVERRIDE_SLACK: usize = 8;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum GeometryError {
    #[error("the controller does not support {page_size}-byte pages (oob {oob_size})")]
    UnsupportedPageSize { page_size: usize, oob_size: usize },

    #[error("{page_size}-byte pages are not a whole number of {field_len}-byte ECC fields")]
    FieldMismatch { page_size: usize, field_len: usize },

    #[error("{oob_size}-byte OOB cannot hold {eccbytes} parity bytes and the bad block marker")]
    OobTooSmall { oob_size: usize, eccbytes: usize },

    #[error("{oob_size}-byte OOB does not fit the {}-byte redundant area window", SMRA_WINDOW_LEN)]
    RedundantAreaTooLarge { oob_size: usize },
}

/// BCH correction strength
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum BchStrength {
    /// No hardware ECC
    None,
    #[default]
    T8,
    T12,
    T24,
}

/// Shape of one BCH codeword
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EccField {
    /// User data bytes covered by one codeword
    pub field_len: usize,

    /// Bytes the hardware reserves per field for framing (metadata + parity)
    pub padding_len: usize,

    /// Parity bytes per field
    pub parity_len: usize,

    /// Errors guaranteed correctable per field
    pub correctable: usize,
}

/// Indexed by [BchStrength::index]
const ECC_FIELDS: [Option<EccField>; 4] = [
    None,
    Some(EccField {
        field_len: 512,
        padding_len: 32,
        parity_len: 15,
        correctable: 8,
    }),
    Some(EccField {
        field_len: 512,
        padding_len: 32,
        parity_len: 23,
        correctable: 12,
    }),
    Some(EccField {
        field_len: 1024,
        padding_len: 64,
        parity_len: 45,
        correctable: 24,
    }),
];

/// Parity bytes per page, indexed by [PageSize::budget_row] and [BchStrength::index]
const PARITY_BUDGET: [[usize; 4]; 3] = [
    [0, 60, 92, 90],    // 2K
    [0, 120, 184, 180], // 4K
    [0, 240, 368, 360], // 8K
];

/// Codeword shape used when ECC is off; there is no parity
const NO_ECC_FIELD: EccField = EccField {
    field_len: 512,
    padding_len: 32,
    parity_len: 0,
    correctable: 0,
};

impl BchStrength {
    pub const ALL: [Self; 4] = [Self::None, Self::T8, Self::T12, Self::T24];

    pub fn index(self) -> usize {
        match self {
            Self::None => 0,
            Self::T8 => 1,
            Self::T12 => 2,
            Self::T24 => 3,
        }
    }

    /// Codeword shape, or `None` if ECC is off
    pub fn field(self) -> Option<EccField> {
        ECC_FIELDS[self.index()]
    }

    /// BCH select bits of SMCSR, or `None` if ECC is off
    pub fn smcsr_bits(self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::T8 => Some(SMCSR_BCH_T8),
            Self::T12 => Some(SMCSR_BCH_T12),
            Self::T24 => Some(SMCSR_BCH_T24),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageSize {
    P512,
    P2048,
    P4096,
    P8192,
}

impl PageSize {
    /// Any page size the ECC engine understands
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            512 => Some(Self::P512),
            2048 => Some(Self::P2048),
            4096 => Some(Self::P4096),
            8192 => Some(Self::P8192),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::P512 => 512,
            Self::P2048 => 2048,
            Self::P4096 => 4096,
            Self::P8192 => 8192,
        }
    }

    /// PSIZE bits of SMCSR
    pub fn smcsr_bits(self) -> u32 {
        let code = match self {
            Self::P512 => 0,
            Self::P2048 => 1,
            Self::P4096 => 2,
            Self::P8192 => 3,
        };
        code << 16
    }

    /// Row of [PARITY_BUDGET]; small-page devices are not handled by the selector
    fn budget_row(self) -> Option<usize> {
        match self {
            Self::P512 => None,
            Self::P2048 => Some(0),
            Self::P4096 => Some(1),
            Self::P8192 => Some(2),
        }
    }

    /// The strength used when nothing overrides it
    pub fn default_strength(self) -> BchStrength {
        match self {
            Self::P8192 => BchStrength::T12,
            _ => BchStrength::T8,
        }
    }
}

/// Parity bytes for a whole page, from the budget table
pub fn parity_budget(page: PageSize, strength: BchStrength) -> Option<usize> {
    Some(PARITY_BUDGET[page.budget_row()?][strength.index()])
}

/// The geometry every transfer is performed with
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandGeometry {
    pub page_size: PageSize,
    pub oob_size: usize,
    pub strength: BchStrength,
    field: EccField,
}

impl NandGeometry {
    pub fn new(
        page_size: PageSize,
        oob_size: usize,
        strength: BchStrength,
    ) -> Result<Self, GeometryError> {
        let field = strength.field().unwrap_or(NO_ECC_FIELD);
        if page_size.bytes() % field.field_len != 0 {
            return Err(GeometryError::FieldMismatch {
                page_size: page_size.bytes(),
                field_len: field.field_len,
            });
        }

        Ok(Self {
            page_size,
            oob_size,
            strength,
            field,
        })
    }

    pub fn page_bytes(&self) -> usize {
        self.page_size.bytes()
    }

    pub fn field_len(&self) -> usize {
        self.field.field_len
    }

    pub fn padding_len(&self) -> usize {
        self.field.padding_len
    }

    pub fn parity_len(&self) -> usize {
        self.field.parity_len
    }

    pub fn correctable(&self) -> usize {
        self.field.correctable
    }

    pub fn total_field_count(&self) -> usize {
        self.page_bytes() / self.field_len()
    }

    /// Parity bytes for the whole page
    pub fn eccbytes(&self) -> usize {
        self.parity_len() * self.total_field_count()
    }

    pub fn ecc_enabled(&self) -> bool {
        self.strength != BchStrength::None
    }
}

/// ECC strength selected by the power-on setting
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EccSetting {
    Unset,
    NoEcc,
    T12,
    T24,
}

/// Page size selected by the power-on setting
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageSetting {
    Unset,
    Page(PageSize),
}

/// The fields of the power-on setting word this driver cares about
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PowerOnConfig {
    pub word: u32,
    pub ecc: EccSetting,
    pub page: PageSetting,
}

const PWRON_OTP_VALID: u32 = 1 << 0;
const PWRON_ECC_MASK: u32 = 0xC000;
const PWRON_PAGE_MASK: u32 = 0x3000;
const PWRON_PIN_SHIFT: u32 = 8;

impl PowerOnConfig {
    /// Read the OTP word, falling back to the strap pins when the OTP is not programmed
    pub fn read<S: PowerOnSource>(source: &mut S) -> Self {
        let otp = source.otp_word();
        if otp & PWRON_OTP_VALID != 0 {
            Self::from_word(otp)
        } else {
            Self::from_word(source.pin_word() << PWRON_PIN_SHIFT)
        }
    }

    /// Decode a word in OTP bit positions
    pub fn from_word(word: u32) -> Self {
        let ecc = match word & PWRON_ECC_MASK {
            0x0000 => EccSetting::NoEcc,
            0x4000 => EccSetting::T12,
            0x8000 => EccSetting::T24,
            _ => EccSetting::Unset,
        };
        let page = match word & PWRON_PAGE_MASK {
            0x0000 => PageSetting::Page(PageSize::P2048),
            0x1000 => PageSetting::Page(PageSize::P4096),
            0x2000 => PageSetting::Page(PageSize::P8192),
            _ => PageSetting::Unset,
        };

        Self { word, ecc, page }
    }

    /// A setting that leaves the probed geometry alone
    pub fn unset() -> Self {
        Self::from_word(PWRON_ECC_MASK | PWRON_PAGE_MASK)
    }
}

/// Non-fatal disagreements between the power-on setting and the probed device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConfigWarning {
    /// The configured strength's parity does not fit the probed OOB; the probed default is kept
    EccDoesNotFit {
        requested: BchStrength,
        kept: BchStrength,
        oob_size: usize,
    },
}

/// Result of geometry selection
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Selection {
    pub geometry: NandGeometry,
    pub layout: OobLayout,
    pub warnings: Vec<ConfigWarning>,
}

/// Pick page size, OOB size and BCH strength for a probed device.
pub fn select(
    probed_page: usize,
    probed_oob: usize,
    config: PowerOnConfig,
) -> Result<Selection, GeometryError> {
    let mut warnings = Vec::new();

    let probed = PageSize::from_bytes(probed_page).filter(|p| p.budget_row().is_some());
    if probed.is_none() {
        log::error!("controller does not support the page size ({probed_page}, {probed_oob})");
    }

    let ecc_override = match config.ecc {
        EccSetting::Unset => None,
        EccSetting::NoEcc => Some(BchStrength::None),
        EccSetting::T12 => Some(BchStrength::T12),
        EccSetting::T24 => Some(BchStrength::T24),
    };

    let (page_size, oob_size, strength) = match config.page {
        PageSetting::Page(page) => {
            let strength = ecc_override.unwrap_or_else(|| {
                probed.map_or(page.default_strength(), PageSize::default_strength)
            });
            let oob_size =
                parity_budget(page, strength).unwrap_or_default() + OOB_OVERRIDE_SLACK;
            (page, oob_size, strength)
        }
        PageSetting::Unset => {
            let page = probed.ok_or(GeometryError::UnsupportedPageSize {
                page_size: probed_page,
                oob_size: probed_oob,
            })?;
            let default = page.default_strength();
            let mut strength = ecc_override.unwrap_or(default);

            let fits = |s| {
                parity_budget(page, s)
                    .and_then(|ecc| OobLayout::compute(probed_oob, ecc))
                    .is_some()
            };
            if strength != default && !fits(strength) {
                log::warn!(
                    "power-on ECC setting {strength:?} does not fit {probed_oob}-byte OOB \
                     (word {:#x}); keeping {default:?}",
                    config.word
                );
                warnings.push(ConfigWarning::EccDoesNotFit {
                    requested: strength,
                    kept: default,
                    oob_size: probed_oob,
                });
                strength = default;
            }

            (page, probed_oob, strength)
        }
    };

    let eccbytes = parity_budget(page_size, strength).unwrap_or_default();
    let layout = OobLayout::compute(oob_size, eccbytes)
        .ok_or(GeometryError::OobTooSmall { oob_size, eccbytes })?;
    if oob_size > SMRA_WINDOW_LEN {
        return Err(GeometryError::RedundantAreaTooLarge { oob_size });
    }
    let geometry = NandGeometry::new(page_size, oob_size, strength)?;

    log::info!(
        "NAND geometry: {} + {} bytes, BCH {:?}, {} ECC bytes, {} OOB bytes free",
        page_size.bytes(),
        oob_size,
        strength,
        eccbytes,
        layout.available
    );

    Ok(Selection {
        geometry,
        layout,
        warnings,
    })
}

#[test]
fn test_parity_table_matches_fields() {
    for page in [PageSize::P2048, PageSize::P4096, PageSize::P8192] {
        for strength in BchStrength::ALL {
            let geometry = NandGeometry::new(page, 512, strength).unwrap();
            assert_eq!(parity_budget(page, strength), Some(geometry.eccbytes()));
            assert_eq!(
                geometry.field_len() * geometry.total_field_count(),
                page.bytes()
            );
        }
    }
    assert_eq!(parity_budget(PageSize::P2048, BchStrength::T12), Some(92));
    assert_eq!(parity_budget(PageSize::P512, BchStrength::T8), None);
}

#[test]
fn test_oob_available() {
    for (page, oob) in [
        (PageSize::P2048, 64),
        (PageSize::P4096, 224),
        (PageSize::P8192, 448),
    ] {
        for strength in [BchStrength::T8, BchStrength::T12, BchStrength::T24] {
            let ecc = parity_budget(page, strength).unwrap();
            if let Some(layout) = OobLayout::compute(oob, ecc) {
                assert_eq!(layout.eccbytes, ecc);
                assert_eq!(layout.available, oob - 4 - ecc);
            }
        }
    }
}

#[test]
fn test_small_page_field_mismatch() {
    assert!(NandGeometry::new(PageSize::P512, 16, BchStrength::T8).is_ok());
    assert_eq!(
        NandGeometry::new(PageSize::P512, 16, BchStrength::T24),
        Err(GeometryError::FieldMismatch {
            page_size: 512,
            field_len: 1024
        })
    );
}

#[test]
fn test_select_defaults() {
    let sel = select(2048, 64, PowerOnConfig::unset()).unwrap();
    assert_eq!(sel.geometry.strength, BchStrength::T8);
    assert_eq!(sel.layout.eccbytes, 60);
    assert!(sel.warnings.is_empty());

    let sel = select(4096, 224, PowerOnConfig::unset()).unwrap();
    assert_eq!(sel.geometry.strength, BchStrength::T8);
    assert_eq!(sel.layout.available, 224 - 4 - 120);

    let sel = select(8192, 448, PowerOnConfig::unset()).unwrap();
    assert_eq!(sel.geometry.strength, BchStrength::T12);
    assert_eq!(sel.layout.eccbytes, 368);
}

#[test]
fn test_select_overrides() {
    // T24, page size unset
    let sel = select(4096, 224, PowerOnConfig::from_word(0xB000)).unwrap();
    assert_eq!(sel.geometry.strength, BchStrength::T24);
    assert_eq!(sel.geometry.oob_size, 224);
    assert_eq!(sel.geometry.total_field_count(), 4);

    // T12 + 2K page: OOB is derived from the budget
    let sel = select(4096, 224, PowerOnConfig::from_word(0x4000)).unwrap();
    assert_eq!(sel.geometry.page_size, PageSize::P2048);
    assert_eq!(sel.geometry.oob_size, 92 + 8);
    assert_eq!(sel.layout.available, 4);

    // No ECC + 8K page
    let sel = select(2048, 64, PowerOnConfig::from_word(0x2000)).unwrap();
    assert_eq!(sel.geometry.strength, BchStrength::None);
    assert_eq!(sel.geometry.oob_size, 8);
    assert_eq!(sel.layout.eccbytes, 0);
    assert!(!sel.geometry.ecc_enabled());
}

#[test]
fn test_select_rescued_by_page_setting() {
    assert_eq!(
        select(1024, 32, PowerOnConfig::unset()),
        Err(GeometryError::UnsupportedPageSize {
            page_size: 1024,
            oob_size: 32
        })
    );

    let sel = select(1024, 32, PowerOnConfig::from_word(0xE000)).unwrap();
    assert_eq!(sel.geometry.page_size, PageSize::P8192);
    assert_eq!(sel.geometry.strength, BchStrength::T12);
    assert_eq!(sel.geometry.oob_size, 376);
}

#[test]
fn test_select_conflict_keeps_default() {
    let sel = select(2048, 64, PowerOnConfig::from_word(0x7000)).unwrap();
    assert_eq!(sel.geometry.strength, BchStrength::T8);
    assert_eq!(
        sel.warnings,
        [ConfigWarning::EccDoesNotFit {
            requested: BchStrength::T12,
            kept: BchStrength::T8,
            oob_size: 64
        }]
    );
}

#[test]
fn test_select_rejects_oversized_oob() {
    assert_eq!(
        select(8192, 640, PowerOnConfig::unset()),
        Err(GeometryError::RedundantAreaTooLarge { oob_size: 640 })
    );
    assert_eq!(
        select(8192, 256, PowerOnConfig::unset()),
        Err(GeometryError::OobTooSmall {
            oob_size: 256,
            eccbytes: 368
        })
    );
}

#[test]
fn test_power_on_source() {
    struct Words(u32, u32);
    impl PowerOnSource for Words {
        fn otp_word(&mut self) -> u32 {
            self.0
        }
        fn pin_word(&mut self) -> u32 {
            self.1
        }
    }

    // Programmed OTP wins
    let cfg = PowerOnConfig::read(&mut Words(0x8001 | 0x3000, 0x00));
    assert_eq!(cfg.ecc, EccSetting::T24);
    assert_eq!(cfg.page, PageSetting::Unset);

    // Blank OTP: pins are shifted into OTP positions
    let cfg = PowerOnConfig::read(&mut Words(0x0000, 0x50));
    assert_eq!(cfg.word, 0x5000);
    assert_eq!(cfg.ecc, EccSetting::T12);
    assert_eq!(cfg.page, PageSetting::Page(PageSize::P4096));
}
