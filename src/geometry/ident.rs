//! Decoding of the READ ID response into chip dimensions.

use deku::prelude::*;

use crate::error::{self, NandError};

/// Number of ID bytes read from the device
pub const ID_LEN: usize = 6;

/// Chips above this size need a third row address cycle
const SMALL_CHIP_LIMIT: u64 = 128 << 20;

/// The 4th ID byte of a large-page device
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead)]
pub struct ExtId {
    #[deku(bits = "1")]
    pub reserved_hi: u8,
    #[deku(bits = "1")]
    pub bus16: u8,
    #[deku(bits = "2")]
    pub block_shift: u8,
    #[deku(bits = "1")]
    pub reserved_lo: u8,
    #[deku(bits = "1")]
    pub oob_shift: u8,
    #[deku(bits = "2")]
    pub page_shift: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead)]
pub struct NandId {
    pub maker: u8,
    pub device: u8,
    pub chip_opts: u8,
    pub ext: ExtId,
}

impl NandId {
    pub fn parse(bytes: &[u8]) -> error::Result<Self> {
        let (_, id) = Self::from_bytes((bytes, 0))?;
        Ok(id)
    }
}

/// Device codes and their capacity in MiB
const DEVICE_SIZES: &[(u8, u64)] = &[
    (0xF1, 128),
    (0xA1, 128),
    (0xDA, 256),
    (0xDC, 512),
    (0xD3, 1024),
    (0xD5, 2048),
    (0xD7, 4096),
    (0xDE, 8192),
];

/// Parts whose spare size the extended ID byte cannot express
struct FullId {
    id: [u8; ID_LEN],
    page_size: usize,
    oob_size: usize,
    block_size: usize,
}

const FULL_IDS: &[FullId] = &[
    // TC58NVG2S0F
    FullId {
        id: [0x98, 0xDC, 0x90, 0x26, 0x76, 0x15],
        page_size: 4096,
        oob_size: 224,
        block_size: 256 << 10,
    },
];

/// A pub-fields struct describing an identified chip
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChipInfo {
    pub maker: u8,
    pub device: u8,
    pub page_size: usize,
    pub oob_size: usize,
    pub block_size: usize,
    pub chip_size: u64,
}

impl ChipInfo {
    /// Interpret the raw READ ID bytes
    pub fn decode(bytes: &[u8; ID_LEN]) -> error::Result<Self> {
        let id = NandId::parse(bytes)?;

        let chip_mib = DEVICE_SIZES
            .iter()
            .find(|(code, _)| *code == id.device)
            .map(|(_, mib)| *mib)
            .ok_or(NandError::UnknownDevice {
                maker: id.maker,
                device: id.device,
            })?;

        if let Some(full) = FULL_IDS.iter().find(|full| full.id == *bytes) {
            return Ok(Self {
                maker: id.maker,
                device: id.device,
                page_size: full.page_size,
                oob_size: full.oob_size,
                block_size: full.block_size,
                chip_size: chip_mib << 20,
            });
        }

        if id.ext.bus16 != 0 {
            return Err(NandError::UnsupportedBusWidth);
        }

        let page_size = 1024usize << id.ext.page_shift;
        let oob_size = (8usize << id.ext.oob_shift) * (page_size >> 9);
        let block_size = (64usize << 10) << id.ext.block_shift;

        Ok(Self {
            maker: id.maker,
            device: id.device,
            page_size,
            oob_size,
            block_size,
            chip_size: chip_mib << 20,
        })
    }

    pub fn pages_per_block(&self) -> u32 {
        (self.block_size / self.page_size) as u32
    }

    pub fn blocks(&self) -> u32 {
        (self.chip_size / self.block_size as u64) as u32
    }

    pub fn pages(&self) -> u32 {
        self.blocks() * self.pages_per_block()
    }

    /// Number of row address cycles
    pub fn row_cycles(&self) -> usize {
        if self.chip_size > SMALL_CHIP_LIMIT {
            3
        } else {
            2
        }
    }
}

#[test]
fn test_decode_ext_id() -> error::Result<()> {
    // K9F1G08U0: 128 MiB, 2048 + 64, 128 KiB blocks
    let chip = ChipInfo::decode(&[0xEC, 0xF1, 0x00, 0x95, 0x40, 0x00])?;
    assert_eq!(chip.page_size, 2048);
    assert_eq!(chip.oob_size, 64);
    assert_eq!(chip.block_size, 128 << 10);
    assert_eq!(chip.pages_per_block(), 64);
    assert_eq!(chip.blocks(), 1024);
    assert_eq!(chip.row_cycles(), 2);

    let chip = ChipInfo::decode(&[0x2C, 0xD7, 0x00, 0x97, 0x00, 0x00])?;
    assert_eq!(chip.page_size, 8192);
    assert_eq!(chip.oob_size, 256);
    assert_eq!(chip.row_cycles(), 3);
    Ok(())
}

#[test]
fn test_decode_full_id() -> error::Result<()> {
    let chip = ChipInfo::decode(&[0x98, 0xDC, 0x90, 0x26, 0x76, 0x15])?;
    assert_eq!(chip.page_size, 4096);
    assert_eq!(chip.oob_size, 224);
    assert_eq!(chip.pages_per_block(), 64);
    assert_eq!(chip.blocks(), 2048);

    // Same device code, different part: generic decode
    let chip = ChipInfo::decode(&[0x98, 0xDC, 0x90, 0x26, 0x76, 0x16])?;
    assert_eq!(chip.oob_size, 128);
    Ok(())
}

#[test]
fn test_decode_rejects() {
    assert!(matches!(
        ChipInfo::decode(&[0xEC, 0x42, 0x00, 0x95, 0x40, 0x00]),
        Err(NandError::UnknownDevice {
            maker: 0xEC,
            device: 0x42
        })
    ));
    assert!(matches!(
        ChipInfo::decode(&[0xEC, 0xF1, 0x00, 0xD5, 0x40, 0x00]),
        Err(NandError::UnsupportedBusWidth)
    ));
}
