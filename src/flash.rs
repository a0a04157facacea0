//! Whole-device operations built on the [Nand] traits: bad block scans, and writing or dumping
//! raw images.

use std::io::{self, Read, Write};
use std::ops::Range;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::nand::{Nand, NandBlock, PageUtil};

/// Checksum reported for dumped images
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Filler written in place of a bad block's content when dumping
const BAD_BLOCK_FILL: u8 = 0xBD;

/// Attempts to bring a block up to date before it is given up as bad
const WRITE_ATTEMPTS: usize = 3;

/// What [write_image] did with each block it touched
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct FlashSummary {
    /// Blocks erased and programmed
    pub written: Vec<u32>,

    /// Blocks that already held the right content
    pub unchanged: Vec<u32>,

    /// Blocks skipped because they were bad, or went bad on the way
    pub bad: Vec<u32>,
}

/// Fill `buf` from `read`, stopping early only at EOF. Returns the number of bytes read.
fn fill_from<R: Read>(read: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Indices of every block marked bad
pub fn scan_bad_blocks<N: Nand>(nand: &mut N) -> anyhow::Result<Vec<u32>> {
    let block_count = nand.get_layout().blocks;
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(block_count));

    let mut bad = Vec::new();
    for index in 0..block_count {
        if nand.block(index)?.is_none() {
            bad.push(index);
        }
        rpt.inc();
    }

    rpt.close();
    Ok(bad)
}

/// Does the block already hold `data`?
fn block_matches<B: NandBlock>(block: &mut B, data: &[u8]) -> bool {
    let mut current = vec![0; data.len()];
    match block.read(0, &mut current) {
        Ok(()) => current == data,
        // Unreadable content must be rewritten anyway
        Err(_) => false,
    }
}

fn update_block<B: NandBlock>(block: &mut B, data: &[u8]) -> anyhow::Result<()> {
    block.erase()?;
    block.program(0, data)
}

/// Write a raw image to consecutive good blocks, starting at `start_block`.
///
/// Blocks that already match are left alone, so rerunning a completed write does nothing. The
/// image's final block is padded with erased bytes.
pub fn write_image<N: Nand, R: Read>(
    nand: &mut N,
    image: &mut R,
    start_block: u32,
) -> anyhow::Result<FlashSummary> {
    let layout = nand.get_layout();
    let rpt = howudoin::new().label("Writing image");

    let mut summary = FlashSummary::default();
    let mut data = vec![0; layout.block_bytes()];
    let mut index = start_block;
    loop {
        let len = fill_from(image, &mut data)?;
        if len == 0 {
            break;
        }
        data[len..].fill(0xFF);

        'find_block: loop {
            anyhow::ensure!(index < layout.blocks, "image does not fit in the device");
            let block = nand.block(index)?;
            let current = index;
            index += 1;

            let Some(mut block) = block else {
                summary.bad.push(current);
                continue;
            };

            if block_matches(&mut block, &data) {
                summary.unchanged.push(current);
                break 'find_block;
            }

            for attempt in 1..=WRITE_ATTEMPTS {
                match update_block(&mut block, &data) {
                    Ok(()) => {
                        summary.written.push(current);
                        break 'find_block;
                    }
                    Err(err) => {
                        rpt.add_info(format!(
                            "block {current}: attempt {attempt} failed: {err:#}"
                        ));
                    }
                }
            }

            log::warn!("block {current} went bad while writing");
            if let Err(err) = block.mark_bad() {
                log::warn!("block {current}: {err:#}");
            }
            summary.bad.push(current);
        }

        rpt.inc();
    }

    rpt.close();
    Ok(summary)
}

/// Copy the data area of `blocks` to `out`, returning the CRC-32 of what was written.
///
/// Bad blocks are filled with a recognizable pattern; the image keeps the device's block offsets.
pub fn read_image<N: Nand, W: Write>(
    nand: &mut N,
    blocks: Range<u32>,
    out: &mut W,
) -> anyhow::Result<u32> {
    let layout = nand.get_layout();
    anyhow::ensure!(
        blocks.end <= layout.blocks,
        "blocks {blocks:?} out of range"
    );
    let rpt = howudoin::new()
        .label("Reading blocks")
        .set_len(u64::from(blocks.end.saturating_sub(blocks.start)));

    let mut digest = IMAGE_CRC.digest();
    let mut buf = vec![0; layout.block_bytes()];
    for index in blocks {
        match nand.block(index)? {
            None => buf.fill(BAD_BLOCK_FILL),
            Some(mut block) => block.read(0, &mut buf)?,
        }

        digest.update(&buf);
        out.write_all(&buf)?;
        rpt.inc();
    }

    rpt.close();
    Ok(digest.finalize())
}

/// Count the programmed pages of a block, for reporting
pub fn used_pages<B: NandBlock>(block: &mut B) -> anyhow::Result<u32> {
    let mut page = vec![0; block.page_size()];
    let mut used = 0;
    for index in 0..block.page_count() {
        block.read(index, &mut page)?;
        if !page.is_erased() {
            used += 1;
        }
    }
    Ok(used)
}

#[cfg(test)]
fn test_nand() -> anyhow::Result<crate::nfi::NfiController<crate::nfi::sim::SimNfi>> {
    use crate::geometry::PowerOnConfig;
    use crate::nfi::sim::{SimChip, SimNfi};
    use crate::nfi::{NfiConfig, NfiController};

    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.set_factory_bad(1);
    sim.fail_block(3);
    let config = NfiConfig {
        poll_limit: Some(10_000),
        ..Default::default()
    };
    let power_on = PowerOnConfig::read(&mut sim);
    Ok(NfiController::probe(sim, power_on, config)?)
}

#[test]
fn test_fill_from() -> io::Result<()> {
    let mut buf = [0u8; 8];
    assert_eq!(fill_from(&mut io::repeat(0xAA), &mut buf)?, 8);
    assert_eq!(buf, [0xAA; 8]);
    assert_eq!(fill_from(&mut &[1u8, 2, 3][..], &mut buf)?, 3);
    assert_eq!(buf[..3], [1, 2, 3]);
    Ok(())
}

#[test]
fn test_scan_bad_blocks() -> anyhow::Result<()> {
    let mut nand = test_nand()?;
    nand.bus_mut().set_factory_bad(900);
    assert_eq!(scan_bad_blocks(&mut nand)?, [1, 900]);
    Ok(())
}

#[test]
fn test_write_image_skips_bad_blocks() -> anyhow::Result<()> {
    let mut nand = test_nand()?;
    let block_bytes = nand.get_layout().block_bytes();

    // Four and a half blocks
    let image: Vec<u8> = (0..block_bytes * 9 / 2).map(|i| (i % 253) as u8).collect();
    let summary = write_image(&mut nand, &mut image.as_slice(), 0)?;
    assert_eq!(summary.written, [0, 2, 4, 5, 6]);
    assert_eq!(summary.bad, [1, 3]);
    assert!(nand.block(3)?.is_none());

    let mut block = nand.block(6)?.unwrap();
    assert_eq!(used_pages(&mut block)?, 32);

    // Writing again changes nothing
    let summary = write_image(&mut nand, &mut image.as_slice(), 0)?;
    assert_eq!(summary.unchanged, [0, 2, 4, 5, 6]);
    assert!(summary.written.is_empty());
    Ok(())
}

#[test]
fn test_read_image() -> anyhow::Result<()> {
    let mut nand = test_nand()?;
    let block_bytes = nand.get_layout().block_bytes();

    let image = vec![0x5A; block_bytes];
    write_image(&mut nand, &mut image.as_slice(), 0)?;

    let mut dump = Vec::new();
    let crc = read_image(&mut nand, 0..3, &mut dump)?;
    assert_eq!(crc, IMAGE_CRC.checksum(&dump));
    assert_eq!(dump.len(), block_bytes * 3);
    assert!(dump[..block_bytes].iter().all(|&b| b == 0x5A));
    assert!(dump[block_bytes..2 * block_bytes]
        .iter()
        .all(|&b| b == BAD_BLOCK_FILL));
    assert!(dump[2 * block_bytes..].is_erased());

    assert!(read_image(&mut nand, 0..1025, &mut io::sink()).is_err());
    Ok(())
}
