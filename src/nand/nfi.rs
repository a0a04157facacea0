//! NAND abstraction layer implementation over the NFI controller

use super::{Nand, NandBlock, NandLayout, PageUtil};
use crate::nfi::regs::{NfiBus, ERASED};
use crate::nfi::NfiController;

use anyhow::{ensure, Context};

use std::ops::Range;

impl<B: NfiBus> Nand for NfiController<B> {
    type Block<'a> = NfiBlock<'a, B> where Self: 'a;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<NfiBlock<'_, B>>> {
        ensure!(index < self.blocks(), "block {index} out of range");

        if self.is_bad(index)? {
            Ok(None)
        } else {
            Ok(Some(NfiBlock { nfi: self, index }))
        }
    }

    fn get_layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks(),
            pages_per_block: self.pages_per_block(),
            bytes_per_page: self.geometry().page_bytes(),
            oob_bytes: self.geometry().oob_size,
        }
    }
}

pub struct NfiBlock<'a, B> {
    nfi: &'a mut NfiController<B>,
    index: u32,
}

impl<B: NfiBus> NfiBlock<'_, B> {
    /// Ensure that the byte count and starting page are valid, and compute the device pages
    fn pages_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<Range<u32>> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        let base = self.index * self.page_count();
        Ok(base + start_page..base + end_page)
    }
}

impl<B: NfiBus> NandBlock for NfiBlock<'_, B> {
    fn page_count(&self) -> u32 {
        self.nfi.pages_per_block()
    }

    fn page_size(&self) -> usize {
        self.nfi.geometry().page_bytes()
    }

    fn read(&mut self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let pages = self.pages_for(start_page, content.len())?;
        let mut oob = vec![0; self.nfi.geometry().oob_size];

        for (page, chunk) in pages.zip(content.chunks_mut(self.page_size())) {
            self.nfi
                .read_page(page, chunk, &mut oob)
                .with_context(|| format!("reading page {page}"))?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let pages = self.pages_for(start_page, content.len())?;
        let mut oob = vec![ERASED; self.nfi.geometry().oob_size];

        for (page, chunk) in pages.zip(content.chunks(self.page_size())) {
            // Programming an erased page changes nothing and would make it look written
            if chunk.is_erased() {
                continue;
            }

            oob.fill(ERASED);
            self.nfi
                .write_page(page, chunk, &mut oob)
                .with_context(|| format!("programming page {page}"))?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        Ok(self.nfi.erase_block(self.index)?)
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        // The erase may well fail on a worn block; the marker is what matters
        if let Err(err) = self.nfi.erase_block(self.index) {
            log::debug!("erase before marking block {} bad: {err}", self.index);
        }
        Ok(self.nfi.mark_bad(self.index)?)
    }
}

#[cfg(test)]
fn test_nand() -> anyhow::Result<NfiController<crate::nfi::sim::SimNfi>> {
    use crate::geometry::PowerOnConfig;
    use crate::nfi::sim::{SimChip, SimNfi};
    use crate::nfi::NfiConfig;

    let mut sim = SimNfi::new(SimChip::K9F1G08);
    sim.set_factory_bad(7);
    let config = NfiConfig {
        poll_limit: Some(10_000),
        ..Default::default()
    };
    let power_on = PowerOnConfig::read(&mut sim);
    Ok(NfiController::probe(sim, power_on, config)?)
}

#[test]
fn test_block_lookup() -> anyhow::Result<()> {
    let mut nand = test_nand()?;
    let layout = nand.get_layout();
    assert_eq!(layout.blocks, 1024);
    assert_eq!(layout.pages_per_block, 64);
    assert_eq!(layout.bytes_per_page, 2048);
    assert_eq!(layout.oob_bytes, 64);

    assert!(nand.block(0)?.is_some());
    assert!(nand.block(7)?.is_none());
    assert!(nand.block(layout.blocks - 1)?.is_some());
    assert!(nand.block(layout.blocks).is_err());
    Ok(())
}

#[test]
fn test_block_mark_bad() -> anyhow::Result<()> {
    let mut nand = test_nand()?;
    nand.block(2)?.unwrap().mark_bad()?;
    assert!(nand.block(2)?.is_none());
    Ok(())
}

#[test]
fn test_block_read_write() -> anyhow::Result<()> {
    let mut nand = test_nand()?;
    let page_size = nand.get_layout().bytes_per_page;

    let data_in: Vec<u8> = (0..page_size * 3).map(|i| (i % 251) as u8).collect();
    let mut data_out = vec![0; page_size * 4];

    let mut block = nand.block(5)?.unwrap();
    block.program(1, &data_in)?;
    assert!(block.program(62, &data_in).is_err());

    block.read(0, &mut data_out)?;
    assert!(data_out[..page_size].is_erased());
    assert_eq!(data_out[page_size..], data_in[..]);

    block.erase()?;
    block.read(1, &mut data_out[..page_size])?;
    assert!(data_out[..page_size].is_erased());

    // Erased content is not programmed, so the page stays writable
    block.program(0, &vec![0xFF; page_size])?;
    assert!(nand.bus().raw_page(5 * 64).is_erased());
    Ok(())
}
