//! Block-level abstractions over a NAND flash device

pub mod nfi;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,

    /// Spare bytes per page, as the controller uses them
    pub oob_bytes: usize,
}

impl NandLayout {
    /// Data bytes in one block
    pub fn block_bytes(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    ///
    /// Correctable bit errors are repaired silently; an uncorrectable page is an error.
    fn read(&mut self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Pages within a block must be programmed in ascending order. Fully erased pages are skipped.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

#[test]
fn test_is_erased() {
    assert!([0xFFu8; 16].is_erased());
    assert!([0u8; 0].is_erased());
    assert!(![0xFF, 0xFF, 0xFE, 0xFF].is_erased());
}

#[test]
fn test_block_bytes() {
    let layout = NandLayout {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
        oob_bytes: 64,
    };
    assert_eq!(layout.block_bytes(), 128 << 10);
}
