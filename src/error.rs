//! Error types shared by the controller and its helpers.

use thiserror::Error;

use crate::geometry::GeometryError;
use crate::nfi::dma::DmaState;

#[derive(Debug, Error)]
pub enum NandError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("uncorrectable ECC error in field {field} of page {page}")]
    Uncorrectable { page: u32, field: usize },

    #[error("device timed out waiting for {0}")]
    DeviceTimeout(&'static str),

    #[error("program failed on page {0}")]
    ProgramFailed(u32),

    #[error("erase failed on block {0}")]
    EraseFailed(u32),

    #[error("DMA engine is {found:?}, expected {expected:?}")]
    DmaState { expected: DmaState, found: DmaState },

    #[error("{what} buffer is {found} bytes, expected {expected}")]
    BufferSize {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{what} {index} out of range")]
    OutOfRange { what: &'static str, index: u32 },

    #[error("unknown NAND device {maker:#04x}:{device:#04x}")]
    UnknownDevice { maker: u8, device: u8 },

    #[error("16-bit NAND bus is not supported")]
    UnsupportedBusWidth,

    #[error("malformed device ID")]
    Ident(#[from] deku::DekuError),
}

pub type Result<T> = std::result::Result<T, NandError>;

/// Check that a caller-provided buffer has exactly the required length
pub(crate) fn check_len(what: &'static str, buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(NandError::BufferSize {
            what,
            expected,
            found: buf.len(),
        })
    }
}
