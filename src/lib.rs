//! Driver for the NUA3500 NAND flash interface (NFI) and its hardware BCH engine.
//!
//! [nfi::NfiController] owns a register bus ([nfi::regs::NfiBus]): real memory-mapped registers
//! on the target, or [nfi::sim::SimNfi] everywhere else. On top of it sit the block-level
//! [nand] traits and the whole-device helpers in [flash].

pub mod error;
pub mod flash;
pub mod geometry;
pub mod nand;
pub mod nfi;
