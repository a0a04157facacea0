//! Drive the NFI controller against a simulated chip.
//!
//! The simulated flash can be loaded from and saved back to an image file, so a sequence of
//! invocations behaves like one long-lived device.

use anyhow::{anyhow, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::num::ParseIntError;
use std::path::PathBuf;

use nfi_nand::{
    flash::{read_image, scan_bad_blocks, used_pages, write_image},
    geometry::PowerOnConfig,
    nand::Nand,
    nfi::{
        sim::{SimChip, SimNfi},
        NfiConfig, NfiController,
    },
};

fn parse_hex(value: &str) -> Result<u32, ParseIntError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16)
}

fn parse_chip(name: &str) -> Result<SimChip, String> {
    SimChip::by_name(name).ok_or_else(|| {
        let known: Vec<_> = SimChip::ALL.iter().map(|chip| chip.name).collect();
        format!("unknown chip {name:?}; known chips: {}", known.join(", "))
    })
}

#[derive(Args, Debug)]
struct SimOptions {
    /// Which chip to simulate
    #[clap(long, default_value = "K9F1G08", value_parser = parse_chip)]
    chip: SimChip,

    /// Path to the flash image to use
    #[clap(long)]
    image: Option<PathBuf>,

    /// Write back the flash image when done
    #[clap(long, requires = "image")]
    write_back: bool,

    /// OTP configuration word (hex)
    #[clap(long, default_value = "0", value_parser = parse_hex)]
    otp: u32,

    /// Power-on pin word (hex); bits 7:4 select page size and ECC strength
    #[clap(long, default_value = "f0", value_parser = parse_hex)]
    pins: u32,

    /// Give up on a register poll after this many reads
    #[clap(long)]
    poll_limit: Option<u32>,
}

impl SimOptions {
    fn open(&self) -> Result<NfiController<SimNfi>> {
        let mut sim = SimNfi::new(self.chip);
        sim.set_power_on(self.otp, self.pins);
        if let Some(path) = &self.image {
            if path.exists() {
                sim.load(&mut File::open(path)?)
                    .with_context(|| format!("loading {}", path.display()))?;
            }
        }

        let power_on = PowerOnConfig::read(&mut sim);
        let config = NfiConfig {
            poll_limit: self.poll_limit,
            ..Default::default()
        };
        Ok(NfiController::probe(sim, power_on, config)?)
    }

    fn cleanup(&self, nfi: NfiController<SimNfi>) -> Result<()> {
        if self.write_back {
            if let Some(path) = &self.image {
                nfi.into_bus().save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the probed chip, geometry and OOB layout
    Info,

    /// Erase one block
    EraseBlock { block: u32 },

    /// Write a bad block marker
    MarkBad { block: u32 },

    /// List the blocks marked bad
    Scan,

    /// Program one page from a file; short input is padded with 0xFF
    WritePage { page: u32, input: PathBuf },

    /// Read one page with ECC correction
    ReadPage {
        page: u32,

        /// Where to save the page data
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Write a raw image across good blocks
    Flash {
        input: PathBuf,

        /// The first block to write
        #[clap(long, default_value = "0")]
        start_block: u32,
    },

    /// Dump the data area of the device, or a range of blocks
    Dump {
        output: PathBuf,

        #[clap(long, default_value = "0")]
        first_block: u32,

        /// Number of blocks; the rest of the device by default
        #[clap(long)]
        count: Option<u32>,
    },
}

impl Command {
    fn execute(self, nfi: &mut NfiController<SimNfi>) -> Result<()> {
        match self {
            Command::Info => {
                let chip = nfi.chip();
                println!(
                    "chip: maker {:#04x} device {:#04x}, {} MiB",
                    chip.maker,
                    chip.device,
                    chip.chip_size >> 20
                );
                println!(
                    "blocks: {} x {} pages",
                    nfi.blocks(),
                    nfi.pages_per_block()
                );

                let geometry = *nfi.geometry();
                println!(
                    "page: {} + {} OOB, ECC {:?} ({} parity bytes)",
                    geometry.page_bytes(),
                    geometry.oob_size,
                    geometry.strength,
                    geometry.eccbytes()
                );

                let layout = *nfi.layout();
                println!(
                    "OOB: free {}..{}, parity at {}",
                    layout.free.offset,
                    layout.free.offset + layout.free.length,
                    layout.ecc_offset()
                );
                for warning in nfi.warnings() {
                    println!("warning: {warning:?}");
                }
            }

            Command::EraseBlock { block } => nfi.erase_block(block)?,

            Command::MarkBad { block } => nfi.mark_bad(block)?,

            Command::Scan => {
                let bad = scan_bad_blocks(nfi)?;
                println!("Bad blocks: {bad:?}");
            }

            Command::WritePage { page, input } => {
                let mut data = fs::read(&input)?;
                let page_bytes = nfi.geometry().page_bytes();
                ensure!(
                    data.len() <= page_bytes,
                    "{} is larger than a {page_bytes}-byte page",
                    input.display()
                );
                data.resize(page_bytes, 0xFF);

                let mut oob = vec![0xFF; nfi.geometry().oob_size];
                nfi.write_page(page, &data, &mut oob)?;
            }

            Command::ReadPage { page, output } => {
                let mut data = vec![0; nfi.geometry().page_bytes()];
                let mut oob = vec![0; nfi.geometry().oob_size];
                let reports = nfi.read_page(page, &mut data, &mut oob)?;

                for report in &reports {
                    println!(
                        "field {}: {} errors corrected",
                        report.field, report.error_count
                    );
                }

                let block = page / nfi.pages_per_block();
                if let Some(mut block) = nfi.block(block)? {
                    println!("block holds {} programmed pages", used_pages(&mut block)?);
                }

                if let Some(output) = output {
                    fs::write(output, &data)?;
                }
            }

            Command::Flash { input, start_block } => {
                let mut image = File::open(input)?;
                let summary = write_image(nfi, &mut image, start_block)?;
                println!(
                    "written: {:?}, unchanged: {:?}, bad: {:?}",
                    summary.written, summary.unchanged, summary.bad
                );
            }

            Command::Dump {
                output,
                first_block,
                count,
            } => {
                let end = match count {
                    Some(count) => first_block
                        .checked_add(count)
                        .ok_or_else(|| anyhow!("block count overflows"))?,
                    None => nfi.get_layout().blocks,
                };

                let mut out = BufWriter::new(File::create(output)?);
                let crc = read_image(nfi, first_block..end, &mut out)?;
                out.flush()?;
                println!("CRC-32: {crc:08x}");
            }
        };

        let stats = nfi.stats();
        if stats.corrected != 0 || stats.failed != 0 {
            println!(
                "ECC: {} bytes corrected, {} pages failed",
                stats.corrected, stats.failed
            );
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    sim: SimOptions,

    /// The command to run against the simulated chip
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut nfi = args.sim.open()?;
    args.cmd.execute(&mut nfi)?;
    args.sim.cleanup(nfi)?;
    Ok(())
}
