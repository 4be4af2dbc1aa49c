#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{CombinedLogger, Config, LevelFilter, SharedLogger, SimpleLogger, WriteLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_spi_loader::image::Image;
use stm32_spi_loader::{Command, Options, Programmer, Progress, SpiConfig, MAX_CHUNK};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// SPI device to connect to
    #[structopt(long, default_value = "/dev/spidev0.0")]
    device: String,

    #[structopt(flatten)]
    spi: SpiConfig,

    #[structopt(flatten)]
    options: Options,

    #[structopt(subcommand)]
    operation: Operation,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Also write debug logs to this file
    #[structopt(long)]
    log_file: Option<String>,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Show bootloader version, chip ID and supported commands
    Info,

    /// Erase pages, or the whole flash when no range is given
    Erase {
        #[structopt(long)]
        start_page: Option<u16>,

        #[structopt(long)]
        pages: Option<u32>,
    },

    /// Write an image file to flash
    Program(ImageArgs),

    /// Compare flash contents against an image file
    Verify(ImageArgs),

    /// Read flash contents into a file
    Dump {
        #[structopt(long)]
        file: String,

        #[structopt(long, parse(try_from_str = parse_u32))]
        address: u32,

        /// Size in bytes (e.g. 0x8000 or 32KiB)
        #[structopt(long, parse(try_from_str = parse_size))]
        size: u32,
    },

    /// Read up to 256 bytes and print them as hex
    Read {
        #[structopt(long, parse(try_from_str = parse_u32))]
        address: u32,

        #[structopt(long, parse(try_from_str = parse_u32))]
        size: u32,
    },

    /// Write up to 256 bytes given as hex
    Write {
        #[structopt(long, parse(try_from_str = parse_u32))]
        address: u32,

        /// Data as hex, e.g. 0011aabb
        #[structopt(long)]
        data: String,
    },

    /// Enable write protection for a range of pages
    WriteProtect {
        #[structopt(long)]
        start_page: u32,

        #[structopt(long)]
        pages: u32,
    },

    /// Disable write protection
    WriteUnprotect,

    /// Enable readout protection
    ReadoutProtect,

    /// Disable readout protection, this erases the flash
    ReadoutUnprotect,

    /// Jump to the application
    Go {
        #[structopt(long, parse(try_from_str = parse_u32), default_value = "0x08000000")]
        address: u32,
    },
}

#[derive(Clone, Debug, StructOpt)]
pub struct ImageArgs {
    /// Image file
    #[structopt(long)]
    file: String,

    /// Expected MD5 digest of the image file
    #[structopt(long)]
    md5: String,

    /// Flash address to start at
    #[structopt(long, parse(try_from_str = parse_u32), default_value = "0x08000000")]
    address: u32,

    /// Offset into the image to start from
    #[structopt(long, default_value = "0")]
    offset: usize,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(h, 16)
    } else {
        s.parse::<u32>()
    }
}

fn parse_size(s: &str) -> Result<u32, String> {
    if let Ok(v) = parse_u32(s) {
        return Ok(v);
    }

    let v = bytefmt::parse(s).map_err(|e| format!("invalid size '{}': {}", s, e))?;
    if v > u64::from(u32::MAX) {
        return Err(format!("size '{}' too large", s));
    }
    Ok(v as u32)
}

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("#>-"),
    );
    pb
}

fn main() -> Result<(), anyhow::Error> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![SimpleLogger::new(o.log_level, Config::default())];
    if let Some(f) = &o.log_file {
        let file = std::fs::File::create(f).with_context(|| format!("creating log file {}", f))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }
    let _ = CombinedLogger::init(loggers);

    // Check image files before touching the device
    let image = match &o.operation {
        Operation::Program(i) | Operation::Verify(i) => {
            let image = Image::load_verified(&i.file, &i.md5)?;
            info!(
                "Image {} ({}, md5 {})",
                i.file,
                bytefmt::format(image.len() as u64),
                image.digest_hex()
            );
            Some(image)
        }
        _ => None,
    };

    info!("Connecting to SPI device {}", o.device);

    let mut p = Programmer::linux(&o.device, &o.spi, o.options.clone())
        .with_context(|| format!("opening SPI device {}", o.device))?;

    info!("Connecting to bootloader");

    let synced = p.init().context("connecting to bootloader")?;
    info!("Bootloader connected ({:?})", synced);

    match o.operation {
        Operation::Info => {
            let info = p.get_commands()?;
            let id = p.get_id()?;

            println!("Protocol version: {}.{}", info.version >> 4, info.version & 0x0F);
            println!("Chip ID: 0x{}", hex::encode(&id));

            let names: Vec<String> = info
                .commands
                .iter()
                .map(|c| match Command::from_opcode(*c) {
                    Some(c) => format!("{:?}", c),
                    None => format!("0x{:02x}", c),
                })
                .collect();
            println!("Commands: {}", names.join(", "));
        }
        Operation::Erase { start_page, pages } => match (start_page, pages) {
            (Some(s), Some(n)) => p.erase_pages(s, n)?,
            (None, None) => p.mass_erase()?,
            _ => return Err(anyhow!("--start-page and --pages must be given together")),
        },
        Operation::Program(i) => {
            let image = image.ok_or_else(|| anyhow!("image not loaded"))?;
            let total = image.len().saturating_sub(i.offset);
            let pb = progress_bar(total);

            p.program_with(image.data(), i.address, i.offset, |r: Progress| {
                pb.set_position(r.bytes_complete as u64)
            })?;

            pb.finish();
            info!("Programmed {}", bytefmt::format(total as u64));
        }
        Operation::Verify(i) => {
            let image = image.ok_or_else(|| anyhow!("image not loaded"))?;
            let total = image.len().saturating_sub(i.offset);
            let pb = progress_bar(total);

            p.verify_with(image.data(), i.address, i.offset, |r: Progress| {
                pb.set_position(r.bytes_complete as u64)
            })?;

            pb.finish();
            info!("Verified {}", bytefmt::format(total as u64));
        }
        Operation::Dump {
            file,
            address,
            size,
        } => {
            let pb = progress_bar(size as usize);

            let data = p.dump_with(address, size as usize, |r: Progress| {
                pb.set_position(r.bytes_complete as u64)
            })?;
            pb.finish();

            std::fs::write(&file, &data).with_context(|| format!("writing {}", file))?;
            info!("Wrote {} to {}", bytefmt::format(data.len() as u64), file);
        }
        Operation::Read { address, size } => {
            let data = p.read(address, size as usize)?;
            for (i, c) in data.chunks(16).enumerate() {
                println!("{:08x}: {}", address as usize + i * 16, hex::encode(c));
            }
        }
        Operation::Write { address, data } => {
            let data = hex::decode(data.trim_start_matches("0x")).context("parsing write data")?;
            if data.len() > MAX_CHUNK {
                return Err(anyhow!("at most {} bytes per write", MAX_CHUNK));
            }
            p.write(address, &data)?;
            info!("Wrote {} bytes at 0x{:08x}", data.len(), address);
        }
        Operation::WriteProtect { start_page, pages } => p.write_protect(start_page, pages)?,
        Operation::WriteUnprotect => p.write_unprotect()?,
        Operation::ReadoutProtect => p.readout_protect()?,
        Operation::ReadoutUnprotect => p.readout_unprotect()?,
        Operation::Go { address } => p.go(address)?,
    }

    info!("Done, session {:?}", p.state());
    let _ = p.close();

    Ok(())
}
