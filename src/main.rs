#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use nxp_uart_isp::{
    query_chip, FlashImage, GoMode, Monitor, Options, Programmer, Registry, SectorStatus,
    Session,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    verb: Verb,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Baud rate to synchronize at before switching to --baud
    #[structopt(long)]
    sync_baud: Option<usize>,

    /// Part definition file (lpctools parts.def format), defaults to the built in table
    #[structopt(long)]
    parts: Option<PathBuf>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Verb {
    /// Synchronize with the bootloader and exit
    Sync,

    /// Read part id, boot code version and serial number
    Querychip,

    /// Erase the whole flash
    Masserase,

    /// Program an image (Intel HEX, or raw binary at --address)
    Writeimage {
        #[structopt(long)]
        imagein: PathBuf,

        /// Load address for raw binaries
        #[structopt(long, default_value = "0", parse(try_from_str = parse_address))]
        address: u32,

        /// Read back and compare after writing
        #[structopt(long)]
        verify: bool,

        /// Start the application after writing
        #[structopt(long)]
        run: bool,
    },

    /// Check whether a range of sectors is erased
    Blankcheck {
        #[structopt(long, default_value = "0")]
        start: usize,

        /// Last sector to check, defaults to the last sector of the part
        #[structopt(long)]
        end: Option<usize>,
    },

    /// Read flash up to the first blank sector
    Readimage {
        #[structopt(long)]
        imageout: PathBuf,
    },

    /// Start execution at an address
    Go {
        #[structopt(long, default_value = "0", parse(try_from_str = parse_address))]
        address: u32,

        /// Jump in ARM rather than Thumb mode
        #[structopt(long)]
        arm: bool,
    },
}

fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

/// Progress bar over image writes
struct Progress {
    bar: ProgressBar,
}

impl Progress {
    fn new(sectors: usize) -> Self {
        let bar = ProgressBar::new(sectors as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} sectors {msg}"),
        );
        Self { bar }
    }
}

impl Monitor for Progress {
    fn sector_started(&mut self, sector: usize) {
        self.bar.set_message(&format!("sector {}", sector));
    }

    fn sector_finished(&mut self, _sector: usize, status: &SectorStatus) {
        if let SectorStatus::Written { .. } = status {
            self.bar.inc(1);
        }
    }
}

fn load_image(path: &Path, address: u32) -> anyhow::Result<FlashImage> {
    let is_hex = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("hex") || e.eq_ignore_ascii_case("ihex"))
        .unwrap_or(false);

    if !is_hex {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        return Ok(FlashImage::from_bytes(address, &data)?);
    }

    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let mut image = FlashImage::new();
    let mut base = 0u32;

    for record in ihex::Reader::new(&text) {
        match record.with_context(|| format!("parsing {}", path.display()))? {
            ihex::Record::Data { offset, value } => {
                image.insert(base.wrapping_add(offset as u32), &value)?
            }
            ihex::Record::ExtendedLinearAddress(a) => base = (a as u32) << 16,
            ihex::Record::ExtendedSegmentAddress(a) => base = (a as u32) << 4,
            ihex::Record::EndOfFile => break,
            _ => (),
        }
    }

    Ok(image)
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let registry = match &o.parts {
        Some(p) => {
            let text = fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            Registry::parse(&text).with_context(|| format!("parsing {}", p.display()))?
        }
        None => Registry::builtin().context("parsing built in parts table")?,
    };
    debug!("{} known parts", registry.len());

    info!("Connecting to serial port");

    let sync_baud = o.sync_baud.unwrap_or(o.baud);
    let mut session = Session::linux(&o.port, sync_baud, o.options.clone())
        .with_context(|| format!("opening {}", o.port))?;

    info!("Connecting to bootloader");

    session.connect().context("connecting to bootloader")?;

    if sync_baud != o.baud {
        session
            .set_baud_rate(o.baud as u32, 1)
            .context("switching baud rate")?;
    }

    if let Verb::Sync = o.verb {
        info!("Bootloader connected!");
        return Ok(());
    }

    if let Verb::Querychip = o.verb {
        let chip = query_chip(&mut session).context("querying chip")?;

        let name = match registry.lookup(chip.part_id) {
            Ok(g) => format!("{} ({} flash)", g.name, bytefmt::format(g.flash_size as u64)),
            Err(_) => "unknown part".to_string(),
        };

        println!("Part ID: 0x{:08x} {}", chip.part_id, name);
        println!("Boot code: {}", chip.boot_version);
        println!("UID: {}", hex::encode(chip.uid.to_bytes()));

        return Ok(());
    }

    let part_id = session.read_part_id().context("reading part id")?;
    let geometry = registry.lookup(part_id)?;
    info!("Found {}", geometry.name);

    let mut p = Programmer::new(&mut session, geometry);

    match o.verb {
        Verb::Masserase => {
            p.mass_erase().context("erasing flash")?;
        }
        Verb::Writeimage {
            imagein,
            address,
            verify,
            run,
        } => {
            let image = load_image(&imagein, address)?;
            let sectors = image.plan(geometry)?.len();

            info!(
                "Loaded {} from {}",
                bytefmt::format(image.len() as u64),
                imagein.display()
            );

            let mut progress = Progress::new(sectors);
            let r = p.write_image_with(&image, &mut progress);
            progress.bar.finish_and_clear();

            let report = r.with_context(|| format!("writing image, {:?}", p.state()))?;
            info!(
                "Wrote {} sectors, checksum 0x{:08x}",
                report.sectors.len(),
                report.checksum.unwrap_or_default()
            );

            if verify {
                p.verify_image(&image).context("verifying image")?;
            }

            if run {
                p.go(geometry.flash_base, GoMode::Thumb)
                    .context("starting application")?;
            }
        }
        Verb::Blankcheck { start, end } => {
            let end = end.unwrap_or(geometry.sector_count() - 1);
            let blank = p.blank_check(start..=end)?;

            println!(
                "Sectors {}..={} {}",
                start,
                end,
                if blank { "blank" } else { "not blank" }
            );

            if !blank {
                return Err(anyhow!("sectors not blank"));
            }
        }
        Verb::Readimage { imageout } => {
            let data = p.read_image().context("reading flash")?;
            fs::write(&imageout, &data)
                .with_context(|| format!("writing {}", imageout.display()))?;

            info!(
                "Read {} to {}",
                bytefmt::format(data.len() as u64),
                imageout.display()
            );
        }
        Verb::Go { address, arm } => {
            let mode = if arm { GoMode::Arm } else { GoMode::Thumb };
            p.go(address, mode).context("starting execution")?;
        }
        Verb::Sync | Verb::Querychip => (),
    }

    Ok(())
}
