//! Command line flasher for the nRF24LU1+ boot loader.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use nrf24_spi_flash::cdev::CdevGpio;
use nrf24_spi_flash::sim::{SimConfig, SimDevice};
use nrf24_spi_flash::{
    FirmwareImage, Gpio, PinMap, PollPolicy, Session, SessionConfig, SessionReport, Strategy,
    Timing, VerifyPolicy,
};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    /// Just the boot loader (about 1 minute)
    Fast,
    /// The full image (about 12 minutes)
    Full,
}

#[derive(Parser)]
#[command(name = "nrf24-spi-flash")]
#[command(author, version, about = "nRF24LU1+ boot loader flasher over GPIO", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Padded boot loader image
    image: PathBuf,

    /// What to program
    #[arg(short, long, value_enum, default_value = "fast")]
    mode: Mode,

    /// GPIO chip device
    #[arg(long, default_value = "/dev/gpiochip0")]
    chip: String,

    /// GPIO lines as reset,prog,sck,mosi,miso,cs
    #[arg(long, value_delimiter = ',', num_args = 6)]
    pins: Option<Vec<u32>>,

    /// Give up when the device stays busy this many seconds (0 waits forever)
    #[arg(long, default_value = "60")]
    busy_timeout: u64,

    /// Abort when the chip ID or banner do not read back as expected
    #[arg(long)]
    strict: bool,

    /// Check RESET is pulled up before starting
    #[arg(long)]
    check_connection: bool,

    /// Run against a simulated device instead of real GPIO
    #[arg(long)]
    simulate: bool,
}

fn pin_map(pins: &Option<Vec<u32>>) -> PinMap {
    match pins.as_deref() {
        Some(&[reset, prog, sck, mosi, miso, cs]) => PinMap { reset, prog, sck, mosi, miso, cs,
                                                             ..PinMap::default() },
        _ => PinMap::default(),
    }
}

fn flash<G: Gpio>(gpio: &mut G, config: SessionConfig, image: &FirmwareImage)
    -> anyhow::Result<SessionReport>
{
    let mut session = Session::new(gpio, config);
    Ok(session.run(image)?)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let strategy = match cli.mode {
        Mode::Fast => Strategy::Fast,
        Mode::Full => Strategy::Full,
    };
    let poll = match cli.busy_timeout {
        0 => PollPolicy::unbounded(),
        secs => PollPolicy::bounded(Duration::from_secs(secs), Duration::from_millis(10)),
    };
    let pins = pin_map(&cli.pins);
    let mut config = SessionConfig {
        strategy,
        verify: if cli.strict { VerifyPolicy::Fatal } else { VerifyPolicy::Advisory },
        poll,
        pins,
        check_connection: cli.check_connection,
        progress: true,
        ..Default::default()
    };

    log::info!("nRF24LU1P-F32 flasher");
    match strategy {
        Strategy::Fast => log::info!("Programming just the boot loader, this takes up to 1 min"),
        Strategy::Full => log::info!("Programming the full image takes up to 12 min, be patient"),
    }
    let image = FirmwareImage::open(&cli.image, strategy, &config.profile)?;

    let report = if cli.simulate {
        config.timing = Timing::none();
        let mut dev = SimDevice::new(SimConfig { pins, ..Default::default() });
        flash(&mut dev, config, &image)?
    } else {
        let mut gpio = CdevGpio::open(&cli.chip, &pins)?;
        flash(&mut gpio, config, &image)?
    };

    log::info!("Chip ID {}: {:?}", report.chip_id, report.identity);
    log::info!("Banner \"{}\": {:?}", report.banner_text, report.banner);
    log::info!("Done, {} bytes programmed", report.bytes_programmed);
    Ok(())
}
