//! uf2d daemon - serves a synthesized disk to the host through /dev/nbdX.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use uf2d::config::{self, Config, LogSink, MsdConfig, Timings};
use uf2d::{MassStorage, MemoryImage, Scripts, Session, Simulated, Supervisor};

#[derive(Parser)]
#[command(
    name = "uf2d",
    about = "Expose a synthesized disk image as a USB mass storage device"
)]
struct Cli {
    /// NBD device node to attach.
    #[arg(default_value = config::DEFAULT_DEVICE)]
    device: PathBuf,

    /// Size of the in-memory image, in 512-byte sectors.
    #[arg(long, default_value_t = config::DEFAULT_SECTORS)]
    sectors: u64,

    /// Shell command exposing the device over USB.
    #[arg(long, default_value = config::DEFAULT_MSD_ON)]
    msd_on: String,

    /// Shell command withdrawing the device from USB.
    #[arg(long, default_value = config::DEFAULT_MSD_OFF)]
    msd_off: String,

    /// Only log mass storage transitions instead of running commands.
    #[arg(long)]
    simulate_msd: bool,

    /// Delay between a session attaching and enabling mass storage.
    #[arg(long, default_value_t = 1000)]
    settle_ms: u64,

    /// Delay before restarting after a clean session exit.
    #[arg(long, default_value_t = 2000)]
    clean_cooldown_ms: u64,

    /// Delay before restarting after a crashed session.
    #[arg(long, default_value_t = 5000)]
    crash_cooldown_ms: u64,

    /// Detach into the background.
    #[arg(long)]
    daemon: bool,

    /// Where to send log output.
    #[arg(long, value_enum, default_value_t = LogSink::Stderr)]
    log: LogSink,

    /// Log every block request.
    #[arg(short, long)]
    verbose: bool,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let msd = if cli.simulate_msd {
            MsdConfig::Simulated
        } else {
            MsdConfig::Scripts {
                on: cli.msd_on,
                off: cli.msd_off,
            }
        };

        Config {
            device: cli.device,
            sectors: cli.sectors,
            timings: Timings {
                settle: Duration::from_millis(cli.settle_ms),
                clean_cooldown: Duration::from_millis(cli.clean_cooldown_ms),
                crash_cooldown: Duration::from_millis(cli.crash_cooldown_ms),
            },
            msd,
            log: cli.log,
            verbose: cli.verbose,
            daemonize: cli.daemon,
        }
    }
}

fn main() -> Result<()> {
    let config = Config::from(Cli::parse());
    config.validate().context("invalid configuration")?;

    if config.daemonize {
        nix::unistd::daemon(false, true).context("failed to daemonize")?;
    }

    init_logging(&config)?;

    let mut image = MemoryImage::new(config.sectors).context("failed to allocate image")?;

    info!(
        device = %config.device.display(),
        sectors = config.sectors,
        "starting uf2d"
    );

    match config.msd.clone() {
        MsdConfig::Scripts { on, off } => supervise(Scripts::new(on, off), &config, &mut image),
        MsdConfig::Simulated => supervise(Simulated, &config, &mut image),
    }
}

fn supervise<M: MassStorage>(msd: M, config: &Config, image: &mut MemoryImage) -> ! {
    let mut supervisor =
        Supervisor::new(msd, config.timings).flush_on_disable(config.device.clone());

    supervisor.run(|ready| {
        let session = unsafe { Session::attach(&config.device, &mut *image)? };
        ready.signal()?;
        session.run()
    })
}

fn init_logging(config: &Config) -> Result<()> {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let builder = FmtSubscriber::builder().with_max_level(level);

    match config.log {
        LogSink::Stderr => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogSink::Kmsg => {
            let kmsg = OpenOptions::new()
                .write(true)
                .open("/dev/kmsg")
                .context("failed to open /dev/kmsg")?;
            let subscriber = builder
                .with_writer(Mutex::new(kmsg))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}
