//! Runtime configuration for the uf2d daemon.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default NBD device node.
pub const DEFAULT_DEVICE: &str = "/dev/nbd0";

/// Default size of the in-memory image, in sectors.
pub const DEFAULT_SECTORS: u64 = 8000;

/// Default command exposing the device over USB.
pub const DEFAULT_MSD_ON: &str = "/opt/uf2d/msdon.sh";

/// Default command withdrawing the device from USB.
pub const DEFAULT_MSD_OFF: &str = "/opt/uf2d/msdoff.sh";

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// NBD device node to attach.
    pub device: PathBuf,
    /// Sectors in the image behind the device.
    pub sectors: u64,
    /// Supervisor delays.
    pub timings: Timings,
    /// How mass storage visibility is toggled.
    pub msd: MsdConfig,
    /// Where log lines go.
    pub log: LogSink,
    /// Log per-request traffic.
    pub verbose: bool,
    /// Detach from the terminal before starting.
    pub daemonize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            sectors: DEFAULT_SECTORS,
            timings: Timings::default(),
            msd: MsdConfig::default(),
            log: LogSink::Stderr,
            verbose: false,
            daemonize: false,
        }
    }
}

impl Config {
    /// Rejects configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sectors == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sectors",
                reason: "must be > 0",
            });
        }
        self.timings.validate()
    }
}

/// Delays applied by the supervisor around each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause between the session attaching and enabling mass storage.
    pub settle: Duration,
    /// Pause before restarting after a clean session exit.
    pub clean_cooldown: Duration,
    /// Pause before restarting after a crashed session.
    pub crash_cooldown: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            clean_cooldown: Duration::from_secs(2),
            crash_cooldown: Duration::from_secs(5),
        }
    }
}

impl Timings {
    /// All delays zero, for tests.
    pub const fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            clean_cooldown: Duration::ZERO,
            crash_cooldown: Duration::ZERO,
        }
    }

    /// Checks that the settle delay is the shortest and a crash backs off at
    /// least as long as a clean exit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settle > self.clean_cooldown {
            return Err(ConfigError::InvalidValue {
                field: "settle",
                reason: "must not exceed the clean cooldown",
            });
        }
        if self.clean_cooldown > self.crash_cooldown {
            return Err(ConfigError::InvalidValue {
                field: "clean_cooldown",
                reason: "must not exceed the crash cooldown",
            });
        }
        Ok(())
    }
}

/// How mass storage visibility is toggled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsdConfig {
    /// Run a shell command for each transition.
    Scripts {
        /// Command exposing the device.
        on: String,
        /// Command withdrawing the device.
        off: String,
    },
    /// Only log transitions.
    Simulated,
}

impl Default for MsdConfig {
    fn default() -> Self {
        MsdConfig::Scripts {
            on: DEFAULT_MSD_ON.to_string(),
            off: DEFAULT_MSD_OFF.to_string(),
        }
    }
}

/// Log destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogSink {
    /// Standard error.
    Stderr,
    /// The kernel log, through `/dev/kmsg`.
    Kmsg,
}
