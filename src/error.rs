//! Error types for uf2d.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::supervisor::Outcome;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can end a session or a supervisor cycle.
///
/// None of these are recovered from inside a session: they travel up to the
/// supervisor, which turns them into an abnormal exit and a restart.
#[derive(Debug, Error)]
pub enum Error {
    /// An NBD or block-layer ioctl was rejected by the kernel.
    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        /// Name of the ioctl.
        name: &'static str,
        /// Errno reported by the kernel.
        source: Errno,
    },

    /// A request header did not carry the request magic.
    #[error("invalid request magic {0:#010x}")]
    BadMagic(u32),

    /// A request offset or length was not a whole number of sectors.
    #[error("request not sector aligned: offset {offset}, length {len}")]
    Misaligned {
        /// Byte offset from the request.
        offset: u64,
        /// Byte length from the request.
        len: u32,
    },

    /// A request carried a command this server does not implement.
    #[error("unknown request command {0}")]
    UnknownCommand(u32),

    /// The peer closed the channel in the middle of a transfer.
    #[error("channel closed mid-transfer")]
    PeerClosed,

    /// Reading or writing the channel failed.
    #[error("channel transfer failed: {0}")]
    Transfer(#[source] io::Error),

    /// The block translator could not produce or accept a sector.
    #[error("block translator failed on sector {index}: {source}")]
    Translator {
        /// Sector index being translated.
        index: u64,
        /// Underlying failure.
        source: io::Error,
    },

    /// The filesystem initializer failed.
    #[error("filesystem setup failed: {0}")]
    Setup(#[source] io::Error),

    /// Forking or reaping a process failed.
    #[error("{op} failed: {source}")]
    Process {
        /// The process operation that failed.
        op: &'static str,
        /// Errno reported by the kernel.
        source: Errno,
    },

    /// The process holding the kernel binding ended abnormally.
    #[error("kernel binding process ended with {0}")]
    Binder(Outcome),

    /// Any other I/O failure (opening the device node, socket pairs).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its valid range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}
