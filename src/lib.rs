//! Present a synthesized disk image to the host through the Linux NBD driver.
//!
//! A [`Supervisor`] forks one [`Session`] at a time. Each session binds a
//! socket pair to `/dev/nbdX`, then answers the kernel's block requests by
//! asking a [`BlockTranslator`] for one 512-byte sector at a time. No disk
//! image is ever materialized.

#![forbid(missing_docs)]

use std::io::Result;

mod attach;
mod error;
mod image;
mod io;
mod msd;
mod nbd;
mod server;
mod session;
mod supervisor;

pub mod config;

pub use error::{ConfigError, Error};
pub use image::MemoryImage;
pub use msd::{MassStorage, Scripts, Simulated};
pub use server::Server;
pub use session::Session;
pub use supervisor::{Outcome, Ready, Supervisor};

/// Size of one sector, the only block size this crate serves.
pub const SECTOR_SIZE: usize = 512;

/// `log2(SECTOR_SIZE)`, for turning byte offsets into sector indices.
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors appended to the device beyond the translator's region.
pub const EXTRA_SECTORS: u64 = 2048;

/// Source of the disk contents, addressed one sector at a time.
///
/// Within a single request the sector indices passed in are strictly
/// increasing.
pub trait BlockTranslator {
    /// Prepares the content generator. Called once at the start of every
    /// session, before the device is attached.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns the number of sectors backed by this translator.
    ///
    /// The device advertised to the kernel is [`EXTRA_SECTORS`] larger.
    fn sectors(&self) -> u64;

    /// Fills `buf` with the contents of sector `index`.
    ///
    /// # Note
    ///
    /// The reply header has already been sent when this runs, so a failure
    /// here ends the session.
    fn read_sector(&mut self, index: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    /// Accepts new contents for sector `index`.
    ///
    /// # Note
    ///
    /// A failure is reported to the kernel as the request's error code. If
    /// the error carries no OS `errno`, `EIO` is reported instead.
    fn write_sector(&mut self, index: u64, data: &[u8; SECTOR_SIZE]) -> Result<()>;
}

impl<T: BlockTranslator + ?Sized> BlockTranslator for &mut T {
    fn setup(&mut self) -> Result<()> {
        (**self).setup()
    }

    fn sectors(&self) -> u64 {
        (**self).sectors()
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        (**self).read_sector(index, buf)
    }

    fn write_sector(&mut self, index: u64, data: &[u8; SECTOR_SIZE]) -> Result<()> {
        (**self).write_sector(index, data)
    }
}

/// Number of sectors advertised to the kernel for a translator region of
/// `sectors` sectors.
pub fn device_sectors(sectors: u64) -> u64 {
    sectors + EXTRA_SECTORS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_is_padded_past_the_filesystem_region() {
        assert_eq!(device_sectors(8000), 10048);
        assert_eq!(device_sectors(0), EXTRA_SECTORS);
    }

    #[test]
    fn sector_shift_matches_sector_size() {
        assert_eq!(1usize << SECTOR_SHIFT, SECTOR_SIZE);
    }
}
