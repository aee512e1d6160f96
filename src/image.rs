use std::io::{Error, ErrorKind, Result};

use tracing::debug;

use crate::{BlockTranslator, SECTOR_SIZE};

/// A zero-filled, RAM-backed disk image.
///
/// Stands in for a real content generator. Every session starts from a blank
/// image, and sectors past the end of the image read as zeros and silently
/// drop writes, the same way the padding behind a generated filesystem does.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    memory: Vec<u8>,
}

impl MemoryImage {
    /// Creates a blank image of `sectors` sectors.
    pub fn new(sectors: u64) -> Result<Self> {
        let bytes = usize::try_from(sectors)
            .ok()
            .and_then(|sectors| sectors.checked_mul(SECTOR_SIZE))
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "image too large"))?;

        Ok(Self {
            memory: vec![0; bytes],
        })
    }

    fn range(&self, index: u64) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(index).ok()?.checked_mul(SECTOR_SIZE)?;
        let end = start.checked_add(SECTOR_SIZE)?;

        (end <= self.memory.len()).then(|| start..end)
    }
}

impl BlockTranslator for MemoryImage {
    fn setup(&mut self) -> Result<()> {
        debug!(sectors = self.sectors(), "blanking memory image");

        self.memory.fill(0);

        Ok(())
    }

    fn sectors(&self) -> u64 {
        (self.memory.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        match self.range(index) {
            Some(range) => buf.copy_from_slice(&self.memory[range]),
            None => buf.fill(0),
        }

        Ok(())
    }

    fn write_sector(&mut self, index: u64, data: &[u8; SECTOR_SIZE]) -> Result<()> {
        if let Some(range) = self.range(index) {
            self.memory[range].copy_from_slice(data);
        }

        Ok(())
    }
}
