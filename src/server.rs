use nix::errno::Errno::EIO;
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, info, warn};
use zerocopy::AsBytes;

use crate::error::{Error, Result};
use crate::io::{read_exact, write_exact};
use crate::nbd::{self, Command, Request};
use crate::{BlockTranslator, SECTOR_SIZE};

/// Answers kernel block requests from a [`BlockTranslator`].
///
/// Requests are handled one at a time, in the order they arrive. Payloads
/// move through a single sector buffer no matter how long the request is.
pub struct Server<T, S> {
    translator: T,
    channel: S,
    sector: [u8; SECTOR_SIZE],
}

impl<T: BlockTranslator, S: Read + Write> Server<T, S> {
    /// Creates a server speaking on `channel`.
    pub fn new(translator: T, channel: S) -> Self {
        Self {
            translator,
            channel,
            sector: [0; SECTOR_SIZE],
        }
    }

    /// Serves requests until the peer disconnects or closes the channel.
    ///
    /// A failed read while waiting for the next request is logged and
    /// retried. Anything else that goes wrong ends the loop with an error.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            let mut header = [0u8; nbd::REQUEST_LEN];

            let len = match self.channel.read(&mut header) {
                Ok(0) => {
                    info!("channel closed by peer");
                    return Ok(());
                }
                Ok(len) => len,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "failed to read next request");
                    continue;
                }
            };

            read_exact(&mut self.channel, &mut header[len..])?;

            let request = Request::decode(&header);

            match request.command()? {
                Command::Read { sector, count } => self.read(&request, sector, count)?,
                Command::Write { sector, count } => self.write(&request, sector, count)?,
                Command::Disconnect => {
                    info!("disconnect requested");
                    return Ok(());
                }
            }
        }
    }

    /// Consumes the server, returning the translator and channel.
    pub fn into_inner(self) -> (T, S) {
        (self.translator, self.channel)
    }

    fn read(&mut self, request: &Request, sector: u64, count: u32) -> Result<()> {
        debug!(handle = ?request.handle(), sector, count, "read");

        let reply = request.new_reply_for_request();
        write_exact(&mut self.channel, reply.as_bytes())?;

        for index in sector..sector + u64::from(count) {
            self.translator
                .read_sector(index, &mut self.sector)
                .map_err(|source| Error::Translator { index, source })?;

            write_exact(&mut self.channel, &self.sector)?;
        }

        Ok(())
    }

    fn write(&mut self, request: &Request, sector: u64, count: u32) -> Result<()> {
        debug!(handle = ?request.handle(), sector, count, "write");

        let mut reply = request.new_reply_for_request();
        let mut failed = None;

        for index in sector..sector + u64::from(count) {
            read_exact(&mut self.channel, &mut self.sector)?;

            if let Err(err) = self.translator.write_sector(index, &self.sector) {
                warn!(index, error = %err, "sector write failed");
                failed.get_or_insert(err.raw_os_error().unwrap_or(EIO as i32));
            }
        }

        if let Some(errno) = failed {
            reply.set_errno(errno);
        }

        write_exact(&mut self.channel, reply.as_bytes())
    }
}
