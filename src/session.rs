use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::info;

use crate::attach::Attachment;
use crate::error::{Error, Result};
use crate::server::Server;
use crate::{device_sectors, BlockTranslator};

/// One attach, serve, detach cycle of the virtual block device.
///
/// Owns everything the cycle needs: the translator, the device handle and
/// the user-space end of the channel. Nothing outlives the session.
#[derive(Debug)]
pub struct Session<T> {
    translator: T,
    attachment: Attachment,
    channel: UnixStream,
}

impl<T: BlockTranslator> Session<T> {
    /// Sets up the translator and binds it to the NBD device at `path`.
    ///
    /// The device is sized to the translator's sectors plus
    /// [`EXTRA_SECTORS`](crate::EXTRA_SECTORS). Once this returns the kernel
    /// is forwarding I/O on the device to this session.
    ///
    /// # Safety
    ///
    /// Forks the calling process and communicates with the NBD kernel module
    /// through ioctls.
    pub unsafe fn attach<P: AsRef<Path>>(path: P, mut translator: T) -> Result<Self> {
        translator.setup().map_err(Error::Setup)?;

        let sectors = device_sectors(translator.sectors());
        let (attachment, channel) = Attachment::bind(path.as_ref(), sectors)?;

        Ok(Self {
            translator,
            attachment,
            channel,
        })
    }

    /// Serves the device until the kernel disconnects it.
    pub fn run(self) -> Result<()> {
        let Self {
            translator,
            attachment,
            channel,
        } = self;

        info!("serving block requests");

        let mut server = Server::new(translator, channel);

        match server.serve() {
            Ok(()) => {
                drop(server);
                attachment.release()
            }
            Err(err) => {
                attachment.abort();
                Err(err)
            }
        }
    }
}
