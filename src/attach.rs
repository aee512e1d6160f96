use nix::errno::Errno;
use nix::libc::{self, c_ulong};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind};
use std::os::unix::{io::AsRawFd, net::UnixStream};
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::supervisor::wait;
use crate::{nbd, SECTOR_SIZE};

/// The kernel side of one session: the open device node and the process
/// blocked in `NBD_DO_IT` on its behalf.
#[derive(Debug)]
pub struct Attachment {
    device: File,
    binder: Pid,
}

impl Attachment {
    /// Configures the device at `path` for `sectors` sectors and hands one end
    /// of a fresh socket pair to the kernel. The other end is returned for
    /// the server loop.
    ///
    /// # Safety
    ///
    /// Forks the calling process and communicates with the NBD kernel module
    /// through ioctls.
    pub unsafe fn bind(path: &Path, sectors: u64) -> Result<(Self, UnixStream)> {
        let (channel, kernel_socket) = UnixStream::pair()?;

        let device = OpenOptions::new().read(true).write(true).open(path)?;

        let size_blocks = c_ulong::try_from(sectors)
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, "device too large"))?;

        nbd::flush_buffers(&device)?;
        nbd::set_blksize(&device, SECTOR_SIZE as c_ulong)?;
        nbd::set_size_blocks(&device, size_blocks)?;
        nbd::clear_sock(&device)?;

        info!(device = %path.display(), sectors, "device configured");

        match fork().map_err(|source| Error::Process { op: "fork", source })? {
            ForkResult::Child => {
                drop(channel);

                let status = match hold_binding(&device, &kernel_socket) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!(error = %err, "kernel binding failed");
                        1
                    }
                };

                libc::_exit(status)
            }
            ForkResult::Parent { child } => {
                drop(kernel_socket);

                // Some kernels only finish activating the device once it has
                // been opened again after NBD_SET_SOCK.
                drop(File::open(path)?);

                debug!(binder = %child, "kernel binding started");

                Ok((Self { device, binder: child }, channel))
            }
        }
    }

    /// Waits for the binding process once the server loop has closed its
    /// end of the channel.
    pub fn release(self) -> Result<()> {
        let outcome = wait(self.binder)?;

        if outcome.is_clean() {
            debug!(binder = %self.binder, "kernel binding released");
            Ok(())
        } else {
            Err(Error::Binder(outcome))
        }
    }

    /// Asks the kernel to drop the device after a failed session.
    pub fn abort(&self) {
        // Best effort: the session is already failing and its exit closes
        // the channel either way.
        if let Err(err) = unsafe { nbd::disconnect(&self.device) } {
            warn!(error = %err, "forced disconnect failed");
        }
    }
}

/// Runs in the forked binder: blocks in the kernel until the device goes
/// away, then clears the device state.
unsafe fn hold_binding(device: &File, socket: &UnixStream) -> Result<()> {
    nbd::set_sock(device, socket.as_raw_fd())?;

    let served = nbd::do_it(device);

    // Nothing meaningful can be done if these fail; the next session clears
    // the socket again before binding.
    let _ = nbd::clear_que(device);
    let _ = nbd::clear_sock(device);

    match served {
        Err(Error::Ioctl {
            source: Errno::ENOTCONN,
            ..
        }) => Ok(()),
        other => other,
    }
}
