use nix::{errno::Errno, libc::c_ulong, libc::ioctl, request_code_none};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use zerocopy::byteorder::network_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

macro_rules! device_ioctl {
    ($name:ident, $ty:literal, $nr:literal $(, $arg:ident : $argty:ty)?) => {
        pub unsafe fn $name(file: &File $(, $arg: $argty)?) -> Result<()> {
            Errno::result(ioctl(file.as_raw_fd(), request_code_none!($ty, $nr) $(, $arg)?))
                .map(drop)
                .map_err(|source| Error::Ioctl {
                    name: stringify!($name),
                    source,
                })
        }
    };
}

device_ioctl!(set_sock, 0xab, 0, sock: RawFd);
device_ioctl!(set_blksize, 0xab, 1, blksize: c_ulong);
device_ioctl!(do_it, 0xab, 3);
device_ioctl!(clear_sock, 0xab, 4);
device_ioctl!(clear_que, 0xab, 5);
device_ioctl!(set_size_blocks, 0xab, 7, size_blocks: c_ulong);
device_ioctl!(disconnect, 0xab, 8);

// BLKFLSBUF from linux/fs.h
device_ioctl!(flush_buffers, 0x12, 97);

pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const REPLY_MAGIC: u32 = 0x6744_6698;

const CMD_READ: u32 = 0;
const CMD_WRITE: u32 = 1;
const CMD_DISC: u32 = 2;

/// Request header as the kernel sends it, all fields big endian.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
pub struct Request {
    magic: U32,
    kind: U32,
    handle: [u8; 8],
    from: U64,
    len: U32,
}

pub const REQUEST_LEN: usize = std::mem::size_of::<Request>();

/// A validated request, with byte ranges already turned into sectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Read { sector: u64, count: u32 },
    Write { sector: u64, count: u32 },
    Disconnect,
}

impl Request {
    pub fn decode(bytes: &[u8; REQUEST_LEN]) -> Self {
        let mut request = Self::new_zeroed();
        request.as_bytes_mut().copy_from_slice(bytes);
        request
    }

    pub fn handle(&self) -> [u8; 8] {
        self.handle
    }

    pub fn new_reply_for_request(&self) -> Reply {
        Reply {
            magic: U32::new(REPLY_MAGIC),
            error: U32::new(0),
            handle: self.handle,
        }
    }

    /// Checks magic and alignment, then maps the command type.
    pub fn command(&self) -> Result<Command> {
        let magic = self.magic.get();
        if magic != REQUEST_MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let (offset, len) = (self.from.get(), self.len.get());
        if offset % SECTOR_SIZE as u64 != 0 || len % SECTOR_SIZE as u32 != 0 {
            return Err(Error::Misaligned { offset, len });
        }

        let (sector, count) = (offset >> SECTOR_SHIFT, len >> SECTOR_SHIFT);

        match self.kind.get() {
            CMD_READ => Ok(Command::Read { sector, count }),
            CMD_WRITE => Ok(Command::Write { sector, count }),
            CMD_DISC => Ok(Command::Disconnect),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
impl Request {
    pub fn new(kind: u32, handle: [u8; 8], from: u64, len: u32) -> Self {
        Self {
            magic: U32::new(REQUEST_MAGIC),
            kind: U32::new(kind),
            handle,
            from: U64::new(from),
            len: U32::new(len),
        }
    }

    pub fn set_magic(&mut self, magic: u32) {
        self.magic = U32::new(magic);
    }
}

/// Reply header; the read payload follows it on the wire.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
pub struct Reply {
    magic: U32,
    error: U32,
    handle: [u8; 8],
}

#[cfg(test)]
pub const REPLY_LEN: usize = std::mem::size_of::<Reply>();

impl Reply {
    pub fn set_errno(&mut self, errno: i32) {
        self.error = U32::new(errno as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HANDLE: [u8; 8] = *b"\x01\x02\x03\x04\xfe\xfd\xfc\xfb";

    #[test]
    fn header_sizes_match_the_kernel() {
        assert_eq!(REQUEST_LEN, 28);
        assert_eq!(REPLY_LEN, 16);
    }

    #[test]
    fn decodes_network_byte_order() {
        let mut raw = [0u8; REQUEST_LEN];
        raw[0..4].copy_from_slice(&[0x25, 0x60, 0x95, 0x13]);
        raw[4..8].copy_from_slice(&[0, 0, 0, 1]);
        raw[8..16].copy_from_slice(&HANDLE);
        raw[16..24].copy_from_slice(&0x0000_0001_0000_0400u64.to_be_bytes());
        raw[24..28].copy_from_slice(&[0, 0, 0x10, 0]);

        let request = Request::decode(&raw);

        assert_eq!(request.handle(), HANDLE);
        assert_eq!(
            request.command().unwrap(),
            Command::Write {
                sector: 0x0000_0001_0000_0400 >> 9,
                count: 8,
            }
        );
    }

    #[test]
    fn reply_copies_handle_and_encodes_big_endian() {
        let request = Request::new(CMD_READ, HANDLE, 0, 512);
        let mut reply = request.new_reply_for_request();
        reply.set_errno(5);

        let bytes = reply.as_bytes();
        assert_eq!(&bytes[0..4], &[0x67, 0x44, 0x66, 0x98]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 5]);
        assert_eq!(&bytes[8..16], &HANDLE);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut request = Request::new(CMD_READ, HANDLE, 0, 512);
        request.set_magic(0xdead_beef);

        assert!(matches!(request.command(), Err(Error::BadMagic(0xdead_beef))));
    }

    #[test]
    fn rejects_misaligned_ranges() {
        let offset = Request::new(CMD_READ, HANDLE, 100, 512);
        let len = Request::new(CMD_WRITE, HANDLE, 512, 513);

        assert!(matches!(
            offset.command(),
            Err(Error::Misaligned { offset: 100, .. })
        ));
        assert!(matches!(len.command(), Err(Error::Misaligned { len: 513, .. })));
    }

    #[test]
    fn rejects_unknown_commands() {
        let flush = Request::new(3, HANDLE, 0, 0);

        assert!(matches!(flush.command(), Err(Error::UnknownCommand(3))));
    }

    #[test]
    fn maps_disconnect() {
        let request = Request::new(CMD_DISC, HANDLE, 0, 0);

        assert_eq!(request.command().unwrap(), Command::Disconnect);
    }
}
