//! Complete-or-fail transfers over the session channel.
//!
//! These never hand back a partial transfer: either every byte moved or the
//! caller gets an error it is expected to treat as fatal for the session.

use std::io::{Error as IoError, ErrorKind, Read, Write};

use crate::error::{Error, Result};

/// Reads exactly `buf.len()` bytes.
///
/// End of stream before the buffer is full is reported as
/// [`Error::PeerClosed`] so callers can tell it apart from a failing read.
pub fn read_exact<R: Read + ?Sized>(reader: &mut R, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(len) => {
                let rest = buf;
                buf = &mut rest[len..];
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::Transfer(err)),
        }
    }

    Ok(())
}

/// Writes all of `buf`.
pub fn write_exact<W: Write + ?Sized>(writer: &mut W, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(Error::Transfer(IoError::from(ErrorKind::WriteZero)));
            }
            Ok(len) => buf = &buf[len..],
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::Transfer(err)),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per call and fails every other call
    /// with `Interrupted`.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
        interrupt: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(IoError::from(ErrorKind::Interrupted));
            }
            let len = buf.len().min(self.step);
            self.data.read(&mut buf[..len])
        }
    }

    struct Chunked {
        written: Vec<u8>,
        step: usize,
    }

    impl Write for Chunked {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let len = buf.len().min(self.step);
            self.written.extend_from_slice(&buf[..len]);
            Ok(len)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(IoError::from(ErrorKind::ConnectionReset))
        }
    }

    #[test]
    fn read_exact_collects_short_reads() {
        let mut reader = Trickle {
            data: Cursor::new((0..=99).collect()),
            step: 7,
            interrupt: false,
        };
        let mut buf = [0u8; 100];

        read_exact(&mut reader, &mut buf).unwrap();

        assert!(buf.iter().enumerate().all(|(i, b)| *b as usize == i));
    }

    #[test]
    fn read_exact_reports_eof_as_peer_closed() {
        let mut reader = Cursor::new(vec![1u8; 10]);
        let mut buf = [0u8; 16];

        assert!(matches!(
            read_exact(&mut reader, &mut buf),
            Err(Error::PeerClosed)
        ));
    }

    #[test]
    fn read_exact_reports_failures_as_transfer_errors() {
        let mut buf = [0u8; 4];

        match read_exact(&mut Broken, &mut buf) {
            Err(Error::Transfer(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn write_exact_pushes_everything() {
        let mut writer = Chunked {
            written: Vec::new(),
            step: 3,
        };

        write_exact(&mut writer, b"hello, block device").unwrap();

        assert_eq!(writer.written, b"hello, block device");
    }

    #[test]
    fn write_exact_rejects_zero_progress() {
        let mut writer = Chunked {
            written: Vec::new(),
            step: 0,
        };

        assert!(matches!(
            write_exact(&mut writer, b"x"),
            Err(Error::Transfer(_))
        ));
    }
}
