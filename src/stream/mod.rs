//! Byte streams exposed by the objects of a volume.

pub mod encrypted;
pub mod error;
pub mod image;
pub mod link;
pub mod map;
pub mod segment;
mod worker;

use std::io::SeekFrom;

use crate::error::{Aff4Error, Result};

pub use encrypted::Encrypted;
pub use error::ErrorStream;
pub use image::Image;
pub use link::Link;
pub use map::Map;
pub use segment::Segment;

pub trait Stream: Send {
    fn urn(&self) -> &str;

    /// Read at the current position, 0 means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Aff4Error::ReadOnly(self.urn().to_string()))
    }

    fn tell(&self) -> u64;

    fn size(&self) -> u64;

    /// Move the read pointer, positions past the end are allowed.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        false
    }

    /// Read up to `len` bytes, short only at the end of the stream.
    fn read_to_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        let mut filled = 0;
        while filled < len {
            match self.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_to_vec(len)
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => return Err(Aff4Error::Fatal(format!("{} accepted no data", self.urn()))),
                n => data = &data[n..],
            }
        }
        Ok(())
    }
}

/// Resolve a [`SeekFrom`] against a stream position and size.
pub fn seek_position(current: u64, size: u64, pos: SeekFrom) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(p) => Some(p),
        SeekFrom::Current(d) => current.checked_add_signed(d),
        SeekFrom::End(d) => size.checked_add_signed(d),
    };
    target.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start of stream").into()
    })
}

/// [`std::io::Read`] over a stream, for `io::copy` and friends.
pub struct Reader<'a>(pub &'a mut dyn Stream);

impl std::io::Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.0.read(buf)?)
    }
}

#[cfg(test)]
mod test_seek {
    use super::*;

    #[test]
    fn positions() {
        assert_eq!(seek_position(5, 10, SeekFrom::Start(3)).unwrap(), 3);
        assert_eq!(seek_position(5, 10, SeekFrom::Current(-2)).unwrap(), 3);
        assert_eq!(seek_position(5, 10, SeekFrom::End(-1)).unwrap(), 9);
        assert_eq!(seek_position(5, 10, SeekFrom::End(4)).unwrap(), 14);
        assert!(seek_position(5, 10, SeekFrom::Current(-6)).is_err());
    }
}
