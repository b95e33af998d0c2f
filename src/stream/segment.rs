use std::io::SeekFrom;

use crate::buf::copy_at;
use crate::error::{Aff4Error, Result};
use crate::hash;
use crate::resolver::{Mode, Resolver, WeakResolver};
use crate::stream::{seek_position, Stream};
use crate::urn::attr;
use crate::zip::{self, Compression};

/// One zip entry of a volume, read only.
pub struct Segment {
    urn: String,
    resolver: WeakResolver,
    backing: String,
    file_offset: u64,
    compressed_size: u64,
    size: u64,
    compression: Compression,
    crc32: u32,
    readptr: u64,
    // Deflated segments are inflated once on first read
    inflated: Option<Vec<u8>>,
}

impl Segment {
    pub fn open(resolver: &Resolver, urn: &str, mode: Mode) -> Result<Self> {
        if mode == Mode::Write {
            return Err(Aff4Error::ReadOnly(urn.to_string()));
        }

        let volume = resolver.require(urn, attr::STORED)?;
        let backing = resolver.require(&volume, attr::STORED)?;
        let method = resolver.require_u64(urn, attr::COMPRESSION_METHOD)?;

        Ok(Segment {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
            backing,
            file_offset: resolver.require_u64(urn, attr::FILE_OFFSET)?,
            compressed_size: resolver.require_u64(urn, attr::COMPRESSED_SIZE)?,
            size: resolver.require_u64(urn, attr::SIZE)?,
            compression: Compression::from_method(method as u16)?,
            crc32: resolver.require_u64(urn, attr::CRC32)? as u32,
            readptr: 0,
            inflated: None,
        })
    }

    fn read_raw(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let resolver = self.resolver.upgrade()?;
        let mut handle = resolver.open(&self.backing, Mode::Read)?;
        let data = handle.backing()?.read_at(self.file_offset + offset, len)?;

        if data.len() < len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} is truncated", self.urn),
            )
            .into());
        }
        Ok(data)
    }

    fn check_crc(&self, data: &[u8]) -> Result<()> {
        if hash::crc32(data) != self.crc32 {
            return Err(Aff4Error::IntegrityError(format!("crc mismatch on {}", self.urn)));
        }
        Ok(())
    }

    fn inflated(&mut self) -> Result<&[u8]> {
        if self.inflated.is_none() {
            let raw = self.read_raw(0, self.compressed_size as usize)?;
            let data = zip::inflate(&raw, self.size as usize)?;
            self.check_crc(&data)?;
            self.inflated = Some(data);
        }
        Ok(self.inflated.as_deref().unwrap_or_default())
    }
}

impl Stream for Segment {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.readptr >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let n = match self.compression {
            Compression::Stored => {
                let len = buf.len().min((self.size - self.readptr) as usize);
                let data = self.read_raw(self.readptr, len)?;
                if self.readptr == 0 && len as u64 == self.size {
                    self.check_crc(&data)?;
                }
                buf[..len].copy_from_slice(&data);
                len
            }
            Compression::Deflated => {
                let readptr = self.readptr as usize;
                copy_at(self.inflated()?, readptr, buf)
            }
        };

        self.readptr += n as u64;
        Ok(n)
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.readptr = seek_position(self.readptr, self.size, pos)?;
        Ok(self.readptr)
    }
}

#[cfg(test)]
mod test_segment {
    use super::*;
    use crate::volume;

    fn setup(compression: Compression, data: &[u8]) -> (tempfile::TempDir, Resolver, String) {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("s.aff4").display());
        let r = Resolver::new();
        let v = volume::create(&r, &uri).unwrap();

        let subject = format!("{}/seg", v);
        r.open(&v, Mode::Write).unwrap().volume().unwrap()
            .writestr(&subject, data, compression).unwrap();
        (dir, r, subject)
    }

    #[test]
    fn stored_seek_and_read() {
        let (_dir, r, subject) = setup(Compression::Stored, b"0123456789");
        let mut h = r.open(&subject, Mode::Read).unwrap();
        let s = h.stream().unwrap();

        assert_eq!(s.size(), 10);
        assert_eq!(s.read_at(3, 4).unwrap(), b"3456");
        assert_eq!(s.tell(), 7);
        s.seek(SeekFrom::End(-2)).unwrap();
        assert_eq!(s.read_to_vec(10).unwrap(), b"89");
        assert_eq!(s.read_to_vec(10).unwrap(), b"");
    }

    #[test]
    fn deflated_reads_from_cache() {
        let data = b"the quick brown fox ".repeat(100);
        let (_dir, r, subject) = setup(Compression::Deflated, &data);
        assert!(r.resolve_u64(&subject, attr::COMPRESSED_SIZE).unwrap() < data.len() as u64);

        let mut h = r.open(&subject, Mode::Read).unwrap();
        let s = h.stream().unwrap();
        assert_eq!(s.read_at(1000, 20).unwrap(), &data[1000..1020]);
        assert_eq!(s.read_at(0, data.len()).unwrap(), data);
    }

    #[test]
    fn crc_mismatch_is_an_integrity_error() {
        let (_dir, r, subject) = setup(Compression::Deflated, b"payload payload payload");
        r.set(&subject, attr::CRC32, 1);

        let mut h = r.open(&subject, Mode::Read).unwrap();
        let err = h.stream().unwrap().read_to_vec(5).unwrap_err();
        assert!(matches!(err, Aff4Error::IntegrityError(_)));
    }

    #[test]
    fn segments_are_read_only() {
        let (_dir, r, subject) = setup(Compression::Stored, b"x");
        assert!(matches!(r.open(&subject, Mode::Write), Err(Aff4Error::ReadOnly(_))));
    }
}
