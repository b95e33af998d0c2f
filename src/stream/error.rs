use std::io::SeekFrom;

use crate::error::{Aff4Error, Result};
use crate::resolver::{Mode, Resolver};
use crate::stream::{seek_position, Stream};
use crate::urn::{self, attr, config};

/// Stand-in for data that was never read.
///
/// Reads give zeros when padding is on (the stream's own `aff4:pad` or the
/// global `pad` knob), otherwise they fail.
pub struct ErrorStream {
    urn: String,
    pad: bool,
    readptr: u64,
}

impl ErrorStream {
    pub fn open(resolver: &Resolver, urn: &str, _mode: Mode) -> Result<Self> {
        let pad = resolver.resolve_bool(urn, attr::PAD) || resolver.resolve_bool(urn::GLOBAL, config::PAD);

        Ok(ErrorStream {
            urn: urn.to_string(),
            pad,
            readptr: 0,
        })
    }
}

impl Stream for ErrorStream {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.pad {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("read of unavailable data at {} in {}", self.readptr, self.urn),
            )
            .into());
        }
        buf.fill(0);
        self.readptr += buf.len() as u64;
        Ok(buf.len())
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Aff4Error::ReadOnly(self.urn.clone()))
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn size(&self) -> u64 {
        u64::MAX
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.readptr = seek_position(self.readptr, u64::MAX, pos)?;
        Ok(self.readptr)
    }
}
