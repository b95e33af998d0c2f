use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;

use crate::backing::Backing;
use crate::error::{Aff4Error, Result};
use crate::resolver::{Mode, Resolver};
use crate::stream::{seek_position, Stream};
use crate::urn;

/// A local file.
pub struct FileBacking {
    urn: String,
    file: File,
    readptr: u64,
    mode: Mode,
}

impl FileBacking {
    pub fn open(_resolver: &Resolver, uri: &str, mode: Mode) -> Result<Self> {
        let path = urn::file_path(uri).ok_or_else(|| Aff4Error::NotFound(uri.to_string()))?;

        let file = match mode {
            Mode::Read => File::open(path)?,
            Mode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        debug!("Opened {} ({})", path, mode);

        Ok(FileBacking {
            urn: uri.to_string(),
            file,
            readptr: 0,
            mode,
        })
    }
}

impl Stream for FileBacking {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(self.readptr))?;
        let n = loop {
            match self.file.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.readptr += n as u64;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.mode != Mode::Write {
            return Err(Aff4Error::ReadOnly(self.urn.clone()));
        }
        self.file.seek(SeekFrom::Start(self.readptr))?;
        self.file.write_all(data)?;
        self.readptr += data.len() as u64;
        Ok(data.len())
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.readptr = seek_position(self.readptr, self.size(), pos)?;
        Ok(self.readptr)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.file.flush()?)
    }

    fn close(&mut self) -> Result<()> {
        if self.mode == Mode::Write {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl Backing for FileBacking {
    fn truncate(&mut self, len: u64) -> Result<()> {
        if self.mode == Mode::Write {
            self.file.set_len(len)?;
        }
        Ok(())
    }
}
