use std::io::SeekFrom;

use log::{debug, info};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;

use crate::backing::Backing;
use crate::buf::copy_at;
use crate::error::{Aff4Error, Result};
use crate::resolver::{Mode, Resolver};
use crate::stream::{seek_position, Stream};

/// A remote object read with ranged GETs.
///
/// Opening for write pulls the current body into memory; writes land in the
/// buffer and flush PUTs it back (webdav style).
pub struct HttpBacking {
    urn: String,
    client: Client,
    readptr: u64,
    size: u64,
    write_buf: Option<Vec<u8>>,
    dirty: bool,
}

impl HttpBacking {
    pub fn open(_resolver: &Resolver, uri: &str, mode: Mode) -> Result<Self> {
        let client = Client::builder().build()?;

        let mut backing = HttpBacking {
            urn: uri.to_string(),
            client,
            readptr: 0,
            size: 0,
            write_buf: None,
            dirty: false,
        };

        match mode {
            Mode::Read => backing.size = backing.fetch_size()?,
            Mode::Write => {
                let resp = backing.client.get(uri).send()?;
                let body = if resp.status() == StatusCode::NOT_FOUND {
                    Vec::new()
                } else {
                    resp.error_for_status()?.bytes()?.to_vec()
                };
                backing.size = body.len() as u64;
                backing.write_buf = Some(body);
            }
        }
        debug!("Opened {} ({}), {} bytes", uri, mode, backing.size);

        Ok(backing)
    }

    fn fetch_size(&self) -> Result<u64> {
        let resp = self.client.head(&self.urn).send()?.error_for_status()?;
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Aff4Error::format(format!("{} did not report a length", self.urn)))
    }
}

/// `Range` header value for `len` bytes at `offset`.
pub fn range_header(offset: u64, len: usize) -> String {
    format!("bytes={}-{}", offset, offset + len.max(1) as u64 - 1)
}

impl Stream for HttpBacking {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(data) = &self.write_buf {
            let n = copy_at(data, self.readptr as usize, buf);
            self.readptr += n as u64;
            return Ok(n);
        }

        if self.readptr >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.size - self.readptr) as usize);

        let resp = self
            .client
            .get(&self.urn)
            .header(RANGE, range_header(self.readptr, want))
            .send()?
            .error_for_status()?;

        // Servers without range support send the whole body
        let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        let body = resp.bytes()?;
        let n = if partial {
            copy_at(&body, 0, &mut buf[..want])
        } else {
            copy_at(&body, self.readptr as usize, &mut buf[..want])
        };

        self.readptr += n as u64;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let buf = self
            .write_buf
            .as_mut()
            .ok_or_else(|| Aff4Error::ReadOnly(self.urn.clone()))?;

        let start = self.readptr as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);

        self.readptr = end as u64;
        self.size = buf.len() as u64;
        self.dirty = true;
        Ok(data.len())
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

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(data) = &self.write_buf {
            info!("PUT {} ({} bytes)", self.urn, data.len());
            self.client
                .put(&self.urn)
                .body(data.clone())
                .send()?
                .error_for_status()?;
        }
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Backing for HttpBacking {
    fn truncate(&mut self, len: u64) -> Result<()> {
        if let Some(buf) = self.write_buf.as_mut() {
            if buf.len() as u64 > len {
                buf.truncate(len as usize);
                self.size = len;
                self.dirty = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_http {
    use super::*;

    #[test]
    fn range_values() {
        assert_eq!(range_header(0, 10), "bytes=0-9");
        assert_eq!(range_header(100, 1), "bytes=100-100");
        assert_eq!(range_header(5, 0), "bytes=5-5");
    }
}
