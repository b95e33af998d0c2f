//! Bevy compression off the writer's thread.
//!
//! A bevy is `chunks_in_segment` chunks of `chunk_size` bytes. The worker
//! compresses each chunk independently and writes two segments into the
//! image's volume:
//!
//! | Segment | Content |
//! | ------- | ------- |
//! | `<image>/NNNNNNNN` | compressed chunks back to back |
//! | `<image>/NNNNNNNN.idx` | u32 LE start offset per chunk, then `0xFFFFFFFF` |

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::error::{Aff4Error, Result};
use crate::hash;
use crate::resolver::{Mode, Resolver};
use crate::urn::attr;
use crate::zip::{self, Compression};

pub const INDEX_SENTINEL: u32 = 0xFFFF_FFFF;

const SLOT_WAIT: Duration = Duration::from_secs(10);

pub fn bevy_urn(image: &str, bevy: u64) -> String {
    format!("{}/{:08}", image, bevy)
}

pub fn index_urn(image: &str, bevy: u64) -> String {
    format!("{}/{:08}.idx", image, bevy)
}

/// Caps how many bevy workers run at once.
pub struct WorkerPool {
    running: Mutex<usize>,
    finished: Condvar,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(WorkerPool {
            running: Mutex::new(0),
            finished: Condvar::new(),
            limit: limit.max(1),
        })
    }

    /// Start `job` once a slot is free.
    pub fn spawn(self: &Arc<Self>, resolver: Resolver, job: BevyJob) -> Result<JoinHandle<Result<()>>> {
        {
            let mut running = self.running.lock();
            while *running >= self.limit {
                if self.finished.wait_for(&mut running, SLOT_WAIT).timed_out() {
                    debug!("Still waiting on {} bevy workers", *running);
                }
            }
            *running += 1;
        }

        let pool = self.clone();
        let name = format!("bevy-{}", job.bevy);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let res = job.run(&resolver);
            pool.done();
            res
        });

        match spawned {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.done();
                Err(e.into())
            }
        }
    }

    fn done(&self) {
        let mut running = self.running.lock();
        *running -= 1;
        self.finished.notify_all();
    }
}

pub struct BevyJob {
    pub image: String,
    pub bevy: u64,
    pub data: Vec<u8>,
    pub chunk_size: usize,
    pub chunks_in_segment: usize,
    pub compression: u32,
    pub sha256: bool,
}

// Offsets must fit below the sentinel
fn index_offset(image: &str, offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .filter(|&o| o != INDEX_SENTINEL)
        .ok_or_else(|| Aff4Error::format(format!("{}: bevy grew past 4 GiB at {}", image, offset)))
}

impl BevyJob {
    /// Compressed bevy and its index.
    pub fn compress(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.data.len() > self.chunk_size.saturating_mul(self.chunks_in_segment) {
            return Err(Aff4Error::Fatal(format!(
                "bevy {} of {} holds {} bytes, more than a bevy",
                self.bevy,
                self.image,
                self.data.len()
            )));
        }

        let mut bevy = Vec::with_capacity(self.data.len());
        let mut index = Vec::with_capacity(4 * (self.chunks_in_segment + 1));
        for chunk in self.data.chunks(self.chunk_size) {
            index.write_u32::<LittleEndian>(index_offset(&self.image, bevy.len())?)?;
            if self.compression == 0 {
                bevy.extend_from_slice(chunk);
            } else {
                bevy.extend_from_slice(&zip::deflate(chunk, self.compression)?);
            }
        }
        index.write_u32::<LittleEndian>(INDEX_SENTINEL)?;

        Ok((bevy, index))
    }

    pub fn run(self, resolver: &Resolver) -> Result<()> {
        let (bevy, index) = self.compress()?;
        let bevy_urn = bevy_urn(&self.image, self.bevy);

        // Looked up now, a volume spill may have moved the image
        let volume = resolver.require(&self.image, attr::STORED)?;
        {
            let mut handle = resolver.open(&volume, Mode::Write)?;
            let volume = handle.volume()?;
            volume.writestr(&bevy_urn, &bevy, Compression::Stored)?;
            volume.writestr(&index_urn(&self.image, self.bevy), &index, Compression::Stored)?;
        }

        if self.sha256 {
            resolver.set(&bevy_urn, attr::SHA256, hash::sha256_b64(&self.data));
        }
        trace!("{}: {} -> {} bytes", bevy_urn, self.data.len(), bevy.len());
        Ok(())
    }
}
