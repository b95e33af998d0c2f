//! Chunked, compressed, random access images.
//!
//! Writes fill one bevy at a time and hand full bevies to a
//! [`WorkerPool`](super::worker::WorkerPool); reads pull single chunks back
//! through the bevy index and keep recently used ones in an LRU.

use std::io::SeekFrom;
use std::mem;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error};
use lru::LruCache;

use super::worker::{self, BevyJob, WorkerPool, INDEX_SENTINEL};
use crate::buf::copy_at;
use crate::error::{Aff4Error, Result};
use crate::resolver::{Handle, Mode, Resolver, WeakResolver};
use crate::stream::{seek_position, Stream};
use crate::urn::{attr, config, types};
use crate::zip;

pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024;
pub const DEFAULT_CHUNKS_IN_SEGMENT: u64 = 2048;
pub const SHA256: &str = "sha256";

const CHUNK_CACHE: usize = 32;

#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub chunk_size: u64,
    pub chunks_in_segment: u64,
    /// 0 stores chunks, 1..=9 is the deflate level
    pub compression: u32,
    /// Hash each bevy into `aff4:sha256`
    pub sha256: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_in_segment: DEFAULT_CHUNKS_IN_SEGMENT,
            compression: 1,
            sha256: false,
        }
    }
}

pub struct Image {
    urn: String,
    resolver: WeakResolver,
    mode: Mode,
    chunk_size: u64,
    chunks_in_segment: u64,
    bevy_size: usize,
    compression: u32,
    sha256: bool,
    size: u64,
    readptr: u64,

    // Write side
    buffer: Vec<u8>,
    bevy_number: u64,
    pool: Arc<WorkerPool>,
    workers: Vec<JoinHandle<Result<()>>>,
    dirty: bool,

    // Read side
    chunks: LruCache<u64, Vec<u8>>,
}

impl Image {
    /// New image `urn` stored in `volume`, opened for writing.
    pub fn create(resolver: &Resolver, volume: &str, urn: &str, options: &ImageOptions) -> Result<Handle> {
        if options.chunk_size == 0 || options.chunks_in_segment == 0 {
            return Err(Aff4Error::format("image chunks can not be empty"));
        }

        resolver.set(urn, attr::TYPE, types::IMAGE);
        resolver.set(urn, attr::INTERFACE, types::STREAM);
        resolver.set(urn, attr::STORED, volume);
        resolver.set(urn, attr::CHUNK_SIZE, options.chunk_size);
        resolver.set(urn, attr::CHUNKS_IN_SEGMENT, options.chunks_in_segment);
        resolver.set(urn, attr::COMPRESSION, options.compression.min(9));
        if options.sha256 {
            resolver.set(urn, attr::HASH_TYPE, SHA256);
        }
        resolver.set(urn, attr::DIRTY, 1);
        resolver.add(volume, attr::CONTAINS, urn);

        resolver.open(urn, Mode::Write)
    }

    pub fn open(resolver: &Resolver, urn: &str, mode: Mode) -> Result<Self> {
        let chunk_size = resolver.resolve_u64(urn, attr::CHUNK_SIZE).unwrap_or(DEFAULT_CHUNK_SIZE);
        let chunks_in_segment = resolver
            .resolve_u64(urn, attr::CHUNKS_IN_SEGMENT)
            .unwrap_or(DEFAULT_CHUNKS_IN_SEGMENT);
        if chunk_size == 0 || chunks_in_segment == 0 {
            return Err(Aff4Error::format(format!("{} has empty chunks", urn)));
        }
        let bevy_size = chunk_size
            .checked_mul(chunks_in_segment)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|&n| n as u64 <= u32::MAX as u64)
            .ok_or_else(|| Aff4Error::format(format!("{}: bevies of {} x {} bytes are too large", urn, chunks_in_segment, chunk_size)))?;

        let size = resolver.resolve_u64(urn, attr::SIZE).unwrap_or(0);
        if mode == Mode::Write && size > 0 {
            return Err(Aff4Error::ReadOnly(format!("{} (already finished)", urn)));
        }

        let threads = resolver.config_u64(config::THREADS, 1) as usize;

        Ok(Image {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
            mode,
            chunk_size,
            chunks_in_segment,
            bevy_size,
            compression: resolver.resolve_u64(urn, attr::COMPRESSION).unwrap_or(1).min(9) as u32,
            sha256: resolver.resolve(urn, attr::HASH_TYPE).as_deref() == Some(SHA256),
            size,
            readptr: 0,
            buffer: Vec::new(),
            bevy_number: 0,
            pool: WorkerPool::new(threads),
            workers: Vec::new(),
            dirty: mode == Mode::Write,
            chunks: LruCache::new(NonZeroUsize::new(CHUNK_CACHE).unwrap_or(NonZeroUsize::MIN)),
        })
    }


    // Hand the buffered bevy to a worker
    fn dispatch(&mut self, resolver: &Resolver) -> Result<()> {
        if resolver.has_deferred() {
            // Let running bevies land before a volume spill moves us
            self.join_workers()?;
            resolver.run_deferred()?;
        }
        self.reap()?;

        let bevy_size = self.bevy_size;
        let job = BevyJob {
            image: self.urn.clone(),
            bevy: self.bevy_number,
            data: mem::replace(&mut self.buffer, Vec::with_capacity(bevy_size)),
            chunk_size: self.chunk_size as usize,
            chunks_in_segment: self.chunks_in_segment as usize,
            compression: self.compression,
            sha256: self.sha256,
        };
        self.bevy_number += 1;

        let handle = self.pool.spawn(resolver.clone(), job)?;
        self.workers.push(handle);
        Ok(())
    }

    // Collect workers that already finished, surfacing their errors
    fn reap(&mut self) -> Result<()> {
        let (done, running): (Vec<_>, Vec<_>) = mem::take(&mut self.workers)
            .into_iter()
            .partition(|h| h.is_finished());
        self.workers = running;

        for handle in done {
            join(handle)?;
        }
        Ok(())
    }

    fn join_workers(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in mem::take(&mut self.workers) {
            if let Err(e) = join(handle) {
                error!("Bevy worker for {} failed: {}", self.urn, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn load_chunk(&self, chunk_id: u64) -> Result<Vec<u8>> {
        let resolver = self.resolver.upgrade()?;
        let bevy = chunk_id / self.chunks_in_segment;
        let chunk_in_bevy = chunk_id % self.chunks_in_segment;

        let mut index = resolver.open(&worker::index_urn(&self.urn, bevy), Mode::Read)?;
        let entry = index.stream()?.read_at(4 * chunk_in_bevy, 8)?;
        if entry.len() < 8 {
            return Err(Aff4Error::format(format!(
                "{}: chunk {} is past the end of the bevy index",
                self.urn, chunk_id
            )));
        }
        let start = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let end = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
        drop(index);

        let mut segment = resolver.open(&worker::bevy_urn(&self.urn, bevy), Mode::Read)?;
        let segment = segment.stream()?;
        let end = if end == INDEX_SENTINEL { segment.size() } else { end as u64 };
        if end < start as u64 {
            return Err(Aff4Error::format(format!("{}: bevy {} index is not ascending", self.urn, bevy)));
        }

        let data = segment.read_at(start as u64, (end - start as u64) as usize)?;
        if self.compression == 0 {
            Ok(data)
        } else {
            zip::inflate(&data, self.chunk_size as usize)
        }
    }
}

fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .map_err(|_| Aff4Error::Fatal("bevy worker panicked".to_string()))?
}

impl Stream for Image {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.readptr >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - self.readptr) as usize);

        let mut total = 0;
        while total < want {
            let chunk_id = self.readptr / self.chunk_size;
            let offset = (self.readptr % self.chunk_size) as usize;

            if !self.chunks.contains(&chunk_id) {
                let chunk = self.load_chunk(chunk_id)?;
                self.chunks.put(chunk_id, chunk);
            }
            let n = match self.chunks.get(&chunk_id) {
                Some(chunk) => copy_at(chunk, offset, &mut buf[total..want]),
                None => 0,
            };
            if n == 0 {
                break;
            }

            total += n;
            self.readptr += n as u64;
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.mode != Mode::Write || !self.dirty {
            return Err(Aff4Error::ReadOnly(self.urn.clone()));
        }
        let resolver = self.resolver.upgrade()?;
        let bevy_size = self.bevy_size;

        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(bevy_size - self.buffer.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.buffer.len() == bevy_size {
                self.dispatch(&resolver)?;
            }
        }

        self.size += data.len() as u64;
        self.readptr = self.size;
        Ok(data.len())
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = seek_position(self.readptr, self.size, pos)?;
        if self.mode == Mode::Write && self.dirty && target != self.size {
            return Err(Aff4Error::ReadOnly(format!("{} only appends while writing", self.urn)));
        }
        self.readptr = target;
        Ok(self.readptr)
    }

    /// Push out the last bevy and wait for every worker.
    fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write || !self.dirty {
            return Ok(());
        }
        let resolver = self.resolver.upgrade()?;

        if !self.buffer.is_empty() {
            self.dispatch(&resolver)?;
        }
        let res = self.join_workers();

        resolver.set(&self.urn, attr::SIZE, self.size);
        resolver.set(&self.urn, attr::DIRTY, 0);
        resolver.invalidate(&self.urn);
        self.dirty = false;
        debug!("Closed image {}: {} bytes in {} bevies", self.urn, self.size, self.bevy_number);
        res
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod test_image {
    use super::*;
    use crate::urn;
    use crate::volume;

    fn setup() -> (tempfile::TempDir, Resolver, String) {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("i.aff4").display());
        let r = Resolver::new();
        let v = volume::create(&r, &uri).unwrap();
        (dir, r, v)
    }

    fn small() -> ImageOptions {
        ImageOptions {
            chunk_size: 16,
            chunks_in_segment: 2,
            compression: 9,
            sha256: false,
        }
    }

    #[test]
    fn write_then_read_in_session() {
        let (_dir, r, v) = setup();
        let image = urn::fresh();
        let data: Vec<u8> = (0..200u8).collect();

        let mut h = Image::create(&r, &v, &image, &small()).unwrap();
        h.image().unwrap().write_all(&data).unwrap();
        assert_eq!(h.image().unwrap().size(), 200);
        h.close().unwrap();

        assert_eq!(r.resolve_u64(&image, attr::SIZE), Some(200));
        // 200 bytes over 32 byte bevies
        assert!(r.resolve(&worker::bevy_urn(&image, 6), attr::SIZE).is_some());
        assert!(r.resolve(&worker::bevy_urn(&image, 7), attr::SIZE).is_none());

        let mut h = r.open(&image, Mode::Read).unwrap();
        let s = h.stream().unwrap();
        assert_eq!(s.read_to_vec(1000).unwrap(), data);

        // Across chunk and bevy boundaries
        for (start, len) in [(15, 2), (31, 3), (0, 64), (190, 20), (47, 100)] {
            let end = (start + len).min(200);
            assert_eq!(s.read_at(start as u64, len).unwrap(), &data[start..end]);
        }
    }

    #[test]
    fn bevies_past_the_index_range_are_refused() {
        let (_dir, r, _v) = setup();
        let image = urn::fresh();
        r.set(&image, attr::TYPE, types::IMAGE);
        r.set(&image, attr::CHUNK_SIZE, u64::MAX / 2);
        r.set(&image, attr::CHUNKS_IN_SEGMENT, 4);
        assert!(matches!(r.open(&image, Mode::Read), Err(Aff4Error::FormatError(_))));

        r.set(&image, attr::CHUNK_SIZE, 1 << 20);
        r.set(&image, attr::CHUNKS_IN_SEGMENT, 1 << 13);
        assert!(r.open(&image, Mode::Read).is_err());

        r.set(&image, attr::CHUNKS_IN_SEGMENT, 8);
        assert!(r.open(&image, Mode::Read).is_ok());
    }

    #[test]
    fn stored_chunks_and_hashes() {
        let (_dir, r, v) = setup();
        let image = urn::fresh();
        let options = ImageOptions {
            compression: 0,
            sha256: true,
            ..small()
        };

        let mut h = Image::create(&r, &v, &image, &options).unwrap();
        h.image().unwrap().write_all(&[7u8; 40]).unwrap();
        h.close().unwrap();

        let bevy = worker::bevy_urn(&image, 0);
        assert_eq!(r.resolve_u64(&bevy, attr::SIZE), Some(32));
        assert_eq!(
            r.resolve(&bevy, attr::SHA256),
            Some(crate::hash::sha256_b64(&[7u8; 32]))
        );
        assert_eq!(r.resolve_u64(&worker::index_urn(&image, 1), attr::SIZE), Some(8));
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, r, v) = setup();
        let image = urn::fresh();

        let mut h = Image::create(&r, &v, &image, &small()).unwrap();
        h.image().unwrap().write_all(b"abc").unwrap();
        let img = h.image().unwrap();
        img.close().unwrap();
        img.close().unwrap();
        assert!(img.write(b"more").is_err());
        assert_eq!(r.resolve_u64(&image, attr::SIZE), Some(3));
    }

    #[test]
    fn direct_close_drops_stale_readers() {
        let (_dir, r, v) = setup();
        let image = urn::fresh();

        let mut h = Image::create(&r, &v, &image, &small()).unwrap();
        h.image().unwrap().write_all(b"abc").unwrap();
        // A reader taken mid-write sees nothing yet and goes back to the cache
        assert_eq!(r.open(&image, Mode::Read).unwrap().stream().unwrap().size(), 0);

        h.image().unwrap().close().unwrap();
        drop(h);

        let mut reader = r.open(&image, Mode::Read).unwrap();
        let s = reader.stream().unwrap();
        assert_eq!(s.size(), 3);
        assert_eq!(s.read_at(0, 10).unwrap(), b"abc");
    }

    #[test]
    fn finished_images_do_not_reopen_for_write() {
        let (_dir, r, v) = setup();
        let image = urn::fresh();
        Image::create(&r, &v, &image, &small()).unwrap().close().unwrap();
        r.set(&image, attr::SIZE, 10);

        // Drop the cached writer so the next open constructs
        let cached = r.open(&image, Mode::Write).unwrap();
        cached.discard();
        assert!(Image::open(&r, &image, Mode::Write).is_err());
    }

    #[test]
    fn threaded_workers() {
        let (_dir, r, v) = setup();
        r.set(urn::GLOBAL, config::THREADS, 4);
        let image = urn::fresh();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();

        let mut h = Image::create(&r, &v, &image, &small()).unwrap();
        for piece in data.chunks(100) {
            h.image().unwrap().write_all(piece).unwrap();
        }
        h.close().unwrap();

        let mut h = r.open(&image, Mode::Read).unwrap();
        assert_eq!(h.stream().unwrap().read_to_vec(data.len()).unwrap(), data);
    }
}
