//! Streams made of regions of other streams.
//!
//! A map is a sorted set of points `image_offset -> (target_offset, target)`.
//! A point covers everything up to the next point, reads past the last one
//! run to `aff4:size`. Serialized as `image_offset,target_offset,target`
//! lines where `@` stands for the map's default target.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::SeekFrom;

use log::warn;

use crate::error::{Aff4Error, Result};
use crate::resolver::{Handle, Mode, Resolver, WeakResolver};
use crate::stream::{seek_position, Stream};
use crate::urn::{self, attr, types};
use crate::zip::Compression;

/// Map text at or above this size goes into a `<map>/map` segment.
pub const INLINE_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub target_offset: u64,
    pub target: String,
}

pub struct Map {
    urn: String,
    resolver: WeakResolver,
    mode: Mode,
    target: Option<String>,
    points: BTreeMap<u64, Point>,
    block_size: u64,
    size: u64,
    readptr: u64,
    dirty: bool,
}

pub fn map_segment(map: &str) -> String {
    format!("{}/map", map)
}

impl Map {
    /// New map `urn` in `volume`, opened for writing.
    pub fn create(resolver: &Resolver, volume: &str, urn: &str, target: Option<&str>) -> Result<Handle> {
        resolver.set(urn, attr::TYPE, types::MAP);
        resolver.set(urn, attr::INTERFACE, types::STREAM);
        resolver.set(urn, attr::STORED, volume);
        if let Some(target) = target {
            resolver.set(urn, attr::TARGET, target);
        }
        resolver.set(urn, attr::DIRTY, 1);
        resolver.add(volume, attr::CONTAINS, urn);

        resolver.open(urn, Mode::Write)
    }

    pub fn open(resolver: &Resolver, urn: &str, mode: Mode) -> Result<Self> {
        let target = resolver.resolve(urn, attr::TARGET);
        let block_size = resolver.resolve_u64(urn, attr::BLOCK_SIZE).unwrap_or(1).max(1);

        let text = match resolver.resolve(urn, attr::MAP_DATA) {
            Some(data) => urn::unescape_value(&data),
            None if resolver.resolve(&map_segment(urn), attr::TYPE).is_some() => {
                let mut handle = resolver.open(&map_segment(urn), Mode::Read)?;
                let stream = handle.stream()?;
                let size = stream.size() as usize;
                String::from_utf8_lossy(&stream.read_at(0, size)?).into_owned()
            }
            None => String::new(),
        };

        let mut points = parse_points(&text, target.as_deref(), block_size);
        if points.is_empty() {
            if let Some(target) = &target {
                points.insert(
                    0,
                    Point {
                        target_offset: 0,
                        target: target.clone(),
                    },
                );
            }
        }

        Ok(Map {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
            mode,
            target,
            points,
            block_size,
            size: resolver.resolve_u64(urn, attr::SIZE).unwrap_or(0),
            readptr: 0,
            dirty: mode == Mode::Write && resolver.resolve_bool(urn, attr::DIRTY),
        })
    }

    pub fn points(&self) -> impl Iterator<Item = (u64, &Point)> {
        self.points.iter().map(|(k, v)| (*k, v))
    }

    /// The point covering `offset`.
    fn lookup(&self, offset: u64) -> Option<(u64, &Point)> {
        self.points.range(..=offset).next_back().map(|(k, v)| (*k, v))
    }

    /// Map `[start, start + length)` to `target` at `target_offset`.
    fn overlay(&mut self, start: u64, target_offset: u64, target: &str, length: u64) -> Result<()> {
        let end = start
            .checked_add(length)
            .ok_or_else(|| self.out_of_range(start, length))?;

        // What used to be at `end` keeps going after the new region
        let resume = match self.lookup(end) {
            Some((img, p)) if end < self.size => Some(Point {
                target_offset: p
                    .target_offset
                    .checked_add(end - img)
                    .ok_or_else(|| self.out_of_range(img, end - img))?,
                target: p.target.clone(),
            }),
            _ => None,
        };

        let inside: Vec<u64> = self.points.range(start..end).map(|(k, _)| *k).collect();
        for k in inside {
            self.points.remove(&k);
        }

        self.points.insert(
            start,
            Point {
                target_offset,
                target: target.to_string(),
            },
        );
        if !self.points.contains_key(&end) {
            self.points.insert(
                end,
                resume.unwrap_or(Point {
                    target_offset: 0,
                    target: urn::NULL.to_string(),
                }),
            );
        }

        self.size = self.size.max(end);
        self.dirty = true;
        Ok(())
    }

    fn out_of_range(&self, offset: u64, length: u64) -> Aff4Error {
        Aff4Error::format(format!("{}: {} bytes at {} run past the end of a map", self.urn, length, offset))
    }

    /// Map the next `length` bytes to `target` starting at `target_offset`.
    pub fn write_from(&mut self, target: &str, target_offset: u64, length: u64) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Aff4Error::ReadOnly(self.urn.clone()));
        }
        self.overlay(self.readptr, target_offset, target, length)?;
        self.readptr += length;
        Ok(())
    }

    /// Lines for storage, colinear points folded into the one before them.
    pub fn serialize(&self) -> String {
        let mut text = String::new();
        let mut last: Option<(u64, &Point)> = None;

        for (img, point) in self.points.iter() {
            if let Some((prev_img, prev)) = last {
                if prev.target == point.target && prev.target_offset + (img - prev_img) == point.target_offset {
                    continue;
                }
            }

            let name = match &self.target {
                Some(t) if *t == point.target => urn::DEFAULT_TARGET,
                _ => point.target.as_str(),
            };
            let _ = writeln!(
                text,
                "{},{},{}",
                img / self.block_size,
                point.target_offset / self.block_size,
                name
            );
            last = Some((*img, point));
        }
        text
    }

    fn fits_block_size(&self) -> bool {
        self.points
            .iter()
            .all(|(img, p)| img % self.block_size == 0 && p.target_offset % self.block_size == 0)
    }
}

/// Parse map text, bad lines are logged and skipped.
pub fn parse_points(text: &str, default_target: Option<&str>, block_size: u64) -> BTreeMap<u64, Point> {
    let mut points = BTreeMap::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.splitn(3, ',');
        let parsed = match (fields.next(), fields.next(), fields.next()) {
            (Some(img), Some(tgt), Some(name)) => match (img.trim().parse::<u64>(), tgt.trim().parse::<u64>()) {
                (Ok(img), Ok(tgt)) => Some((img, tgt, name.trim())),
                _ => None,
            },
            _ => None,
        };

        // Scaled offsets have to fit
        let parsed = parsed.and_then(|(img, tgt, name)| {
            Some((img.checked_mul(block_size)?, tgt.checked_mul(block_size)?, name))
        });

        match parsed {
            Some((img, tgt, name)) => {
                let target = match (name, default_target) {
                    (urn::DEFAULT_TARGET, Some(t)) => t.to_string(),
                    _ => name.to_string(),
                };
                points.insert(
                    img,
                    Point {
                        target_offset: tgt,
                        target,
                    },
                );
            }
            None => warn!("Skipping bad map line: {:?}", line),
        }
    }
    points
}

impl Stream for Map {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.readptr >= self.size {
            return Ok(0);
        }
        let resolver = self.resolver.upgrade()?;
        let want = buf.len().min((self.size - self.readptr) as usize);

        let mut total = 0;
        while total < want {
            let (img, target_offset, target) = match self.lookup(self.readptr) {
                Some((img, p)) => (img, p.target_offset, p.target.clone()),
                None => (0, 0, urn::NULL.to_string()),
            };
            let next = self
                .points
                .range(self.readptr + 1..)
                .next()
                .map(|(k, _)| *k)
                .unwrap_or(self.size)
                .min(self.size);
            let len = ((next - self.readptr) as usize).min(want - total);

            let mut handle = resolver.open(&target, Mode::Read)?;
            let stream = handle.stream()?;
            let offset = target_offset
                .checked_add(self.readptr - img)
                .ok_or_else(|| self.out_of_range(target_offset, self.readptr - img))?;
            stream.seek(SeekFrom::Start(offset))?;
            let data = stream.read_to_vec(len)?;
            if data.is_empty() {
                break;
            }

            buf[total..total + data.len()].copy_from_slice(&data);
            total += data.len();
            self.readptr += data.len() as u64;
            if data.len() < len {
                break;
            }
        }
        Ok(total)
    }

    /// Append `data` to the default target and map it at the read pointer.
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.mode != Mode::Write {
            return Err(Aff4Error::ReadOnly(self.urn.clone()));
        }
        let target = self
            .target
            .clone()
            .ok_or_else(|| Aff4Error::missing(&self.urn, attr::TARGET))?;
        let resolver = self.resolver.upgrade()?;

        let physical = {
            let mut handle = resolver.open(&target, Mode::Write)?;
            let stream = handle.stream()?;
            let end = stream.seek(SeekFrom::End(0))?;
            stream.write_all(data)?;
            end
        };

        self.overlay(self.readptr, physical, &target, data.len() as u64)?;
        self.readptr += data.len() as u64;
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

    fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write || !self.dirty {
            return Ok(());
        }
        let resolver = self.resolver.upgrade()?;

        if !self.fits_block_size() {
            self.block_size = 1;
        }
        let text = self.serialize();

        if text.len() < INLINE_LIMIT {
            resolver.set(&self.urn, attr::MAP_DATA, urn::escape_value(&text));
        } else {
            let volume = resolver.require(&self.urn, attr::STORED)?;
            let mut handle = resolver.open(&volume, Mode::Write)?;
            handle
                .volume()?
                .writestr(&map_segment(&self.urn), text.as_bytes(), Compression::Deflated)?;
            resolver.delete(&self.urn, attr::MAP_DATA);
        }

        resolver.set(&self.urn, attr::SIZE, self.size);
        resolver.set(&self.urn, attr::BLOCK_SIZE, self.block_size);
        resolver.set(&self.urn, attr::DIRTY, 0);
        resolver.invalidate(&self.urn);
        self.dirty = false;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}


#[cfg(test)]
mod test_map_stream {
    use super::*;
    use crate::stream::image::{Image, ImageOptions};
    use crate::volume;

    #[test]
    fn write_from_two_targets() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("m.aff4").display());
        let r = Resolver::new();
        let v = volume::create(&r, &uri).unwrap();

        for (name, byte) in [("urn:aff4:a", b'A'), ("urn:aff4:b", b'B')] {
            let mut h = Image::create(&r, &v, name, &ImageOptions::default()).unwrap();
            h.image().unwrap().write_all(&[byte; 64]).unwrap();
            h.close().unwrap();
        }

        let mut h = Map::create(&r, &v, "urn:aff4:m", None).unwrap();
        let m = h.map().unwrap();
        m.write_from("urn:aff4:a", 10, 4).unwrap();
        m.write_from("urn:aff4:b", 0, 4).unwrap();
        assert!(m.write(b"no default target").is_err());
        h.close().unwrap();

        let mut h = r.open("urn:aff4:m", Mode::Read).unwrap();
        assert_eq!(h.stream().unwrap().read_to_vec(100).unwrap(), b"AAAABBBB");
    }

    #[test]
    fn large_maps_use_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("big.aff4").display());
        let r = Resolver::new();
        let v = volume::create(&r, &uri).unwrap();

        let mut h = Map::create(&r, &v, "urn:aff4:m", None).unwrap();
        let m = h.map().unwrap();
        for i in 0..200 {
            m.write_from(if i % 2 == 0 { urn::ZERO } else { urn::NULL }, 0, 1).unwrap();
        }
        h.close().unwrap();

        assert!(r.resolve("urn:aff4:m", attr::MAP_DATA).is_none());
        assert_eq!(r.resolve(&map_segment("urn:aff4:m"), attr::TYPE).as_deref(), Some(types::SEGMENT));

        let mut h = r.open("urn:aff4:m", Mode::Read).unwrap();
        let s = h.stream().unwrap();
        assert_eq!(s.size(), 200);
        assert_eq!(s.read_at(0, 1).unwrap(), vec![0]);
        assert!(s.read_at(1, 1).is_err());
    }
}
