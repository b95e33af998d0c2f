//! AFF4 volumes stored as zip archives.
//!
//! A volume appends segments at its `aff4:directory_offset`, overwriting the
//! previous central directory. Closing writes the `properties` segment, then
//! a central directory rebuilt from the resolver, then the end record with
//! the volume URN as the archive comment.
//!
//! The volume object itself holds nothing but its URN; segment placement
//! lives in the resolver so any thread holding the volume lock can append.

use std::io::SeekFrom;

use log::{debug, info, warn};
use time::OffsetDateTime;

use crate::error::{Aff4Error, Result};
use crate::hash;
use crate::identity;
use crate::resolver::{Mode, Resolver, WeakResolver};
use crate::stream::Stream;
use crate::urn::{self, attr, config, types};
use crate::zip::{self, Compression, EndRecord, LocalHeader, ZipInfo};

pub const PROPERTIES: &str = "properties";
const URN_ENTRY: &str = "__URN__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyStyle {
    /// One fully qualified `properties` segment at the root
    Combined,
    /// A relative `properties` segment per object
    Relative,
}

impl PropertyStyle {
    fn from_config(resolver: &Resolver) -> Self {
        match resolver.resolve(urn::GLOBAL, config::PROPERTY_STYLE).as_deref() {
            Some("relative") => PropertyStyle::Relative,
            _ => PropertyStyle::Combined,
        }
    }
}

pub struct ZipVolume {
    urn: String,
    resolver: WeakResolver,
}

impl ZipVolume {
    pub fn open(resolver: &Resolver, urn: &str, _mode: Mode) -> Result<Self> {
        resolver.require(urn, attr::STORED)?;
        Ok(ZipVolume {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
        })
    }

    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn is_dirty(&self) -> bool {
        self.resolver
            .upgrade()
            .map(|r| r.resolve_bool(&self.urn, attr::DIRTY))
            .unwrap_or(false)
    }

    /// Append `data` as the segment `subject`.
    pub fn writestr(&mut self, subject: &str, data: &[u8], compression: Compression) -> Result<()> {
        let resolver = self.resolver.upgrade()?;
        let backing_uri = resolver.require(&self.urn, attr::STORED)?;

        let mut handle = resolver.open(&backing_uri, Mode::Write)?;
        resolver.set(&self.urn, attr::DIRTY, 1);

        let header_offset = resolver.resolve_u64(&self.urn, attr::DIRECTORY_OFFSET).unwrap_or(0);
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let (dos_time, dos_date) = zip::dos_datetime(timestamp);

        let compressed;
        let payload = match compression {
            Compression::Stored => data,
            Compression::Deflated => {
                compressed = zip::deflate(data, 9)?;
                &compressed[..]
            }
        };

        let info = ZipInfo {
            filename: urn::escape_filename(urn::relative_name(subject, &self.urn)),
            compression,
            crc32: hash::crc32(data),
            compressed_size: payload.len() as u64,
            file_size: data.len() as u64,
            header_offset,
            dos_time,
            dos_date,
        };

        let backing = handle.backing()?;
        backing.seek(SeekFrom::Start(header_offset))?;
        let mut header = Vec::with_capacity(info.local_header_len() as usize);
        info.write_local_header(&mut header)?;
        backing.write_all(&header)?;
        backing.write_all(payload)?;
        drop(handle);

        let file_offset = header_offset + info.local_header_len();
        record_segment(&resolver, &self.urn, subject, &info, file_offset, timestamp);
        resolver.invalidate(subject);

        debug!(
            "{}: wrote {} ({} bytes) at {}",
            self.urn,
            subject,
            payload.len(),
            header_offset
        );
        resolver.set(&self.urn, attr::DIRECTORY_OFFSET, file_offset + payload.len() as u64);
        Ok(())
    }

    /// Write properties and the central directory. A clean volume is left alone.
    pub fn close(&mut self) -> Result<()> {
        let resolver = self.resolver.upgrade()?;
        if !resolver.resolve_bool(&self.urn, attr::DIRTY) {
            return Ok(());
        }

        self.write_properties(&resolver)?;

        let mut segments = Vec::new();
        for subject in resolver.resolve_list(&self.urn, attr::CONTAINS) {
            let is_segment = resolver.resolve(&subject, attr::TYPE).as_deref() == Some(types::SEGMENT);
            let stored_here = resolver.resolve(&subject, attr::STORED).as_deref() == Some(self.urn.as_str());
            if is_segment && stored_here {
                segments.push(zip_info(&resolver, &self.urn, &subject)?);
            }
        }
        segments.sort_by_key(|s| s.header_offset);

        let cd_offset = resolver.resolve_u64(&self.urn, attr::DIRECTORY_OFFSET).unwrap_or(0);
        let mut directory = Vec::new();
        for info in segments.iter() {
            info.write_central_header(&mut directory)?;
        }
        let cd_size = directory.len() as u64;
        let zip64 = segments.iter().any(ZipInfo::needs_zip64);
        zip::write_end(
            &mut directory,
            cd_offset + cd_size,
            cd_offset,
            cd_size,
            segments.len() as u64,
            zip64,
            self.urn.as_bytes(),
        )?;

        let backing_uri = resolver.require(&self.urn, attr::STORED)?;
        let mut handle = resolver.open(&backing_uri, Mode::Write)?;
        let backing = handle.backing()?;
        backing.seek(SeekFrom::Start(cd_offset))?;
        backing.write_all(&directory)?;
        backing.truncate(cd_offset + directory.len() as u64)?;
        backing.flush()?;
        drop(handle);

        info!(
            "Closed volume {} on {}: {} segments, directory at {}",
            self.urn,
            backing_uri,
            segments.len(),
            cd_offset
        );
        resolver.set(&self.urn, attr::DIRTY, 0);
        Ok(())
    }

    fn write_properties(&mut self, resolver: &Resolver) -> Result<()> {
        let contained: Vec<String> = resolver
            .resolve_list(&self.urn, attr::CONTAINS)
            .into_iter()
            .filter(|s| urn::basename(s) != PROPERTIES)
            .collect();
        let is_segment = |s: &str| resolver.resolve(s, attr::TYPE).as_deref() == Some(types::SEGMENT);

        let mut text = String::new();
        match PropertyStyle::from_config(resolver) {
            PropertyStyle::Combined => {
                text.push_str(&resolver.export(&self.urn, ""));
                for subject in contained.iter() {
                    text.push_str(&resolver.export(subject, ""));
                }
            }
            PropertyStyle::Relative => {
                text.push_str(&resolver.export_relative(&self.urn));
                for subject in contained.iter() {
                    if is_segment(subject) {
                        text.push_str(&resolver.export(subject, ""));
                    } else {
                        let props = format!("{}/{}", subject, PROPERTIES);
                        let data = resolver.export_relative(subject);
                        self.writestr(&props, data.as_bytes(), Compression::Deflated)?;
                    }
                }
            }
        }

        let subject = format!("{}/{}", self.urn, PROPERTIES);
        self.writestr(&subject, text.as_bytes(), Compression::Deflated)
    }
}

/// Record where `subject` sits in `volume`.
fn record_segment(resolver: &Resolver, volume: &str, subject: &str, info: &ZipInfo, file_offset: u64, timestamp: i64) {
    resolver.set(subject, attr::STORED, volume);
    resolver.set(subject, attr::TYPE, types::SEGMENT);
    resolver.set(subject, attr::INTERFACE, types::STREAM);
    resolver.set(subject, attr::SIZE, info.file_size);
    resolver.set(subject, attr::TIMESTAMP, timestamp);

    resolver.set(subject, attr::HEADER_OFFSET, info.header_offset);
    resolver.set(subject, attr::COMPRESSED_SIZE, info.compressed_size);
    resolver.set(subject, attr::COMPRESSION_METHOD, info.compression.method());
    resolver.set(subject, attr::CRC32, info.crc32);
    resolver.set(subject, attr::FILE_OFFSET, file_offset);

    resolver.add(volume, attr::CONTAINS, subject);
}

/// Central directory entry for `subject` from its resolver attributes.
fn zip_info(resolver: &Resolver, volume: &str, subject: &str) -> Result<ZipInfo> {
    let method = resolver.require_u64(subject, attr::COMPRESSION_METHOD)?;
    let timestamp = resolver
        .resolve(subject, attr::TIMESTAMP)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let (dos_time, dos_date) = zip::dos_datetime(timestamp);

    Ok(ZipInfo {
        filename: urn::escape_filename(urn::relative_name(subject, volume)),
        compression: Compression::from_method(method as u16)?,
        crc32: resolver.require_u64(subject, attr::CRC32)? as u32,
        compressed_size: resolver.require_u64(subject, attr::COMPRESSED_SIZE)?,
        file_size: resolver.require_u64(subject, attr::SIZE)?,
        header_offset: resolver.require_u64(subject, attr::HEADER_OFFSET)?,
        dos_time,
        dos_date,
    })
}

/// The volume already loaded from `uri`, if any.
pub fn volume_for_backing(resolver: &Resolver, uri: &str) -> Option<String> {
    resolver
        .search_attribute(attr::STORED)
        .into_iter()
        .find(|(s, v)| v == uri && resolver.resolve(s, attr::TYPE).as_deref() == Some(types::ZIP_VOLUME))
        .map(|(s, _)| s)
}

/// Open the volume stored at `uri`, or start a new one there.
pub fn create(resolver: &Resolver, uri: &str) -> Result<String> {
    if let Some(volume) = volume_for_backing(resolver, uri) {
        return Ok(volume);
    }

    match load(resolver, uri) {
        Ok(volume) => return Ok(volume),
        Err(e) => debug!("Starting a new volume on {}: {}", uri, e),
    }

    let volume = urn::fresh();
    resolver.set(&volume, attr::TYPE, types::ZIP_VOLUME);
    resolver.set(&volume, attr::STORED, uri);
    resolver.set(&volume, attr::DIRECTORY_OFFSET, 0);
    // Fresh volumes get written out even when nothing is added
    resolver.set(&volume, attr::DIRTY, 1);

    info!("Created volume {} on {}", volume, uri);
    Ok(volume)
}

// Entry data, inflated and CRC checked
fn read_entry<S: Stream + ?Sized>(backing: &mut S, info: &ZipInfo, file_offset: u64) -> Result<Vec<u8>> {
    let raw = backing.read_at(file_offset, info.compressed_size as usize)?;
    let data = match info.compression {
        Compression::Stored => raw,
        Compression::Deflated => zip::inflate(&raw, info.file_size as usize)?,
    };

    if hash::crc32(&data) != info.crc32 {
        return Err(Aff4Error::IntegrityError(format!("crc mismatch on {}", info.filename)));
    }
    Ok(data)
}

fn find_end_record<S: Stream + ?Sized>(backing: &mut S) -> Result<EndRecord> {
    let size = backing.size();
    let tail_len = size.min(zip::MAX_END_SEARCH);
    let tail_offset = size - tail_len;
    let tail = backing.read_at(tail_offset, tail_len as usize)?;

    let mut end = zip::find_end(&tail, tail_offset)?;
    if let Some(offset) = end.zip64_offset {
        let record = backing.read_at(offset, zip::ZIP64_END_LEN)?;
        end.merge_zip64(&record)?;
    }
    Ok(end)
}

fn properties_context(volume: &str, filename: &str) -> String {
    urn::fully_qualified(urn::dirname(filename), volume)
}

/// Import the volume stored at `uri`, returns its URN.
pub fn load(resolver: &Resolver, uri: &str) -> Result<String> {
    let mut handle = resolver.open(uri, Mode::Read)?;
    let backing = handle.backing()?;

    let end = find_end_record(backing)?;
    let directory = backing.read_at(end.cd_offset, end.cd_size as usize)?;
    if (directory.len() as u64) < end.cd_size {
        return Err(Aff4Error::format(format!("{}: central directory is truncated", uri)));
    }
    let entries = zip::parse_central_directory(&directory, end.entries)?;

    let mut placed = Vec::with_capacity(entries.len());
    for info in entries {
        let raw = backing.read_at(info.header_offset, zip::LOCAL_HEADER_LEN as usize)?;
        let header = LocalHeader::parse(&raw)?;
        placed.push((urn::unescape_filename(&info.filename), info.header_offset + header.data_offset(), info));
    }

    let comment = String::from_utf8_lossy(&end.comment).trim().to_string();
    let volume = if comment.starts_with(urn::AFF4) {
        comment
    } else if let Some((_, offset, info)) = placed.iter().find(|(n, _, _)| n == URN_ENTRY) {
        String::from_utf8_lossy(&read_entry(backing, info, *offset)?).trim().to_string()
    } else {
        urn::fresh()
    };

    for (name, offset, info) in placed.iter() {
        if urn::basename(name) != PROPERTIES {
            continue;
        }
        match read_entry(backing, info, *offset) {
            Ok(data) => {
                let text = String::from_utf8_lossy(&data);
                let context = properties_context(&volume, name);
                resolver.parse_properties(&text, Some(&context));
            }
            Err(e) => warn!("{}: skipping unreadable {}: {}", uri, name, e),
        }
    }
    drop(handle);

    resolver.set(&volume, attr::TYPE, types::ZIP_VOLUME);
    resolver.set(&volume, attr::STORED, uri);
    for (name, offset, info) in placed.iter() {
        let subject = urn::fully_qualified(name, &volume);
        let timestamp = zip::unix_time(info.dos_time, info.dos_date);
        record_segment(resolver, &volume, &subject, info, *offset, timestamp);
    }
    resolver.set(&volume, attr::DIRECTORY_OFFSET, end.cd_offset);
    resolver.set(&volume, attr::DIRTY, 0);
    info!("Loaded volume {} from {} ({} segments)", volume, uri, placed.len());

    for id in resolver.resolve_list(&volume, attr::IDENTITY) {
        if let Err(e) = identity::load_keys(resolver, &id) {
            warn!("{}: identity {} not usable: {}", volume, id, e);
        }
    }

    if resolver.config_bool(config::AUTOLOAD) {
        for target in resolver.resolve_list(&volume, attr::AUTOLOAD) {
            if volume_for_backing(resolver, &target).is_some() {
                debug!("{} already loaded, not following autoload", target);
                continue;
            }
            if let Err(e) = load(resolver, &target) {
                warn!("{}: autoload of {} failed: {}", volume, target, e);
            }
        }
    }

    Ok(volume)
}

#[cfg(test)]
mod test_volume {
    use super::*;

    fn backing_uri(dir: &tempfile::TempDir, name: &str) -> String {
        format!("file://{}", dir.path().join(name).display())
    }

    #[test]
    fn write_close_reload() {
        let dir = tempfile::tempdir().unwrap();
        let uri = backing_uri(&dir, "v.aff4");

        let r = Resolver::new();
        let volume = create(&r, &uri).unwrap();
        {
            let mut h = r.open(&volume, Mode::Write).unwrap();
            let v = h.volume().unwrap();
            v.writestr(&format!("{}/plain", volume), b"hello world", Compression::Stored).unwrap();
            v.writestr("urn:aff4:elsewhere/data", &b"z".repeat(1000), Compression::Deflated).unwrap();
        }
        r.set("urn:aff4:elsewhere/data", "aff4:note", "kept");
        r.close_volume(&volume).unwrap();

        let fresh = Resolver::new();
        let loaded = create(&fresh, &uri).unwrap();
        assert_eq!(loaded, volume);

        let plain = format!("{}/plain", volume);
        for subject in [plain.as_str(), "urn:aff4:elsewhere/data"] {
            for a in [attr::HEADER_OFFSET, attr::COMPRESSED_SIZE, attr::SIZE, attr::CRC32, attr::COMPRESSION_METHOD, attr::FILE_OFFSET] {
                assert_eq!(fresh.resolve(subject, a), r.resolve(subject, a), "{} {}", subject, a);
            }
        }
        assert_eq!(fresh.resolve("urn:aff4:elsewhere/data", "aff4:note").as_deref(), Some("kept"));

        let mut seg = fresh.open(&plain, Mode::Read).unwrap();
        assert_eq!(seg.stream().unwrap().read_to_vec(100).unwrap(), b"hello world");

        let mut seg = fresh.open("urn:aff4:elsewhere/data", Mode::Read).unwrap();
        assert_eq!(seg.stream().unwrap().read_to_vec(2000).unwrap(), b"z".repeat(1000));
    }

    #[test]
    fn archive_comment_is_the_urn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.aff4");
        let uri = format!("file://{}", path.display());

        let r = Resolver::new();
        let volume = create(&r, &uri).unwrap();
        r.close_volume(&volume).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert!(data.ends_with(volume.as_bytes()));
        assert_eq!(&data[0..4], b"PK\x03\x04");
    }

    #[test]
    fn second_close_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.aff4");
        let uri = format!("file://{}", path.display());

        let r = Resolver::new();
        let volume = create(&r, &uri).unwrap();
        r.close_volume(&volume).unwrap();
        let first = std::fs::read(&path).unwrap();

        r.close_volume(&volume).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn append_to_existing_volume() {
        let dir = tempfile::tempdir().unwrap();
        let uri = backing_uri(&dir, "a.aff4");

        let r = Resolver::new();
        let volume = create(&r, &uri).unwrap();
        r.open(&volume, Mode::Write).unwrap().volume().unwrap()
            .writestr("urn:aff4:one", b"1", Compression::Stored).unwrap();
        r.close_volume(&volume).unwrap();

        let r = Resolver::new();
        let volume = create(&r, &uri).unwrap();
        r.open(&volume, Mode::Write).unwrap().volume().unwrap()
            .writestr("urn:aff4:two", b"22", Compression::Stored).unwrap();
        r.close_volume(&volume).unwrap();

        let r = Resolver::new();
        load(&r, &uri).unwrap();
        assert_eq!(r.resolve_u64("urn:aff4:one", attr::SIZE), Some(1));
        assert_eq!(r.resolve_u64("urn:aff4:two", attr::SIZE), Some(2));
    }

    #[test]
    fn relative_property_style() {
        let dir = tempfile::tempdir().unwrap();
        let uri = backing_uri(&dir, "r.aff4");

        let r = Resolver::new();
        r.set(urn::GLOBAL, config::PROPERTY_STYLE, "relative");
        let volume = create(&r, &uri).unwrap();
        r.set("urn:aff4:obj", attr::TYPE, "custom");
        r.set("urn:aff4:obj", attr::STORED, &volume);
        r.add(&volume, attr::CONTAINS, "urn:aff4:obj");
        r.close_volume(&volume).unwrap();

        assert_eq!(r.resolve("urn:aff4:obj/properties", attr::TYPE).as_deref(), Some(types::SEGMENT));

        let fresh = Resolver::new();
        load(&fresh, &uri).unwrap();
        assert_eq!(fresh.resolve("urn:aff4:obj", attr::TYPE).as_deref(), Some("custom"));
        assert_eq!(fresh.resolve("urn:aff4:obj", attr::STORED), Some(volume));
    }

    #[test]
    fn garbage_is_not_a_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.bin");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();

        let r = Resolver::new();
        assert!(load(&r, &format!("file://{}", path.display())).is_err());
    }

    #[test]
    fn context_rules() {
        assert_eq!(properties_context("urn:aff4:v", "properties"), "urn:aff4:v");
        assert_eq!(properties_context("urn:aff4:v", "img/properties"), "urn:aff4:v/img");
        assert_eq!(properties_context("urn:aff4:v", "urn:aff4:i/properties"), "urn:aff4:i");
    }
}
