use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use aff4::resolver::{Mode, Resolver};
use aff4::spill::{self, VolumeSpill};
use aff4::stream::image::{Image, ImageOptions};
use aff4::stream::map::Map;
use aff4::stream::Stream;
use aff4::urn::{self, attr, config, types};
use aff4::{volume, zip};

fn uri(dir: &Path, name: &str) -> String {
    format!("file://{}", dir.join(name).display())
}

fn options(chunk_size: u64, chunks_in_segment: u64, compression: u32) -> ImageOptions {
    ImageOptions {
        chunk_size,
        chunks_in_segment,
        compression,
        sha256: false,
    }
}

fn read_all(r: &Resolver, subject: &str, len: usize) -> Vec<u8> {
    let mut h = r.open(subject, Mode::Read).unwrap();
    h.stream().unwrap().read_at(0, len).unwrap()
}

#[test]
fn image_round_trip_small() {
    let dir = tempfile::tempdir().unwrap();
    let v_uri = uri(dir.path(), "v.aff4");
    let data = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let r = Resolver::new();
    let v = volume::create(&r, &v_uri).unwrap();
    let image = format!("{}/image", v);
    let mut h = Image::create(&r, &v, &image, &options(16, 2, 9)).unwrap();
    h.image().unwrap().write_all(data).unwrap();
    h.close().unwrap();
    r.close_volume(&v).unwrap();

    let fresh = Resolver::new();
    assert_eq!(volume::load(&fresh, &v_uri).unwrap(), v);
    assert_eq!(fresh.resolve_u64(&image, attr::SIZE), Some(36));
    assert_eq!(read_all(&fresh, &image, 36), data);

    // Two bevies, 2 chunks then 1 chunk, each index ends in the sentinel
    for (bevy, chunks) in [(0, 2u64), (1, 1)] {
        let idx = format!("{}/{:08}.idx", image, bevy);
        assert_eq!(fresh.resolve_u64(&idx, attr::SIZE), Some(4 * (chunks + 1)));
        let index = read_all(&fresh, &idx, 64);
        assert_eq!(&index[index.len() - 4..], &[0xFF; 4]);
        assert_eq!(
            fresh.resolve(&format!("{}/{:08}", image, bevy), attr::TYPE).as_deref(),
            Some(types::SEGMENT)
        );
    }
    assert!(fresh.resolve(&format!("{}/00000002", image), attr::TYPE).is_none());
}

#[test]
fn map_default_target_write() {
    let dir = tempfile::tempdir().unwrap();
    let v_uri = uri(dir.path(), "m.aff4");

    let r = Resolver::new();
    let v = volume::create(&r, &v_uri).unwrap();
    let image = format!("{}/I", v);
    let map = format!("{}/M", v);
    Image::create(&r, &v, &image, &options(32768, 2048, 0)).unwrap();

    let mut h = Map::create(&r, &v, &map, Some(&image)).unwrap();
    h.map().unwrap().write(b"hello ").unwrap();
    h.map().unwrap().write(b"world").unwrap();
    h.close().unwrap();
    r.open(&image, Mode::Write).unwrap().close().unwrap();
    r.close_volume(&v).unwrap();

    let fresh = Resolver::new();
    volume::load(&fresh, &v_uri).unwrap();
    assert_eq!(fresh.resolve_u64(&map, attr::SIZE), Some(11));
    assert_eq!(read_all(&fresh, &map, 11), b"hello world");

    let map_data = urn::unescape_value(&fresh.resolve(&map, attr::MAP_DATA).unwrap());
    let lines: Vec<&str> = map_data.lines().collect();
    assert_eq!(lines, vec!["0,0,@", "11,0,urn:aff4:null"]);
}

#[test]
fn map_across_two_targets() {
    let dir = tempfile::tempdir().unwrap();
    let v_uri = uri(dir.path(), "t.aff4");

    let r = Resolver::new();
    let v = volume::create(&r, &v_uri).unwrap();
    let a = format!("{}/A", v);
    let b = format!("{}/B", v);
    for (target, byte) in [(&a, b'A'), (&b, b'B')] {
        let mut h = Image::create(&r, &v, target, &ImageOptions::default()).unwrap();
        h.image().unwrap().write_all(&[byte; 1024]).unwrap();
        h.close().unwrap();
    }

    let map = format!("{}/M", v);
    let mut h = Map::create(&r, &v, &map, None).unwrap();
    h.map().unwrap().write_from(&a, 512, 256).unwrap();
    h.map().unwrap().write_from(&b, 0, 256).unwrap();
    h.close().unwrap();
    r.close_volume(&v).unwrap();

    let fresh = Resolver::new();
    volume::load(&fresh, &v_uri).unwrap();
    let mut expected = vec![b'A'; 256];
    expected.extend_from_slice(&[b'B'; 256]);
    assert_eq!(read_all(&fresh, &map, 512), expected);

    // Past the last mapping is the null sentinel
    let mut h = fresh.open(&map, Mode::Read).unwrap();
    assert_eq!(h.stream().unwrap().size(), 512);
    assert!(h.stream().unwrap().read_at(512, 10).unwrap().is_empty());
}

#[test]
fn properties_round_trip() {
    let r = Resolver::new();
    r.add("urn:aff4:x", "aff4:size", "100");
    r.add("urn:aff4:x", "aff4:type", "image");
    r.set("urn:aff4:x", "aff4volatile:dirty", "1");

    let text = r.export("urn:aff4:x", "");
    assert_eq!(text.lines().count(), 2);
    assert!(!text.contains("aff4volatile:"));

    let fresh = Resolver::new();
    assert_eq!(fresh.parse_properties(&text, Some("urn:aff4:x")), 2);
    assert_eq!(fresh.resolve("urn:aff4:x", "aff4:size").as_deref(), Some("100"));
    assert_eq!(fresh.resolve("urn:aff4:x", "aff4:type").as_deref(), Some("image"));
    assert!(fresh.resolve("urn:aff4:x", "aff4volatile:dirty").is_none());
}

#[test]
fn zip64_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("z.aff4");
    let v_uri = uri(dir.path(), "z.aff4");

    let r = Resolver::new();
    let v = volume::create(&r, &v_uri).unwrap();
    // Leave a sparse hole so everything lands past 4 GiB
    r.set(&v, attr::DIRECTORY_OFFSET, (1u64 << 32) + 100);

    let image = format!("{}/big", v);
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
    let mut h = Image::create(&r, &v, &image, &options(1024, 4, 0)).unwrap();
    h.image().unwrap().write_all(&data).unwrap();
    h.close().unwrap();
    r.close_volume(&v).unwrap();

    let size = std::fs::metadata(&path).unwrap().len();
    assert!(size > 1 << 32);

    let mut backing = r.open(&v_uri, Mode::Read).unwrap();
    let backing = backing.stream().unwrap();
    let tail_len = size.min(zip::MAX_END_SEARCH);
    let tail = backing.read_at(size - tail_len, tail_len as usize).unwrap();

    // ZIP64 end record and locator come right before the classic end record
    let eocd = tail.len() - zip::END_LEN - v.len();
    assert_eq!(&tail[eocd..eocd + 4], b"PK\x05\x06");
    let locator = eocd - zip::ZIP64_LOCATOR_LEN;
    assert_eq!(&tail[locator..locator + 4], b"PK\x06\x07");
    let zip64_end = locator - zip::ZIP64_END_LEN;
    assert_eq!(&tail[zip64_end..zip64_end + 4], b"PK\x06\x06");

    let mut end = zip::find_end(&tail, size - tail_len).unwrap();
    assert_eq!(end.comment, v.as_bytes());
    let offset = end.zip64_offset.unwrap();
    end.merge_zip64(&backing.read_at(offset, zip::ZIP64_END_LEN).unwrap()).unwrap();
    assert!(end.cd_offset > 1 << 32);

    let directory = backing.read_at(end.cd_offset, end.cd_size as usize).unwrap();
    let entries = zip::parse_central_directory(&directory, end.entries).unwrap();
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e.header_offset > 1 << 32));
    drop(backing);
    check_zip64_layout(&path, &v);

    let fresh = Resolver::new();
    volume::load(&fresh, &v_uri).unwrap();
    assert_eq!(read_all(&fresh, &image, data.len()), data);
}

fn read_exact_at(file: &mut File, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut buf).unwrap();
    buf
}

// Follow the end records straight off the disk, field by field as APPNOTE
// lays them out
fn check_zip64_layout(path: &Path, volume: &str) {
    let mut file = File::open(path).unwrap();
    let size = file.metadata().unwrap().len();

    // Classic end record, counts fit but the directory offset overflows
    let eocd = size - 22 - volume.len() as u64;
    let mut rdr = Cursor::new(read_exact_at(&mut file, eocd, 22 + volume.len()));
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0x0605_4b50);
    assert_eq!(rdr.read_u16::<LittleEndian>().unwrap(), 0);
    assert_eq!(rdr.read_u16::<LittleEndian>().unwrap(), 0);
    let count = rdr.read_u16::<LittleEndian>().unwrap();
    assert_eq!(rdr.read_u16::<LittleEndian>().unwrap(), count);
    rdr.read_u32::<LittleEndian>().unwrap();
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0xFFFF_FFFF);
    assert_eq!(rdr.read_u16::<LittleEndian>().unwrap() as usize, volume.len());
    let mut comment = Vec::new();
    rdr.read_to_end(&mut comment).unwrap();
    assert_eq!(comment, volume.as_bytes());

    // Locator sits right before it and points at the ZIP64 end record
    let mut rdr = Cursor::new(read_exact_at(&mut file, eocd - 20, 20));
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0x0706_4b50);
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0);
    let zip64_end = rdr.read_u64::<LittleEndian>().unwrap();
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 1);
    assert_eq!(zip64_end, eocd - 20 - 56);

    let mut rdr = Cursor::new(read_exact_at(&mut file, zip64_end, 56));
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0x0606_4b50);
    assert_eq!(rdr.read_u64::<LittleEndian>().unwrap(), 44);
    rdr.read_u16::<LittleEndian>().unwrap();
    assert!(rdr.read_u16::<LittleEndian>().unwrap() >= 45);
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0);
    assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0);
    assert_eq!(rdr.read_u64::<LittleEndian>().unwrap(), count as u64);
    assert_eq!(rdr.read_u64::<LittleEndian>().unwrap(), count as u64);
    let cd_size = rdr.read_u64::<LittleEndian>().unwrap();
    let cd_offset = rdr.read_u64::<LittleEndian>().unwrap();
    assert!(cd_offset > 1 << 32);
    assert_eq!(cd_offset + cd_size, zip64_end);

    // Every directory entry carries its local header offset in a ZIP64 extra
    let mut rdr = Cursor::new(read_exact_at(&mut file, cd_offset, cd_size as usize));
    for _ in 0..count {
        assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0x0201_4b50);
        rdr.seek(SeekFrom::Current(16)).unwrap();
        let compressed = rdr.read_u32::<LittleEndian>().unwrap();
        let uncompressed = rdr.read_u32::<LittleEndian>().unwrap();
        let name_len = rdr.read_u16::<LittleEndian>().unwrap() as i64;
        let extra_len = rdr.read_u16::<LittleEndian>().unwrap() as u64;
        let comment_len = rdr.read_u16::<LittleEndian>().unwrap() as i64;
        rdr.seek(SeekFrom::Current(8)).unwrap();
        assert_eq!(rdr.read_u32::<LittleEndian>().unwrap(), 0xFFFF_FFFF);
        rdr.seek(SeekFrom::Current(name_len)).unwrap();

        let extra_end = rdr.position() + extra_len;
        let mut header_offset = None;
        while rdr.position() < extra_end {
            let tag = rdr.read_u16::<LittleEndian>().unwrap();
            let len = rdr.read_u16::<LittleEndian>().unwrap() as i64;
            if tag != 0x0001 {
                rdr.seek(SeekFrom::Current(len)).unwrap();
                continue;
            }
            if uncompressed == 0xFFFF_FFFF {
                rdr.read_u64::<LittleEndian>().unwrap();
            }
            if compressed == 0xFFFF_FFFF {
                rdr.read_u64::<LittleEndian>().unwrap();
            }
            header_offset = Some(rdr.read_u64::<LittleEndian>().unwrap());
        }
        rdr.seek(SeekFrom::Current(comment_len)).unwrap();

        let header_offset = header_offset.unwrap();
        assert!(header_offset > 1 << 32);
        let magic = read_exact_at(&mut file, header_offset, 4);
        assert_eq!(magic, b"PK\x03\x04");
    }
    assert_eq!(rdr.position(), cd_size);
}

#[test]
fn multi_volume_spill() {
    let dir = tempfile::tempdir().unwrap();
    let base = uri(dir.path(), "v.aff4");

    let r = Resolver::new();
    r.set(urn::GLOBAL, config::THREADS, 1);
    let spill = VolumeSpill::create(&r, &base, 1024 * 1024).unwrap();

    let data: Vec<u8> = (0..3 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();
    let image = format!("{}/disk", spill.current());
    let mut h = Image::create(&r, &spill.current(), &image, &options(32 * 1024, 8, 0)).unwrap();
    for piece in data.chunks(100_000) {
        h.image().unwrap().write_all(piece).unwrap();
    }
    h.close().unwrap();

    let volumes = spill.volumes();
    spill.close().unwrap();

    assert!(volumes.len() >= 3, "{:?}", volumes);
    for name in ["v.aff4", "v.aff4.001", "v.aff4.002"] {
        assert!(dir.path().join(name).exists(), "{}", name);
    }
    assert_eq!(spill::successor_uri(&base, 2), uri(dir.path(), "v.aff4.002"));

    // Every piece of the image lives in exactly one member
    let prefix = format!("{}/", image);
    for (segment, _) in r.search_attribute(attr::TYPE) {
        if !segment.starts_with(&prefix) {
            continue;
        }
        let stored = r.resolve_list(&segment, attr::STORED);
        assert_eq!(stored.len(), 1, "{}", segment);
        assert!(volumes.contains(&stored[0]), "{}", segment);
    }

    for member in [base.clone(), spill::successor_uri(&base, 2)] {
        let fresh = Resolver::new();
        fresh.set(urn::GLOBAL, config::AUTOLOAD, 1);
        volume::load(&fresh, &member).unwrap();
        assert_eq!(fresh.resolve_u64(&image, attr::SIZE), Some(data.len() as u64));
        assert_eq!(read_all(&fresh, &image, data.len()), data);
    }
}
