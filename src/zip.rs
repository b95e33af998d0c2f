//! PKZip records used by the zip volume.
//!
//! Only the subset of the format a volume needs: local file headers,
//! central directory entries, the end of central directory record and
//! their ZIP64 counterparts. Unless noted everything is Little Endian.
//!
//! | Record | Magic | Fixed size |
//! | ------ | ----- | ---------: |
//! | Local file header | `PK\x03\x04` | 30 |
//! | Central directory entry | `PK\x01\x02` | 46 |
//! | ZIP64 end of central directory | `PK\x06\x06` | 56 |
//! | ZIP64 end of central directory locator | `PK\x06\x07` | 20 |
//! | End of central directory | `PK\x05\x06` | 22 |
//!
//! A number that does not fit (see [`ZIP64_LIMIT`]) is written as
//! `0xFFFFFFFF` and the real value goes into a ZIP64 extended information
//! extra field (tag `0x0001`).

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::{Aff4Error, Result};

pub const LOCAL_MAGIC: u32 = 0x0403_4b50;
pub const CENTRAL_MAGIC: u32 = 0x0201_4b50;
pub const END_MAGIC: u32 = 0x0605_4b50;
pub const ZIP64_END_MAGIC: u32 = 0x0606_4b50;
pub const ZIP64_LOCATOR_MAGIC: u32 = 0x0706_4b50;

pub const LOCAL_HEADER_LEN: u64 = 30;
pub const CENTRAL_HEADER_LEN: usize = 46;
pub const END_LEN: usize = 22;
pub const ZIP64_END_LEN: usize = 56;
pub const ZIP64_LOCATOR_LEN: usize = 20;

/// Largest value written without ZIP64 extensions.
pub const ZIP64_LIMIT: u64 = (1 << 31) - 1;
pub const FILECOUNT_LIMIT: u64 = 0xFFFF;

const ZIP64_EXTRA_TAG: u16 = 0x0001;
const OVERFLOW32: u32 = 0xFFFF_FFFF;
const OVERFLOW16: u16 = 0xFFFF;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;

// The longest possible archive comment plus the end record
pub const MAX_END_SEARCH: u64 = 0xFFFF + END_LEN as u64 + ZIP64_LOCATOR_LEN as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Stored,
    Deflated,
}

impl Compression {
    pub fn method(self) -> u16 {
        match self {
            Compression::Stored => 0,
            Compression::Deflated => 8,
        }
    }

    pub fn from_method(method: u16) -> Result<Self> {
        match method {
            0 => Ok(Compression::Stored),
            8 => Ok(Compression::Deflated),
            x => Err(Aff4Error::format(format!("unsupported zip compression method {}", x))),
        }
    }
}

/// One entry of the archive as the central directory describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipInfo {
    /// Escaped name as stored in the archive
    pub filename: String,
    pub compression: Compression,
    pub crc32: u32,
    pub compressed_size: u64,
    pub file_size: u64,
    pub header_offset: u64,
    pub dos_time: u16,
    pub dos_date: u16,
}

impl ZipInfo {
    fn local_needs_zip64(&self) -> bool {
        self.file_size > ZIP64_LIMIT || self.compressed_size > ZIP64_LIMIT
    }

    pub fn needs_zip64(&self) -> bool {
        self.local_needs_zip64() || self.header_offset > ZIP64_LIMIT
    }

    fn version(&self) -> u16 {
        if self.needs_zip64() {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        }
    }

    /// Length of the local header this entry writes, name and extra included.
    pub fn local_header_len(&self) -> u64 {
        let extra = if self.local_needs_zip64() { 20 } else { 0 };
        LOCAL_HEADER_LEN + self.filename.len() as u64 + extra
    }

    pub fn write_local_header<W: Write>(&self, w: &mut W) -> Result<usize> {
        let zip64 = self.local_needs_zip64();
        let mut extra = Vec::new();
        if zip64 {
            extra.write_u16::<LittleEndian>(ZIP64_EXTRA_TAG)?;
            extra.write_u16::<LittleEndian>(16)?;
            extra.write_u64::<LittleEndian>(self.file_size)?;
            extra.write_u64::<LittleEndian>(self.compressed_size)?;
        }

        let mut buf = Vec::with_capacity(self.local_header_len() as usize);
        buf.write_u32::<LittleEndian>(LOCAL_MAGIC)?;
        buf.write_u16::<LittleEndian>(self.version())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(self.compression.method())?;
        buf.write_u16::<LittleEndian>(self.dos_time)?;
        buf.write_u16::<LittleEndian>(self.dos_date)?;
        buf.write_u32::<LittleEndian>(self.crc32)?;
        if zip64 {
            buf.write_u32::<LittleEndian>(OVERFLOW32)?;
            buf.write_u32::<LittleEndian>(OVERFLOW32)?;
        } else {
            buf.write_u32::<LittleEndian>(self.compressed_size as u32)?;
            buf.write_u32::<LittleEndian>(self.file_size as u32)?;
        }
        buf.write_u16::<LittleEndian>(self.filename.len() as u16)?;
        buf.write_u16::<LittleEndian>(extra.len() as u16)?;
        buf.extend_from_slice(self.filename.as_bytes());
        buf.extend_from_slice(&extra);

        w.write_all(&buf)?;
        Ok(buf.len())
    }

    pub fn write_central_header<W: Write>(&self, w: &mut W) -> Result<usize> {
        // Only the overflowing fields go into the extra, in this order
        let mut fields = Vec::new();
        let file_size = clamp32(self.file_size, &mut fields);
        let compressed_size = clamp32(self.compressed_size, &mut fields);
        let header_offset = clamp32(self.header_offset, &mut fields);

        let mut extra = Vec::new();
        if !fields.is_empty() {
            extra.write_u16::<LittleEndian>(ZIP64_EXTRA_TAG)?;
            extra.write_u16::<LittleEndian>((fields.len() * 8) as u16)?;
            for f in fields {
                extra.write_u64::<LittleEndian>(f)?;
            }
        }

        let mut buf = Vec::with_capacity(CENTRAL_HEADER_LEN + self.filename.len() + extra.len());
        buf.write_u32::<LittleEndian>(CENTRAL_MAGIC)?;
        // Made by unix + version
        buf.write_u16::<LittleEndian>((3 << 8) | self.version())?;
        buf.write_u16::<LittleEndian>(self.version())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(self.compression.method())?;
        buf.write_u16::<LittleEndian>(self.dos_time)?;
        buf.write_u16::<LittleEndian>(self.dos_date)?;
        buf.write_u32::<LittleEndian>(self.crc32)?;
        buf.write_u32::<LittleEndian>(compressed_size)?;
        buf.write_u32::<LittleEndian>(file_size)?;
        buf.write_u16::<LittleEndian>(self.filename.len() as u16)?;
        buf.write_u16::<LittleEndian>(extra.len() as u16)?;
        // Comment, disk number, internal + external attributes
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0o100644 << 16)?;
        buf.write_u32::<LittleEndian>(header_offset)?;
        buf.extend_from_slice(self.filename.as_bytes());
        buf.extend_from_slice(&extra);

        w.write_all(&buf)?;
        Ok(buf.len())
    }
}

fn clamp32(value: u64, overflow: &mut Vec<u64>) -> u32 {
    if value > ZIP64_LIMIT {
        overflow.push(value);
        OVERFLOW32
    } else {
        value as u32
    }
}

/// Lengths found in a local header, the data starts right after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHeader {
    pub filename_len: u64,
    pub extra_len: u64,
}

impl LocalHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOCAL_HEADER_LEN as usize {
            return Err(Aff4Error::format("short local file header"));
        }
        let mut rdr = Cursor::new(buf);
        if rdr.read_u32::<LittleEndian>()? != LOCAL_MAGIC {
            return Err(Aff4Error::format("bad local file header magic"));
        }
        rdr.set_position(26);
        let filename_len = rdr.read_u16::<LittleEndian>()? as u64;
        let extra_len = rdr.read_u16::<LittleEndian>()? as u64;

        Ok(LocalHeader {
            filename_len,
            extra_len,
        })
    }

    pub fn data_offset(&self) -> u64 {
        LOCAL_HEADER_LEN + self.filename_len + self.extra_len
    }
}

/// Where the central directory lives, merged from the classic and ZIP64 records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRecord {
    pub entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
    pub comment: Vec<u8>,
    /// Absolute offset of the ZIP64 end record when a locator was found
    pub zip64_offset: Option<u64>,
}

/// Write the ZIP64 records when required, then the classic end record.
pub fn write_end<W: Write>(
    w: &mut W,
    end_offset: u64,
    cd_offset: u64,
    cd_size: u64,
    entries: u64,
    force_zip64: bool,
    comment: &[u8],
) -> Result<usize> {
    let zip64 = force_zip64
        || entries > FILECOUNT_LIMIT
        || cd_size > ZIP64_LIMIT
        || cd_offset > ZIP64_LIMIT;

    let mut buf = Vec::new();
    if zip64 {
        buf.write_u32::<LittleEndian>(ZIP64_END_MAGIC)?;
        buf.write_u64::<LittleEndian>((ZIP64_END_LEN - 12) as u64)?;
        buf.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        buf.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(entries)?;
        buf.write_u64::<LittleEndian>(entries)?;
        buf.write_u64::<LittleEndian>(cd_size)?;
        buf.write_u64::<LittleEndian>(cd_offset)?;

        buf.write_u32::<LittleEndian>(ZIP64_LOCATOR_MAGIC)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(end_offset)?;
        buf.write_u32::<LittleEndian>(1)?;
    }

    let count16 = if entries > FILECOUNT_LIMIT { OVERFLOW16 } else { entries as u16 };
    let size32 = if cd_size > ZIP64_LIMIT { OVERFLOW32 } else { cd_size as u32 };
    let offset32 = if cd_offset > ZIP64_LIMIT { OVERFLOW32 } else { cd_offset as u32 };

    buf.write_u32::<LittleEndian>(END_MAGIC)?;
    buf.write_u16::<LittleEndian>(0)?;
    buf.write_u16::<LittleEndian>(0)?;
    buf.write_u16::<LittleEndian>(count16)?;
    buf.write_u16::<LittleEndian>(count16)?;
    buf.write_u32::<LittleEndian>(size32)?;
    buf.write_u32::<LittleEndian>(offset32)?;
    buf.write_u16::<LittleEndian>(comment.len() as u16)?;
    buf.extend_from_slice(comment);

    w.write_all(&buf)?;
    Ok(buf.len())
}

/// Locate the end record inside the last bytes of the archive.
///
/// `tail_offset` is the absolute offset of `tail[0]` in the backing store.
pub fn find_end(tail: &[u8], tail_offset: u64) -> Result<EndRecord> {
    if tail.len() < END_LEN {
        return Err(Aff4Error::format("archive too short for an end record"));
    }

    let magic = END_MAGIC.to_le_bytes();
    let mut pos = tail.len() - END_LEN;
    loop {
        if tail[pos..pos + 4] == magic {
            let comment_len = u16::from_le_bytes([tail[pos + 20], tail[pos + 21]]) as usize;
            // A signature inside the comment would not line up with the end of the file
            if pos + END_LEN + comment_len <= tail.len() {
                return parse_end(tail, pos, tail_offset);
            }
        }
        if pos == 0 {
            return Err(Aff4Error::format("no end of central directory record"));
        }
        pos -= 1;
    }
}

fn parse_end(tail: &[u8], pos: usize, tail_offset: u64) -> Result<EndRecord> {
    let mut rdr = Cursor::new(&tail[pos..]);
    rdr.read_u32::<LittleEndian>()?;
    rdr.read_u16::<LittleEndian>()?;
    rdr.read_u16::<LittleEndian>()?;
    rdr.read_u16::<LittleEndian>()?;
    let entries = rdr.read_u16::<LittleEndian>()? as u64;
    let cd_size = rdr.read_u32::<LittleEndian>()? as u64;
    let cd_offset = rdr.read_u32::<LittleEndian>()? as u64;
    let comment_len = rdr.read_u16::<LittleEndian>()? as usize;
    let start = pos + END_LEN;
    let comment = tail[start..start + comment_len].to_vec();

    // A ZIP64 locator sits right before the end record
    let mut zip64_offset = None;
    if pos >= ZIP64_LOCATOR_LEN {
        let loc = &tail[pos - ZIP64_LOCATOR_LEN..pos];
        let mut rdr = Cursor::new(loc);
        if rdr.read_u32::<LittleEndian>()? == ZIP64_LOCATOR_MAGIC {
            rdr.read_u32::<LittleEndian>()?;
            zip64_offset = Some(rdr.read_u64::<LittleEndian>()?);
        }
    } else if tail_offset > 0 && (entries == FILECOUNT_LIMIT || cd_offset == OVERFLOW32 as u64) {
        return Err(Aff4Error::format("zip64 locator outside of the searched tail"));
    }

    Ok(EndRecord {
        entries,
        cd_size,
        cd_offset,
        comment,
        zip64_offset,
    })
}

impl EndRecord {
    /// Replace the classic values with the ones from the ZIP64 end record.
    pub fn merge_zip64(&mut self, record: &[u8]) -> Result<()> {
        let mut rdr = Cursor::new(record);
        if rdr.read_u32::<LittleEndian>()? != ZIP64_END_MAGIC {
            return Err(Aff4Error::format("bad zip64 end of central directory magic"));
        }
        rdr.set_position(24);
        rdr.read_u64::<LittleEndian>()?;
        self.entries = rdr.read_u64::<LittleEndian>()?;
        self.cd_size = rdr.read_u64::<LittleEndian>()?;
        self.cd_offset = rdr.read_u64::<LittleEndian>()?;
        Ok(())
    }
}

pub fn parse_central_directory(buf: &[u8], entries: u64) -> Result<Vec<ZipInfo>> {
    let mut rdr = Cursor::new(buf);
    let mut infos = Vec::new();

    for _ in 0..entries {
        if rdr.read_u32::<LittleEndian>()? != CENTRAL_MAGIC {
            return Err(Aff4Error::format("bad central directory magic"));
        }
        rdr.read_u16::<LittleEndian>()?;
        rdr.read_u16::<LittleEndian>()?;
        rdr.read_u16::<LittleEndian>()?;
        let method = rdr.read_u16::<LittleEndian>()?;
        let dos_time = rdr.read_u16::<LittleEndian>()?;
        let dos_date = rdr.read_u16::<LittleEndian>()?;
        let crc32 = rdr.read_u32::<LittleEndian>()?;
        let mut compressed_size = rdr.read_u32::<LittleEndian>()? as u64;
        let mut file_size = rdr.read_u32::<LittleEndian>()? as u64;
        let filename_len = rdr.read_u16::<LittleEndian>()? as usize;
        let extra_len = rdr.read_u16::<LittleEndian>()? as usize;
        let comment_len = rdr.read_u16::<LittleEndian>()? as usize;
        rdr.read_u16::<LittleEndian>()?;
        rdr.read_u16::<LittleEndian>()?;
        rdr.read_u32::<LittleEndian>()?;
        let mut header_offset = rdr.read_u32::<LittleEndian>()? as u64;

        let mut filename = vec![0; filename_len];
        rdr.read_exact(&mut filename)?;
        let mut extra = vec![0; extra_len];
        rdr.read_exact(&mut extra)?;
        let mut comment = vec![0; comment_len];
        rdr.read_exact(&mut comment)?;

        // Pull the overflowed values out of the ZIP64 extra
        let mut extra_rdr = Cursor::new(&extra[..]);
        while (extra_rdr.position() as usize) + 4 <= extra.len() {
            let tag = extra_rdr.read_u16::<LittleEndian>()?;
            let len = extra_rdr.read_u16::<LittleEndian>()? as u64;
            let next = extra_rdr.position() + len;
            if tag == ZIP64_EXTRA_TAG {
                if file_size == OVERFLOW32 as u64 {
                    file_size = extra_rdr.read_u64::<LittleEndian>()?;
                }
                if compressed_size == OVERFLOW32 as u64 {
                    compressed_size = extra_rdr.read_u64::<LittleEndian>()?;
                }
                if header_offset == OVERFLOW32 as u64 {
                    header_offset = extra_rdr.read_u64::<LittleEndian>()?;
                }
            }
            extra_rdr.set_position(next);
        }

        infos.push(ZipInfo {
            filename: String::from_utf8_lossy(&filename).into_owned(),
            compression: Compression::from_method(method)?,
            crc32,
            compressed_size,
            file_size,
            header_offset,
            dos_time,
            dos_date,
        });
    }

    Ok(infos)
}

/// Raw deflate (no zlib header), the form zip entries and image chunks use.
pub fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::new(level.min(9)),
    );
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

pub fn inflate(data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size_hint);
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Unix seconds to zip `(time, date)`.
pub fn dos_datetime(unix: i64) -> (u16, u16) {
    let dt = OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    if dt.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let year = dt.year().min(2107) as u16;

    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
    let date = ((year - 1980) << 9) | ((u8::from(dt.month()) as u16) << 5) | dt.day() as u16;
    (time, date)
}

/// Zip `(time, date)` back to unix seconds, garbage dates map to 0.
pub fn unix_time(time: u16, date: u16) -> i64 {
    let year = 1980 + (date >> 9) as i32;
    let month = match Month::try_from(((date >> 5) & 0x0F) as u8) {
        Ok(m) => m,
        Err(_) => return 0,
    };
    let day = (date & 0x1F) as u8;
    let hms = Time::from_hms((time >> 11) as u8, ((time >> 5) & 0x3F) as u8, ((time & 0x1F) * 2) as u8);

    match (Date::from_calendar_date(year, month, day), hms) {
        (Ok(d), Ok(t)) => PrimitiveDateTime::new(d, t).assume_utc().unix_timestamp(),
        _ => 0,
    }
}
