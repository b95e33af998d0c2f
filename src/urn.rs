//! URN conventions and the attribute vocabulary.
//!
//! Everything in the store is addressed by a string: AFF4 objects by
//! `urn:aff4:<uuid>`, backing stores by their URL. Predicates live in two
//! families. Anything starting with [`VOLATILE`] is in-memory state that is
//! never written into a `properties` segment; everything else persists.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use uuid::Uuid;

pub const AFF4: &str = "urn:aff4:";
pub const VOLATILE: &str = "aff4volatile:";

/// Holds the library wide configuration knobs.
pub const GLOBAL: &str = "aff4volatile:global";

/// Unreadable or sparse data.
pub const NULL: &str = "urn:aff4:null";

/// Zero filled data.
pub const ZERO: &str = "urn:aff4:zero";

/// Map shorthand for the default target.
pub const DEFAULT_TARGET: &str = "@";

pub mod attr {
    pub const TYPE: &str = "aff4:type";
    pub const INTERFACE: &str = "aff4:interface";
    pub const STORED: &str = "aff4:stored";
    pub const CONTAINS: &str = "aff4:contains";
    pub const SIZE: &str = "aff4:size";
    pub const TIMESTAMP: &str = "aff4:timestamp";
    pub const AUTOLOAD: &str = "aff4:autoload";
    pub const DIRECTORY_OFFSET: &str = "aff4:directory_offset";
    pub const DIRTY: &str = "aff4volatile:dirty";

    // Placement of a segment inside its zip volume, rebuilt from the CD on load
    pub const HEADER_OFFSET: &str = "aff4volatile:header_offset";
    pub const COMPRESSED_SIZE: &str = "aff4volatile:compressed_size";
    pub const COMPRESSION_METHOD: &str = "aff4volatile:compression_method";
    pub const CRC32: &str = "aff4volatile:crc32";
    pub const FILE_OFFSET: &str = "aff4volatile:file_offset";

    pub const CHUNK_SIZE: &str = "aff4:chunk_size";
    pub const CHUNKS_IN_SEGMENT: &str = "aff4:chunks_in_segment";
    pub const COMPRESSION: &str = "aff4:compression";
    pub const HASH_TYPE: &str = "aff4:hash_type";
    pub const SHA256: &str = "aff4:sha256";
    pub const ORIGINAL_PATH: &str = "aff4:original_path";

    pub const TARGET: &str = "aff4:target";
    pub const MAP_DATA: &str = "aff4:map_data";
    pub const BLOCK_SIZE: &str = "aff4:blocksize";
    pub const PAD: &str = "aff4:pad";

    pub const CRYPTO_BLOCK_SIZE: &str = "aff4:crypto:block_size";
    pub const CRYPTO_IV: &str = "aff4:crypto:iv";
    pub const CRYPTO_FORTIFICATION: &str = "aff4:crypto:fortification_count";
    pub const CRYPTO_PASSPHRASE_KEY: &str = "aff4:crypto:passphrase_key";
    pub const CRYPTO_NONCE: &str = "aff4:crypto:nonce";
    pub const CRYPTO_RSA_WRAPPED: &str = "aff4:crypto:rsa_wrapped";
    pub const PASSPHRASE: &str = "aff4volatile:passphrase";
    pub const KEY: &str = "aff4volatile:key";

    pub const IDENTITY: &str = "aff4:identity";
    pub const STATEMENT: &str = "aff4:statement";
    pub const CERTIFICATE: &str = "aff4:certificate";
    pub const PRIVATE_KEY: &str = "aff4volatile:private_key";
}

pub mod types {
    pub const ZIP_VOLUME: &str = "zip_volume";
    pub const SEGMENT: &str = "segment";
    pub const IMAGE: &str = "image";
    pub const MAP: &str = "map";
    pub const LINK: &str = "link";
    pub const ENCRYPTED: &str = "encrypted";
    pub const IDENTITY: &str = "identity";
    pub const ERROR: &str = "error";

    /// `aff4:interface` value of everything readable as bytes.
    pub const STREAM: &str = "stream";
}

pub mod config {
    pub const THREADS: &str = "aff4volatile:config:threads";
    pub const VERBOSITY: &str = "aff4volatile:config:verbosity";
    pub const AUTOLOAD: &str = "aff4volatile:config:autoload";
    pub const PAD: &str = "aff4volatile:config:pad";
    pub const PROPERTY_STYLE: &str = "aff4volatile:config:property_style";
    pub const MAX_VOLUME_SIZE: &str = "aff4volatile:config:max_volume_size";
    pub const CACHE_SIZE: &str = "aff4volatile:config:cache_size";
}

// Zip entry names keep their path separators, everything else unusual is escaped
const FILENAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'\\')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_');

// Attribute values must stay on one properties line
const VALUE: &AsciiSet = &CONTROLS.add(b'%');

pub fn fresh() -> String {
    format!("{}{}", AFF4, Uuid::new_v4())
}

pub fn is_volatile(attribute: &str) -> bool {
    attribute.starts_with(VOLATILE)
}

/// True when the name starts with a URI scheme such as `urn:` or `file:`.
pub fn has_scheme(name: &str) -> bool {
    match name.find(':') {
        Some(idx) => {
            idx > 0
                && name[..idx]
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        }
        None => false,
    }
}

/// Name of `subject` as seen from inside `volume`.
pub fn relative_name<'a>(subject: &'a str, volume: &str) -> &'a str {
    match subject.strip_prefix(volume) {
        Some(rest) if rest.starts_with('/') => &rest[1..],
        _ => subject,
    }
}

/// Inverse of [`relative_name`].
pub fn fully_qualified(name: &str, volume: &str) -> String {
    if has_scheme(name) {
        name.to_string()
    } else if name.is_empty() {
        volume.to_string()
    } else {
        format!("{}/{}", volume, name)
    }
}

pub fn escape_filename(name: &str) -> String {
    utf8_percent_encode(name, FILENAME).to_string()
}

pub fn unescape_filename(name: &str) -> String {
    percent_decode_str(name).decode_utf8_lossy().into_owned()
}

pub fn escape_value(value: &str) -> String {
    utf8_percent_encode(value, VALUE).to_string()
}

pub fn unescape_value(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

pub fn dirname(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[..idx],
        None => "",
    }
}

pub fn basename(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Path component of a `file://` URI.
pub fn file_path(uri: &str) -> Option<&str> {
    uri.strip_prefix("file://")
}
