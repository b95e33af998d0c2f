use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{Aff4Error, Result};

// Make the checksum api be similiar to the sha2 one
pub struct Checksum(crc32fast::Hasher);

impl Checksum {
    pub fn new() -> Checksum {
        Checksum(crc32fast::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hash = Checksum::new();
    hash.update(data);
    hash.finalize()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// The form content hashes take in the resolver.
pub fn sha256_b64(data: &[u8]) -> String {
    to_b64(&sha256(data))
}

/// Hex sha256, used for identity fingerprints.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

pub fn to_b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn from_b64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| Aff4Error::format(format!("bad base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_zip() {
        // Reference value from the zip appnote test vectors
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);

        let mut split = Checksum::new();
        split.update(b"1234");
        split.update(b"56789");
        assert_eq!(split.finalize(), 0xCBF4_3926);
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let b64 = sha256_b64(b"abc");
        assert_eq!(from_b64(&b64).unwrap(), sha256(b"abc").to_vec());
    }

    #[test]
    fn bad_base64() {
        assert!(from_b64("not base64!").is_err());
    }
}
