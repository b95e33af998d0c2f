//! AES-256-CBC over another stream, one independent block at a time.
//!
//! Block `n` of the plain text is stored at `n * block_size` in the target,
//! encrypted with IV `le64(n) || le64(n)`. The last block is zero padded,
//! `aff4:size` keeps the real length.
//!
//! The master key comes from `aff4volatile:key`, a passphrase or an RSA
//! identity that can unwrap one of the `aff4:crypto:rsa_wrapped` values.

use std::io::SeekFrom;

use log::{debug, warn};

use crate::buf::copy_at;
use crate::crypto;
use crate::error::{Aff4Error, Result};
use crate::hash;
use crate::identity;
use crate::resolver::{Handle, Mode, Resolver, WeakResolver};
use crate::stream::{seek_position, Stream};
use crate::urn::{self, attr, types};

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct EncryptedOptions {
    pub block_size: u64,
    pub passphrase: Option<String>,
    /// Identity URNs the master key gets wrapped for
    pub recipients: Vec<String>,
}

impl Default for EncryptedOptions {
    fn default() -> Self {
        EncryptedOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            passphrase: None,
            recipients: Vec::new(),
        }
    }
}

pub struct Encrypted {
    urn: String,
    resolver: WeakResolver,
    mode: Mode,
    target: String,
    block_size: u64,
    key: Vec<u8>,
    size: u64,
    readptr: u64,

    buffer: Vec<u8>,
    dirty: bool,

    block: Option<(u64, Vec<u8>)>,
}

impl Encrypted {
    /// New encrypted stream `urn` writing its cipher text into `target`.
    ///
    /// `target` must not be checked out while the stream is written, every
    /// flushed block opens it for writing.
    pub fn create(
        resolver: &Resolver,
        volume: &str,
        urn: &str,
        target: &str,
        options: &EncryptedOptions,
    ) -> Result<Handle> {
        check_block_size(urn, options.block_size)?;
        if options.passphrase.is_none() && options.recipients.is_empty() {
            return Err(Aff4Error::CryptoError(format!(
                "{} needs a passphrase or a recipient",
                urn
            )));
        }

        let master = crypto::random_bytes(crypto::KEY_LEN);

        if let Some(passphrase) = &options.passphrase {
            let iv = crypto::random_bytes(crypto::IV_LEN);
            let rounds = crypto::random_fortification();
            let intermediate = crypto::derive_key(passphrase, &iv, rounds);

            let wrapped = crypto::encrypt(&intermediate, &iv, &master)?;
            let nonce = crypto::encrypt(&master, &iv, &iv)?;

            resolver.set(urn, attr::CRYPTO_IV, hash::to_b64(&iv));
            resolver.set(urn, attr::CRYPTO_FORTIFICATION, rounds);
            resolver.set(urn, attr::CRYPTO_PASSPHRASE_KEY, hash::to_b64(&wrapped));
            resolver.set(urn, attr::CRYPTO_NONCE, hash::to_b64(&nonce));
        }

        for recipient in &options.recipients {
            let public = identity::public_key(resolver, recipient)?;
            let wrapped = crypto::wrap_key(&public, &master)?;
            resolver.add(
                urn,
                attr::CRYPTO_RSA_WRAPPED,
                format!("{} {}", recipient, hash::to_b64(&wrapped)),
            );
        }

        resolver.set(urn, attr::TYPE, types::ENCRYPTED);
        resolver.set(urn, attr::INTERFACE, types::STREAM);
        resolver.set(urn, attr::STORED, volume);
        resolver.set(urn, attr::TARGET, target);
        resolver.set(urn, attr::CRYPTO_BLOCK_SIZE, options.block_size);
        resolver.set(urn, attr::KEY, hash::to_b64(&master));
        resolver.set(urn, attr::DIRTY, 1);
        resolver.add(volume, attr::CONTAINS, urn);

        resolver.open(urn, Mode::Write)
    }

    pub fn open(resolver: &Resolver, urn: &str, mode: Mode) -> Result<Self> {
        let target = resolver.require(urn, attr::TARGET)?;
        let block_size = resolver
            .resolve_u64(urn, attr::CRYPTO_BLOCK_SIZE)
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        check_block_size(urn, block_size)?;

        let size = resolver.resolve_u64(urn, attr::SIZE).unwrap_or(0);
        if mode == Mode::Write && size > 0 {
            return Err(Aff4Error::ReadOnly(format!("{} (already finished)", urn)));
        }

        let key = master_key(resolver, urn)?;

        Ok(Encrypted {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
            mode,
            target,
            block_size,
            key,
            size,
            readptr: 0,
            buffer: Vec::new(),
            dirty: mode == Mode::Write,
            block: None,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn load_block(&mut self, n: u64) -> Result<()> {
        if matches!(&self.block, Some((cached, _)) if *cached == n) {
            return Ok(());
        }

        let resolver = self.resolver.upgrade()?;
        let mut handle = resolver.open(&self.target, Mode::Read)?;
        let data = handle
            .stream()?
            .read_at(n * self.block_size, self.block_size as usize)?;
        if data.len() as u64 != self.block_size {
            return Err(Aff4Error::format(format!(
                "{}: block {} is short ({} bytes)",
                self.urn,
                n,
                data.len()
            )));
        }

        let plain = crypto::decrypt(&self.key, &crypto::block_iv(n), &data)?;
        self.block = Some((n, plain));
        Ok(())
    }

    // Encrypt and append whole blocks from the front of the buffer
    fn flush_blocks(&mut self, pad: bool) -> Result<()> {
        let bs = self.block_size as usize;
        if pad && self.buffer.len() % bs != 0 {
            let padded = self.buffer.len().next_multiple_of(bs);
            self.buffer.resize(padded, 0);
        }

        let whole = self.buffer.len() / bs * bs;
        if whole == 0 {
            return Ok(());
        }

        let resolver = self.resolver.upgrade()?;
        let mut handle = resolver.open(&self.target, Mode::Write)?;
        let target = handle.stream()?;
        let end = target.seek(SeekFrom::End(0))?;
        let mut n = end / self.block_size;

        for block in self.buffer[..whole].chunks(bs) {
            let cipher = crypto::encrypt(&self.key, &crypto::block_iv(n), block)?;
            target.write_all(&cipher)?;
            n += 1;
        }
        self.buffer.drain(..whole);
        Ok(())
    }
}

fn check_block_size(urn: &str, block_size: u64) -> Result<()> {
    if block_size == 0 || block_size % crypto::AES_BLOCK as u64 != 0 {
        return Err(Aff4Error::format(format!(
            "{}: crypto block size {} is not a multiple of {}",
            urn,
            block_size,
            crypto::AES_BLOCK
        )));
    }
    Ok(())
}

fn master_key(resolver: &Resolver, urn: &str) -> Result<Vec<u8>> {
    if let Some(key) = resolver.resolve(urn, attr::KEY) {
        return hash::from_b64(&key);
    }

    let passphrase = resolver
        .resolve(urn, attr::PASSPHRASE)
        .or_else(|| resolver.resolve(urn::GLOBAL, attr::PASSPHRASE));
    if let Some(passphrase) = passphrase {
        if resolver.resolve(urn, attr::CRYPTO_PASSPHRASE_KEY).is_some() {
            let key = unlock_passphrase(resolver, urn, &passphrase)?;
            resolver.set(urn, attr::KEY, hash::to_b64(&key));
            return Ok(key);
        }
    }

    for wrapped in resolver.resolve_list(urn, attr::CRYPTO_RSA_WRAPPED) {
        match unwrap_rsa(resolver, urn, &wrapped) {
            Ok(Some(key)) => return Ok(key),
            Ok(None) => {}
            Err(e) => warn!("{}: could not unwrap key: {}", urn, e),
        }
    }

    Err(Aff4Error::CryptoError(format!("no key available for {}", urn)))
}

/// Master key from a passphrase, rejected when the nonce does not match.
pub fn unlock_passphrase(resolver: &Resolver, urn: &str, passphrase: &str) -> Result<Vec<u8>> {
    let iv = hash::from_b64(&resolver.require(urn, attr::CRYPTO_IV)?)?;
    let rounds = resolver.require_u64(urn, attr::CRYPTO_FORTIFICATION)? as u32;
    let wrapped = hash::from_b64(&resolver.require(urn, attr::CRYPTO_PASSPHRASE_KEY)?)?;
    let nonce = hash::from_b64(&resolver.require(urn, attr::CRYPTO_NONCE)?)?;

    let intermediate = crypto::derive_key(passphrase, &iv, rounds);
    let master = crypto::decrypt(&intermediate, &iv, &wrapped)?;
    if crypto::encrypt(&master, &iv, &iv)? != nonce {
        return Err(Aff4Error::CryptoError(format!("wrong passphrase for {}", urn)));
    }
    Ok(master)
}

/// Unwrap one `<identity> <b64>` value with that identity's private key.
///
/// `None` when the identity's private key is not loaded. A successful
/// unwrap is stored in `aff4volatile:key`.
pub fn unwrap_rsa(resolver: &Resolver, urn: &str, value: &str) -> Result<Option<Vec<u8>>> {
    let (identity, wrapped) = value
        .split_once(' ')
        .ok_or_else(|| Aff4Error::format(format!("bad wrapped key on {}", urn)))?;

    let private = match identity::private_key(resolver, identity)? {
        Some(key) => key,
        None => return Ok(None),
    };
    let key = crypto::unwrap_key(&private, &hash::from_b64(wrapped.trim())?)?;

    debug!("{}: key unwrapped by {}", urn, identity);
    resolver.set(urn, attr::KEY, hash::to_b64(&key));
    Ok(Some(key))
}

impl Stream for Encrypted {
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
            let n = self.readptr / self.block_size;
            let offset = (self.readptr % self.block_size) as usize;
            self.load_block(n)?;

            let copied = match &self.block {
                Some((_, plain)) => copy_at(plain, offset, &mut buf[total..want]),
                None => 0,
            };
            if copied == 0 {
                break;
            }
            total += copied;
            self.readptr += copied as u64;
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.mode != Mode::Write || !self.dirty {
            return Err(Aff4Error::ReadOnly(self.urn.clone()));
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() as u64 >= self.block_size {
            self.flush_blocks(false)?;
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

    /// Pad out the last block and close the target behind it.
    fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write || !self.dirty {
            return Ok(());
        }
        self.flush_blocks(true)?;

        let resolver = self.resolver.upgrade()?;
        resolver.open(&self.target, Mode::Write)?.close()?;

        resolver.set(&self.urn, attr::SIZE, self.size);
        resolver.set(&self.urn, attr::DIRTY, 0);
        resolver.invalidate(&self.urn);
        self.dirty = false;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}
