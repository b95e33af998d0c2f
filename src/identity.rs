//! Signing identities.
//!
//! While open for writing, an identity mirrors every `aff4:size` and
//! `aff4:sha256` that lands in the resolver into a private resolver. On close
//! that snapshot becomes a statement segment `<identity>/<uuid>`, signed
//! into `<identity>/<uuid>.sig`, next to the public key in
//! `<identity>/cert.pem`.

use std::fmt;

use log::{debug, info, warn};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto;
use crate::error::{Aff4Error, Result};
use crate::hash;
use crate::resolver::{Handle, HookId, Mode, Resolver, WeakResolver};
use crate::stream::encrypted;
use crate::urn::{self, attr, types};
use crate::zip::Compression;

pub const PREFIX: &str = "urn:aff4:identity/";
pub const CERT: &str = "cert.pem";

/// Attributes a statement vouches for.
pub const SIGNABLE: &[&str] = &[attr::SIZE, attr::SHA256];

pub fn identity_urn(public: &RsaPublicKey) -> Result<String> {
    Ok(format!("{}{}", PREFIX, hash::fingerprint(&crypto::public_key_der(public)?)))
}

pub fn cert_urn(identity: &str) -> String {
    format!("{}/{}", identity, CERT)
}

/// Make a private key known to the resolver, returns its identity URN.
pub fn load_private_key(resolver: &Resolver, pem: &str) -> Result<String> {
    let key = crypto::private_key_from_pem(pem)?;
    let urn = identity_urn(&key.to_public_key())?;
    resolver.set(&urn, attr::PRIVATE_KEY, pem.trim());
    Ok(urn)
}

pub fn private_key(resolver: &Resolver, identity: &str) -> Result<Option<RsaPrivateKey>> {
    resolver
        .resolve(identity, attr::PRIVATE_KEY)
        .map(|pem| crypto::private_key_from_pem(&pem))
        .transpose()
}

/// Public key from the loaded private key, else from the stored certificate.
pub fn public_key(resolver: &Resolver, identity: &str) -> Result<RsaPublicKey> {
    if let Some(key) = private_key(resolver, identity)? {
        return Ok(key.to_public_key());
    }

    let cert = resolver
        .resolve(identity, attr::CERTIFICATE)
        .unwrap_or_else(|| cert_urn(identity));
    let mut handle = resolver.open(&cert, Mode::Read)?;
    let stream = handle.stream()?;
    let size = stream.size() as usize;
    let pem = String::from_utf8_lossy(&stream.read_at(0, size)?).into_owned();
    crypto::public_key_from_pem(&pem)
}

/// Unwrap the encrypted stream keys wrapped for `identity`.
///
/// Run for each identity of a freshly loaded volume, a no-op unless the
/// identity's private key was loaded first.
pub fn load_keys(resolver: &Resolver, identity: &str) -> Result<()> {
    if resolver.resolve(identity, attr::PRIVATE_KEY).is_none() {
        return Ok(());
    }

    let prefix = format!("{} ", identity);
    for (subject, value) in resolver.search_attribute(attr::CRYPTO_RSA_WRAPPED) {
        if value.starts_with(&prefix) && resolver.resolve(&subject, attr::KEY).is_none() {
            encrypted::unwrap_rsa(resolver, &subject, &value)?;
        }
    }
    Ok(())
}

pub struct Identity {
    urn: String,
    resolver: WeakResolver,
    mode: Mode,
    private: Option<RsaPrivateKey>,
    signed: Resolver,
    hooks: Vec<HookId>,
    dirty: bool,
}

impl Identity {
    /// New identity for `key` stored in `volume`, opened for signing.
    pub fn create(resolver: &Resolver, volume: &str, key: &RsaPrivateKey) -> Result<Handle> {
        let urn = identity_urn(&key.to_public_key())?;

        resolver.set(&urn, attr::TYPE, types::IDENTITY);
        resolver.set(&urn, attr::STORED, volume);
        resolver.set(&urn, attr::PRIVATE_KEY, crypto::private_key_to_pem(key)?.trim());
        resolver.set(&urn, attr::DIRTY, 1);
        resolver.add(volume, attr::CONTAINS, &urn);

        resolver.open(&urn, Mode::Write)
    }

    pub fn open(resolver: &Resolver, urn: &str, mode: Mode) -> Result<Self> {
        let private = private_key(resolver, urn)?;
        if mode == Mode::Write && private.is_none() {
            return Err(Aff4Error::CryptoError(format!("no private key for {}", urn)));
        }

        let mut identity = Identity {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
            mode,
            private,
            signed: Resolver::new(),
            hooks: Vec::new(),
            dirty: mode == Mode::Write,
        };
        if mode == Mode::Write {
            identity.watch(resolver);
        }
        Ok(identity)
    }

    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn watch(&mut self, resolver: &Resolver) {
        for &attribute in SIGNABLE {
            let signed = self.signed.clone();
            self.hooks.push(resolver.on_set(Some(attribute), move |_, s, a, v| {
                signed.set(s, a, v);
            }));

            let signed = self.signed.clone();
            self.hooks.push(resolver.on_add(Some(attribute), move |_, s, a, v| {
                signed.add(s, a, v);
            }));
        }
    }

    fn unwatch(&mut self, resolver: &Resolver) {
        for id in self.hooks.drain(..) {
            resolver.remove_hook(id);
        }
    }

    /// Everything mirrored so far, in properties form.
    pub fn statement(&self) -> String {
        self.signed
            .subjects()
            .iter()
            .filter(|s| !is_sentinel(s))
            .map(|s| self.signed.export(s, ""))
            .collect()
    }

    /// Write the signed statement, nothing is signed when nothing was seen.
    pub fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write || !self.dirty {
            return Ok(());
        }
        let resolver = self.resolver.upgrade()?;
        self.unwatch(&resolver);

        let private = self
            .private
            .as_ref()
            .ok_or_else(|| Aff4Error::CryptoError(format!("no private key for {}", self.urn)))?;

        let text = self.statement();
        if !text.is_empty() {
            let volume = resolver.require(&self.urn, attr::STORED)?;
            let statement = format!("{}/{}", self.urn, uuid::Uuid::new_v4());
            let signature = crypto::sign(private, text.as_bytes());
            let cert = cert_urn(&self.urn);

            {
                let mut handle = resolver.open(&volume, Mode::Write)?;
                let vol = handle.volume()?;
                vol.writestr(&statement, text.as_bytes(), Compression::Deflated)?;
                vol.writestr(&format!("{}.sig", statement), &signature, Compression::Stored)?;
                if resolver.resolve(&cert, attr::TYPE).is_none() {
                    let pem = crypto::public_key_to_pem(&private.to_public_key())?;
                    vol.writestr(&cert, pem.as_bytes(), Compression::Stored)?;
                }
            }

            resolver.add(&volume, attr::IDENTITY, &self.urn);
            resolver.add(&self.urn, attr::STATEMENT, &statement);
            resolver.set(&self.urn, attr::CERTIFICATE, &cert);
            info!("{} signed {}", self.urn, statement);
        }

        resolver.set(&self.urn, attr::DIRTY, 0);
        self.dirty = false;
        Ok(())
    }
}

fn is_sentinel(subject: &str) -> bool {
    subject == urn::NULL || subject == urn::ZERO || subject == urn::GLOBAL
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// Statement data does not match its signature
    BadSignature { statement: String },
    /// A signed value differs from what the volume holds now
    Mismatch {
        subject: String,
        attribute: String,
        signed: String,
        actual: String,
    },
    /// A signed subject could not be read back
    Unreadable { subject: String, error: String },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::BadSignature { statement } => write!(f, "{}: signature does not verify", statement),
            Discrepancy::Mismatch {
                subject,
                attribute,
                signed,
                actual,
            } => write!(f, "{}: {} signed as {:?}, now {:?}", subject, attribute, signed, actual),
            Discrepancy::Unreadable { subject, error } => write!(f, "{}: unreadable ({})", subject, error),
        }
    }
}

/// Check every statement of `identity`, returns how many were checked.
pub fn verify<F>(resolver: &Resolver, identity: &str, mut report: F) -> Result<usize>
where
    F: FnMut(Discrepancy),
{
    let public = public_key(resolver, identity)?;
    let mut checked = 0;

    for statement in resolver.resolve_list(identity, attr::STATEMENT) {
        let data = read_all(resolver, &statement)?;
        let signature = read_all(resolver, &format!("{}.sig", statement))?;
        checked += 1;

        if crypto::verify(&public, &data, &signature).is_err() {
            warn!("{}: bad signature", statement);
            report(Discrepancy::BadSignature { statement });
            continue;
        }

        let signed = Resolver::new();
        signed.parse_properties(&String::from_utf8_lossy(&data), None);

        for (subject, value) in signed.search_attribute(attr::SHA256) {
            match rehash(resolver, &subject) {
                Ok(actual) if actual == value => debug!("{} matches", subject),
                Ok(actual) => report(Discrepancy::Mismatch {
                    subject,
                    attribute: attr::SHA256.to_string(),
                    signed: value,
                    actual,
                }),
                Err(e) => report(Discrepancy::Unreadable {
                    subject,
                    error: e.to_string(),
                }),
            }
        }

        for (subject, value) in signed.search_attribute(attr::SIZE) {
            let actual = resolver.resolve(&subject, attr::SIZE).unwrap_or_default();
            if actual != value {
                report(Discrepancy::Mismatch {
                    subject,
                    attribute: attr::SIZE.to_string(),
                    signed: value,
                    actual,
                });
            }
        }
    }
    Ok(checked)
}

fn read_all(resolver: &Resolver, urn: &str) -> Result<Vec<u8>> {
    let mut handle = resolver.open(urn, Mode::Read)?;
    let stream = handle.stream()?;
    let size = stream.size() as usize;
    stream.read_at(0, size)
}

/// Hash of what `subject` holds now, image bevies hash their plain bytes.
pub fn rehash(resolver: &Resolver, subject: &str) -> Result<String> {
    let image = urn::dirname(subject);
    let bevy = urn::basename(subject);
    let is_bevy = resolver.resolve(image, attr::TYPE).as_deref() == Some(types::IMAGE)
        && !bevy.is_empty()
        && bevy.bytes().all(|b| b.is_ascii_digit());

    if !is_bevy {
        return Ok(hash::sha256_b64(&read_all(resolver, subject)?));
    }

    let n: u64 = bevy
        .parse()
        .map_err(|_| Aff4Error::format(format!("bad bevy name {}", subject)))?;
    let bevy_size = resolver
        .require_u64(image, attr::CHUNK_SIZE)?
        .checked_mul(resolver.require_u64(image, attr::CHUNKS_IN_SEGMENT)?);
    let (bevy_size, offset) = bevy_size
        .and_then(|size| Some((size, n.checked_mul(size)?)))
        .ok_or_else(|| Aff4Error::format(format!("{}: bevy {} is out of range", image, n)))?;

    let mut handle = resolver.open(image, Mode::Read)?;
    let data = handle.stream()?.read_at(offset, bevy_size as usize)?;
    Ok(hash::sha256_b64(&data))
}
