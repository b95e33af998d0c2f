use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{Aff4Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const AES_BLOCK: usize = 16;

pub const DEFAULT_KEY_BITS: usize = 2048;

fn crypto_err<E: std::fmt::Display>(e: E) -> Aff4Error {
    Aff4Error::CryptoError(e.to_string())
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// PBKDF2 iteration count, never 0.
pub fn random_fortification() -> u32 {
    (rand::random::<u16>() as u32).max(1)
}

/// AES-256-CBC with no padding, `data` must be whole blocks.
pub fn encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % AES_BLOCK != 0 {
        return Err(Aff4Error::CryptoError(format!(
            "{} bytes is not a multiple of the cipher block",
            data.len()
        )));
    }
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(crypto_err)?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(data))
}

pub fn decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(crypto_err)?;
    cipher.decrypt_padded_vec_mut::<NoPadding>(data).map_err(crypto_err)
}

/// IV for block `n` of an encrypted stream.
pub fn block_iv(n: u64) -> [u8; IV_LEN] {
    let mut iv = [0; IV_LEN];
    iv[..8].copy_from_slice(&n.to_le_bytes());
    iv[8..].copy_from_slice(&n.to_le_bytes());
    iv
}

/// Intermediate key from a passphrase, PBKDF2-HMAC-SHA256 salted with the iv.
pub fn derive_key(passphrase: &str, salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut key = [0; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, &mut key);
    key
}

pub fn generate_key(bits: usize) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(crypto_err)
}

pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(crypto_err)
}

pub fn private_key_to_pem(key: &RsaPrivateKey) -> Result<String> {
    Ok(key.to_pkcs8_pem(LineEnding::LF).map_err(crypto_err)?.to_string())
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).map_err(crypto_err)
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String> {
    key.to_public_key_pem(LineEnding::LF).map_err(crypto_err)
}

pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key.to_public_key_der().map_err(crypto_err)?.as_bytes().to_vec())
}

/// PKCS#1 v1.5 signature over the SHA-256 of `data`.
pub fn sign(key: &RsaPrivateKey, data: &[u8]) -> Vec<u8> {
    SigningKey::<Sha256>::new(key.clone()).sign(data).to_vec()
}

pub fn verify(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<()> {
    let signature = Signature::try_from(signature).map_err(crypto_err)?;
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(data, &signature)
        .map_err(|e| Aff4Error::IntegrityError(format!("bad signature: {}", e)))
}

pub fn wrap_key(key: &RsaPublicKey, secret: &[u8]) -> Result<Vec<u8>> {
    key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, secret)
        .map_err(crypto_err)
}

pub fn unwrap_key(key: &RsaPrivateKey, wrapped: &[u8]) -> Result<Vec<u8>> {
    key.decrypt(Pkcs1v15Encrypt, wrapped).map_err(crypto_err)
}
