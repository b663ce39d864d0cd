//! Payload encryption for the switch hardware.
//!
//! The hardware uses AES-128 in ECB mode with its own padding rule: the pad
//! byte value equals the pad length and 1..16 bytes are always added, even
//! when the input is already block aligned. Discovery broadcasts are
//! encrypted with a fixed key derived from a shared secret by MD5.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};

use crate::error::Error;

const BLOCK: usize = 16;

/// AES-128-ECB cipher bound to one device key.
pub struct PayloadCipher {
    cipher: Aes128,
    key: [u8; 16],
}

impl PayloadCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            key: *key,
        }
    }

    /// Build a cipher from a key of arbitrary length, failing unless it is
    /// exactly 16 bytes (device keys are 16-character ASCII secrets).
    pub fn from_slice(key: &[u8]) -> Result<Self, Error> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| Error::CorruptMessage(format!("key must be 16 bytes, got {}", key.len())))?;
        Ok(Self::new(&key))
    }

    /// The raw key bytes (needed for the 3.1 payload signature).
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn encrypt(&self, raw: &[u8]) -> Vec<u8> {
        let mut data = pad(raw);
        for block in data.chunks_exact_mut(BLOCK) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        data
    }

    pub fn decrypt(&self, enc: &[u8]) -> Result<Vec<u8>, Error> {
        if enc.is_empty() || enc.len() % BLOCK != 0 {
            return Err(Error::CorruptMessage(format!(
                "ciphertext length {} is not a multiple of the block size",
                enc.len()
            )));
        }
        let mut data = enc.to_vec();
        for block in data.chunks_exact_mut(BLOCK) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        unpad(data)
    }
}

fn pad(raw: &[u8]) -> Vec<u8> {
    let padnum = BLOCK - raw.len() % BLOCK;
    let mut out = Vec::with_capacity(raw.len() + padnum);
    out.extend_from_slice(raw);
    out.resize(raw.len() + padnum, padnum as u8);
    out
}

fn unpad(mut data: Vec<u8>) -> Result<Vec<u8>, Error> {
    let padnum = *data.last().ok_or_else(|| Error::CorruptMessage("empty plaintext".into()))? as usize;
    if padnum == 0 || padnum > BLOCK || padnum > data.len() {
        return Err(Error::CorruptMessage(format!("bad pad byte {}", padnum)));
    }
    data.truncate(data.len() - padnum);
    Ok(data)
}

/// Discovery broadcasts are encrypted under MD5 of a shared secret.
pub fn discovery_key(secret: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.finalize().into()
}

/// Signature appended to 3.1 control payloads: characters [8..24] of the
/// hex MD5 digest of `data=<ciphertext>||lpv=<version>||<key>`.
pub fn sign_v31(ciphertext_b64: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(b"data=");
    hasher.update(ciphertext_b64);
    hasher.update(b"||lpv=3.1||");
    hasher.update(key);
    let digest = hex::encode(hasher.finalize());
    digest.as_bytes()[8..24].to_vec()
}
