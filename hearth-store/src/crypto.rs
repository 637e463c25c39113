use std::collections::BTreeMap;
use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hearth_keybag::KeysByFingerprint;
use libipld::Ipld;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::block::{decode_cbor, encode_cbor, Block};
use crate::error::Error;

/// Multicodec for an encrypted envelope block.
pub const ENCRYPTED_CODE: u64 = 0x18;

/// AES-GCM nonce length in bytes.
pub const IV_LENGTH: usize = 12;

/// How the per-envelope IV is produced.
///
/// `Random` is the safe general-purpose choice. `Hash` derives the IV from
/// the key and plaintext, making ciphertext deterministic so identical
/// shards written by different parties converge to the same CID; decode
/// verifies the derivation and rejects tampered IVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IvStrategy {
    #[default]
    Random,
    Hash,
}

impl IvStrategy {
    fn generate(&self, key: &[u8], plaintext: &[u8]) -> [u8; IV_LENGTH] {
        let mut iv = [0u8; IV_LENGTH];
        match self {
            IvStrategy::Random => rand::thread_rng().fill_bytes(&mut iv),
            IvStrategy::Hash => iv.copy_from_slice(&derive_iv(key, plaintext)),
        }
        iv
    }

    fn verify(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<(), Error> {
        if let IvStrategy::Hash = self {
            if iv != derive_iv(key, plaintext) {
                return Err(Error::Crypto("iv does not match plaintext".into()));
            }
        }
        Ok(())
    }
}

fn derive_iv(key: &[u8], plaintext: &[u8]) -> [u8; IV_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(plaintext);
    let digest = hasher.finalize();
    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(&digest[..IV_LENGTH]);
    iv
}

/// Encrypts and decrypts envelope blocks under a named key registry.
///
/// The envelope is a dag-cbor map `{iv, keyId, data}` where `keyId` is the
/// UTF-8 bytes of the key fingerprint. Decryption selects the key by that
/// fingerprint, so shards written before a rotation stay readable.
#[derive(Debug, Clone)]
pub struct KeyedCrypto {
    keys: Arc<KeysByFingerprint>,
    iv_strategy: IvStrategy,
}

impl KeyedCrypto {
    pub fn new(keys: Arc<KeysByFingerprint>, iv_strategy: IvStrategy) -> Self {
        Self { keys, iv_strategy }
    }

    pub fn keys(&self) -> &Arc<KeysByFingerprint> {
        &self.keys
    }

    /// Encrypts `plaintext` under the default key into an envelope block.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Block, Error> {
        let key = self.keys.default_key()?;
        let iv = self.iv_strategy.generate(key.material(), plaintext);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.material()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut envelope = BTreeMap::new();
        envelope.insert("iv".to_string(), Ipld::Bytes(iv.to_vec()));
        envelope.insert(
            "keyId".to_string(),
            Ipld::Bytes(key.fingerprint().as_bytes().to_vec()),
        );
        envelope.insert("data".to_string(), Ipld::Bytes(ciphertext));

        let bytes = encode_cbor(&Ipld::Map(envelope))?;
        // re-address the cbor payload under the envelope codec
        Ok(Block::encode_raw(ENCRYPTED_CODE, bytes.into_parts().1))
    }

    /// Decrypts an envelope block, selecting the key by its fingerprint.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, Error> {
        let value = decode_cbor(envelope)?;
        let Ipld::Map(map) = value else {
            return Err(Error::Encoding("envelope is not a map".into()));
        };
        let iv = bytes_field(&map, "iv")?;
        let key_id = bytes_field(&map, "keyId")?;
        let ciphertext = bytes_field(&map, "data")?;

        if iv.len() != IV_LENGTH {
            return Err(Error::Crypto(format!("bad iv length {}", iv.len())));
        }
        let fingerprint = std::str::from_utf8(key_id)
            .map_err(|_| Error::Encoding("keyId is not utf-8".into()))?;
        let key = self.keys.require(fingerprint)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.material()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), ciphertext.as_slice())
            .map_err(|_| Error::Crypto("decryption failed".into()))?;

        self.iv_strategy.verify(key.material(), iv, &plaintext)?;
        Ok(plaintext)
    }
}

fn bytes_field<'a>(map: &'a BTreeMap<String, Ipld>, name: &str) -> Result<&'a Vec<u8>, Error> {
    match map.get(name) {
        Some(Ipld::Bytes(bytes)) => Ok(bytes),
        _ => Err(Error::Encoding(format!("envelope missing {name:?}"))),
    }
}
