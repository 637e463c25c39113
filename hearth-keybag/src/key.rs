use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Length of raw key material in bytes (AES-256).
pub const KEY_LENGTH: usize = 32;

/// Base58 encoding of the SHA-256 digest of `material`.
pub fn fingerprint_of(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    bs58::encode(digest).into_string()
}

pub(crate) fn generate_material() -> [u8; KEY_LENGTH] {
    let mut material = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut material);
    material
}

/// One piece of key material together with its fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyWithFingerprint {
    fingerprint: String,
    material: [u8; KEY_LENGTH],
}

impl KeyWithFingerprint {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn material(&self) -> &[u8; KEY_LENGTH] {
        &self.material
    }

    /// Base58 form of the raw material, suitable for handing to another
    /// party bootstrapping a bag for the same ledger.
    pub fn material_str(&self) -> String {
        bs58::encode(self.material).into_string()
    }
}

impl std::fmt::Debug for KeyWithFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print material
        f.debug_struct("KeyWithFingerprint")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Registry {
    keys: HashMap<String, Arc<KeyWithFingerprint>>,
    default: Option<String>,
}

/// Every key ever registered under one name, addressed by fingerprint.
///
/// Encryption always uses the default key; decryption selects by the
/// fingerprint found in the ciphertext envelope. Rotation via [`upsert`]
/// is non-destructive so historical shards stay readable.
///
/// [`upsert`]: KeysByFingerprint::upsert
#[derive(Debug)]
pub struct KeysByFingerprint {
    name: String,
    registry: RwLock<Registry>,
}

impl KeysByFingerprint {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `material`, returning the (possibly pre-existing) entry.
    ///
    /// The first key registered becomes the default; later keys only if
    /// `make_default` is set. Re-registering known material is a no-op apart
    /// from the default flag.
    pub fn upsert(
        &self,
        material: &[u8],
        make_default: bool,
    ) -> Result<Arc<KeyWithFingerprint>, Error> {
        let material: [u8; KEY_LENGTH] = material
            .try_into()
            .map_err(|_| Error::InvalidMaterial(material.len()))?;
        let fingerprint = fingerprint_of(&material);

        let mut registry = self.registry.write();
        let key = registry
            .keys
            .entry(fingerprint.clone())
            .or_insert_with(|| {
                Arc::new(KeyWithFingerprint {
                    fingerprint: fingerprint.clone(),
                    material,
                })
            })
            .clone();
        if make_default || registry.default.is_none() {
            registry.default = Some(fingerprint);
        }
        Ok(key)
    }

    /// Looks up a key: by fingerprint, or the default when `None`.
    pub fn get(&self, fingerprint: Option<&str>) -> Option<Arc<KeyWithFingerprint>> {
        let registry = self.registry.read();
        let fingerprint = match fingerprint {
            Some(fingerprint) => fingerprint,
            None => registry.default.as_deref()?,
        };
        registry.keys.get(fingerprint).cloned()
    }

    /// The key new ciphertext is written under.
    pub fn default_key(&self) -> Result<Arc<KeyWithFingerprint>, Error> {
        self.get(None)
            .ok_or_else(|| Error::NoDefaultKey(self.name.clone()))
    }

    /// Like [`get`](Self::get) but failing with the fingerprint that missed,
    /// for decode paths reporting unreadable ciphertext.
    pub fn require(&self, fingerprint: &str) -> Result<Arc<KeyWithFingerprint>, Error> {
        self.get(Some(fingerprint))
            .ok_or_else(|| Error::UnknownFingerprint(fingerprint.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let material = [7u8; KEY_LENGTH];
        assert_eq!(fingerprint_of(&material), fingerprint_of(&material));
        assert_ne!(fingerprint_of(&material), fingerprint_of(&[8u8; KEY_LENGTH]));
    }

    #[test]
    fn rejects_short_material() {
        let keys = KeysByFingerprint::new("@short:data@".into());
        assert!(matches!(
            keys.upsert(&[1u8; 16], true),
            Err(Error::InvalidMaterial(16))
        ));
    }

    #[test]
    fn upsert_known_material_is_idempotent() {
        let keys = KeysByFingerprint::new("@idem:data@".into());
        let a = keys.upsert(&[1u8; KEY_LENGTH], true).unwrap();
        keys.upsert(&[2u8; KEY_LENGTH], true).unwrap();
        let again = keys.upsert(&[1u8; KEY_LENGTH], false).unwrap();
        assert_eq!(a.fingerprint(), again.fingerprint());
        // non-default upsert does not steal the default slot
        assert_eq!(
            keys.default_key().unwrap().fingerprint(),
            fingerprint_of(&[2u8; KEY_LENGTH])
        );
    }
}
