//! Named symmetric keys for the hearth blockstore.
//!
//! A [`KeyBag`] maps logical key names (for example `@my-ledger:data@`) to a
//! [`KeysByFingerprint`] registry. Each registry holds every key material ever
//! registered under that name, addressed by the fingerprint of the material,
//! so that ciphertext written under an old key stays readable after rotation.
//!
//! Fingerprints are the base58 encoding of the SHA-256 digest of the raw key
//! material. They are safe to embed in ciphertext envelopes: recovering the
//! key from its fingerprint requires inverting the hash.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

mod error;
mod key;

pub use crate::error::Error;
pub use crate::key::{fingerprint_of, KeyWithFingerprint, KeysByFingerprint, KEY_LENGTH};

/// A collection of named key registries.
///
/// Cloning is cheap and clones share state. Lookups that may create a key
/// are serialized per bag, so two tasks asking for the same missing name
/// observe a single generated key.
#[derive(Debug, Clone, Default)]
pub struct KeyBag {
    named: Arc<Mutex<HashMap<String, Arc<KeysByFingerprint>>>>,
}

impl KeyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry for `name`, creating it on first use.
    ///
    /// When the registry does not exist yet, `material` seeds its default
    /// key; with no material a fresh random key is generated. Pass
    /// `fail_if_not_found` to turn the missing case into an error instead,
    /// which is what decryption paths want: a reader must never mint a key.
    pub async fn named_key(
        &self,
        name: &str,
        material: Option<&[u8]>,
        fail_if_not_found: bool,
    ) -> Result<Arc<KeysByFingerprint>, Error> {
        let mut named = self.named.lock().await;
        if let Some(keys) = named.get(name) {
            return Ok(keys.clone());
        }
        if fail_if_not_found {
            return Err(Error::NotFound(name.to_string()));
        }

        let keys = Arc::new(KeysByFingerprint::new(name.to_string()));
        match material {
            Some(material) => {
                keys.upsert(material, true)?;
            }
            None => {
                let generated = keys.upsert(&key::generate_material(), true)?;
                debug!(name, fingerprint = %generated.fingerprint(), "generated key");
            }
        }
        named.insert(name.to_string(), keys.clone());
        Ok(keys)
    }

    /// Registers `material` (base58) under `name` and makes it the default,
    /// keeping previously registered keys resolvable by fingerprint.
    pub async fn set_named_key(
        &self,
        name: &str,
        material: &str,
    ) -> Result<Arc<KeyWithFingerprint>, Error> {
        let decoded = bs58::decode(material)
            .into_vec()
            .map_err(|_| Error::InvalidMaterial(0))?;
        let mut named = self.named.lock().await;
        let keys = named
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(KeysByFingerprint::new(name.to_string())))
            .clone();
        drop(named);
        keys.upsert(&decoded, true)
    }

    /// Removes the registry for `name`, if any.
    pub async fn delete_named_key(&self, name: &str) -> Result<(), Error> {
        let mut named = self.named.lock().await;
        named
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_key_on_first_lookup() {
        let bag = KeyBag::new();
        let keys = bag.named_key("@test:data@", None, false).await.unwrap();
        let first = keys.default_key().unwrap();

        // a second lookup sees the same registry, not a new key
        let again = bag.named_key("@test:data@", None, false).await.unwrap();
        assert_eq!(again.default_key().unwrap().fingerprint(), first.fingerprint());
    }

    #[tokio::test]
    async fn fail_if_not_found_never_mints() {
        let bag = KeyBag::new();
        let err = bag.named_key("@missing:data@", None, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn rotation_keeps_old_keys_resolvable() {
        let bag = KeyBag::new();
        let keys = bag.named_key("@test:data@", None, false).await.unwrap();
        let first = keys.default_key().unwrap();

        let second = keys.upsert(&crate::key::generate_material(), true).unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());

        // new default, old key still addressable
        assert_eq!(keys.default_key().unwrap().fingerprint(), second.fingerprint());
        let old = keys.get(Some(first.fingerprint())).unwrap();
        assert_eq!(old.material(), first.material());
    }

    #[tokio::test]
    async fn set_named_key_round_trips_material() {
        let bag = KeyBag::new();
        let material = crate::key::generate_material();
        let encoded = bs58::encode(&material).into_string();

        let key = bag.set_named_key("@shared:data@", &encoded).await.unwrap();
        assert_eq!(key.material(), &material);
        assert_eq!(key.material_str(), encoded);

        // a second bag bootstrapped from the exported string agrees
        let other = KeyBag::new();
        let imported = other.set_named_key("@shared:data@", &encoded).await.unwrap();
        assert_eq!(imported.fingerprint(), key.fingerprint());
    }

    #[tokio::test]
    async fn delete_removes_registry() {
        let bag = KeyBag::new();
        bag.named_key("@gone:data@", None, false).await.unwrap();
        bag.delete_named_key("@gone:data@").await.unwrap();
        assert!(matches!(
            bag.named_key("@gone:data@", None, true).await,
            Err(Error::NotFound(_))
        ));
    }
}
