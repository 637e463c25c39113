/// Errors produced by key bag operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no key named {0:?}")]
    NotFound(String),
    #[error("key material must be {expected} bytes, got {0}", expected = crate::KEY_LENGTH)]
    InvalidMaterial(usize),
    #[error("no key with fingerprint {0:?}")]
    UnknownFingerprint(String),
    #[error("registry {0:?} has no default key")]
    NoDefaultKey(String),
}
