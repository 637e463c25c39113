use cid::Cid;

/// Errors produced by the blockstore, its stores and the commit pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("car: {0}")]
    Car(#[from] hearth_car::Error),
    #[error("keybag: {0}")]
    KeyBag(#[from] hearth_keybag::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("encoding: {0}")]
    Encoding(String),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("gateway: {0}")]
    Gateway(String),
    #[error("block not found: {0}")]
    NotFound(Cid),
    #[error("car not found: {0}")]
    CarNotFound(Cid),
    #[error("store requires a key but none is configured")]
    MissingKey,
    #[error("no meta handler configured for this blockstore")]
    NoMetaHandler,
    #[error("meta handler: {0}")]
    Handler(String),
    #[error("blockstore is closed")]
    Closed,
}

impl From<cid::Error> for Error {
    fn from(e: cid::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
