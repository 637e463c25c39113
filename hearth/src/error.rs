/// Errors surfaced by the ledger.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store: {0}")]
    Store(#[from] hearth_store::Error),
    #[error("encoding: {0}")]
    Encoding(String),
    #[error("missing block: {0}")]
    MissingBlock(cid::Cid),
}

impl Error {
    /// Folds into the store error space at the meta handler seam.
    pub(crate) fn into_store(self) -> hearth_store::Error {
        match self {
            Error::Store(e) => e,
            other => hearth_store::Error::Handler(other.to_string()),
        }
    }
}
