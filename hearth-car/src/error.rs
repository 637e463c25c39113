use thiserror::Error;

/// Car utility error
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse CAR file: {0}")]
    Parsing(String),
    #[error("invalid CAR file: {0}")]
    InvalidFile(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cbor encoding error: {0}")]
    Cbor(String),
    #[error("section too large: {0}")]
    SectionTooLarge(usize),
}

impl From<cid::Error> for Error {
    fn from(err: cid::Error) -> Error {
        Error::Parsing(err.to_string())
    }
}
