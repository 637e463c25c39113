use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::DagCbor;

use crate::error::Error;

/// A CAR v1 header: the list of root CIDs plus the format version.
#[derive(Debug, Clone, Default, DagCbor, PartialEq, Eq)]
pub struct CarHeader {
    #[ipld]
    pub roots: Vec<Cid>,
    #[ipld]
    pub version: u64,
}

impl CarHeader {
    pub fn new(roots: Vec<Cid>) -> Self {
        Self { roots, version: 1 }
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
        let header: CarHeader = DagCborCodec
            .decode(buffer)
            .map_err(|e| Error::Parsing(e.to_string()))?;

        if header.roots.is_empty() {
            return Err(Error::Parsing("empty CAR file".to_owned()));
        }

        if header.version != 1 {
            return Err(Error::InvalidFile(
                "only CAR file version 1 is supported".to_string(),
            ));
        }

        Ok(header)
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        DagCborCodec
            .encode(self)
            .map_err(|e| Error::Cbor(e.to_string()))
    }
}
