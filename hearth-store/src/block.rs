use std::collections::HashMap;

use async_trait::async_trait;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::Ipld;
use multihash::{Code, MultihashDigest};

use crate::error::Error;

/// Multicodec for dag-cbor payloads.
pub const DAG_CBOR_CODE: u64 = 0x71;
/// Multicodec for raw byte payloads.
pub const RAW_CODE: u64 = 0x55;

/// An IPLD block: bytes addressed by the CID of those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Wraps pre-addressed bytes. The caller asserts that `cid` matches.
    pub fn new(cid: Cid, data: Vec<u8>) -> Self {
        Self { cid, data }
    }

    /// Addresses `data` under `codec` with a sha2-256 multihash.
    pub fn encode_raw(codec: u64, data: Vec<u8>) -> Self {
        let digest = Code::Sha2_256.digest(&data);
        Self {
            cid: Cid::new_v1(codec, digest),
            data,
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_parts(self) -> (Cid, Vec<u8>) {
        (self.cid, self.data)
    }
}

/// Encodes an IPLD value as a dag-cbor block.
pub fn encode_cbor(value: &Ipld) -> Result<Block, Error> {
    let data = DagCborCodec
        .encode(value)
        .map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(Block::encode_raw(DAG_CBOR_CODE, data))
}

/// Decodes dag-cbor bytes into an IPLD value.
pub fn decode_cbor(bytes: &[u8]) -> Result<Ipld, Error> {
    DagCborCodec
        .decode(bytes)
        .map_err(|e| Error::Encoding(e.to_string()))
}

/// Anything blocks can be fetched from by CID.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error>;
}

/// In-memory block set preserving insertion order, the staging area of a
/// transaction. Order matters: the commit pipeline writes blocks into CAR
/// shards in the order they were put.
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: HashMap<Cid, Vec<u8>>,
    order: Vec<Cid>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, block: Block) {
        let (cid, data) = block.into_parts();
        if self.blocks.insert(cid, data).is_none() {
            self.order.push(cid);
        }
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(|data| data.as_slice())
    }

    /// Blocks in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&Cid, &[u8])> {
        self.order
            .iter()
            .map(move |cid| (cid, self.blocks[cid].as_slice()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_blocks_are_content_addressed() {
        let value = Ipld::List(vec![Ipld::Integer(1), Ipld::String("two".into())]);
        let a = encode_cbor(&value).unwrap();
        let b = encode_cbor(&value).unwrap();
        assert_eq!(a.cid(), b.cid());
        assert_eq!(decode_cbor(a.data()).unwrap(), value);
    }

    #[test]
    fn memory_store_keeps_insertion_order() {
        let mut store = MemoryBlockstore::new();
        let blocks: Vec<_> = (0u8..4)
            .map(|i| Block::encode_raw(RAW_CODE, vec![i; 8]))
            .collect();
        for block in &blocks {
            store.put(block.clone());
        }
        // re-putting must not duplicate
        store.put(blocks[1].clone());

        let order: Vec<_> = store.entries().map(|(cid, _)| *cid).collect();
        assert_eq!(order, blocks.iter().map(|b| *b.cid()).collect::<Vec<_>>());
        assert_eq!(store.len(), 4);
    }
}
