use std::collections::BTreeMap;

use cid::Cid;
use hearth_car::{block_length, CarHeader, CarWriter};
use libipld::Ipld;

use crate::block::{decode_cbor, encode_cbor, Block};
use crate::error::Error;
use crate::transaction::TransactionMeta;

/// The CAR shards of one commit, in write order. The first shard holds the
/// commit header block as its root.
pub type CarGroup = Vec<Cid>;

/// All commits of a ledger, newest first.
pub type CarLog = Vec<CarGroup>;

/// Default shard threshold in bytes.
pub const DEFAULT_THRESHOLD: usize = 16 * 65536;

/// The root block of a committed CAR group: the transaction result plus the
/// car log as of this commit, which lets a reader with only the latest
/// group walk back through history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitHeader {
    pub cars: CarLog,
    pub compact: CarLog,
    pub meta: TransactionMeta,
}

impl CommitHeader {
    /// Header for a new commit. A compacting commit records the log it
    /// supersedes under `compact` and starts `cars` fresh.
    pub fn for_commit(meta: TransactionMeta, car_log: CarLog, compact: bool) -> Self {
        if compact {
            Self {
                cars: Vec::new(),
                compact: car_log,
                meta,
            }
        } else {
            Self {
                cars: car_log,
                compact: Vec::new(),
                meta,
            }
        }
    }

    pub fn to_block(&self) -> Result<Block, Error> {
        let mut map = BTreeMap::new();
        map.insert("cars".to_string(), encode_log(&self.cars));
        map.insert("compact".to_string(), encode_log(&self.compact));
        let mut meta = BTreeMap::new();
        meta.insert(
            "head".to_string(),
            Ipld::List(self.meta.head.iter().copied().map(Ipld::Link).collect()),
        );
        map.insert("meta".to_string(), Ipld::Map(meta));
        encode_cbor(&Ipld::Map(map))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let Ipld::Map(map) = decode_cbor(bytes)? else {
            return Err(Error::Encoding("commit header is not a map".into()));
        };
        let cars = decode_log(map.get("cars"))?;
        let compact = decode_log(map.get("compact"))?;
        let Some(Ipld::Map(meta)) = map.get("meta") else {
            return Err(Error::Encoding("commit header missing meta".into()));
        };
        let head = match meta.get("head") {
            Some(Ipld::List(items)) => links(items)?,
            _ => return Err(Error::Encoding("commit header missing head".into())),
        };
        Ok(Self {
            cars,
            compact,
            meta: TransactionMeta { head },
        })
    }
}

fn encode_log(log: &CarLog) -> Ipld {
    Ipld::List(
        log.iter()
            .map(|group| Ipld::List(group.iter().copied().map(Ipld::Link).collect()))
            .collect(),
    )
}

fn decode_log(value: Option<&Ipld>) -> Result<CarLog, Error> {
    let Some(Ipld::List(groups)) = value else {
        return Err(Error::Encoding("commit header missing car log".into()));
    };
    groups
        .iter()
        .map(|group| match group {
            Ipld::List(items) => links(items),
            _ => Err(Error::Encoding("car group is not a list".into())),
        })
        .collect()
}

fn links(items: &[Ipld]) -> Result<Vec<Cid>, Error> {
    items
        .iter()
        .map(|item| match item {
            Ipld::Link(cid) => Ok(*cid),
            _ => Err(Error::Encoding("expected link".into())),
        })
        .collect()
}

/// Splits one commit into CAR shards of at most roughly `threshold` bytes.
///
/// The header block leads the first shard; a block that overflows the
/// running size closes the current shard and becomes the root of the next,
/// so every shard is a valid CAR with a reachable root.
pub fn prepare_car_shards(
    threshold: usize,
    root: &Block,
    blocks: &[(Cid, Vec<u8>)],
) -> Result<Vec<Vec<u8>>, Error> {
    let mut shards = Vec::new();
    let mut current: Vec<(Cid, &[u8])> = vec![(*root.cid(), root.data())];
    let mut size = block_length(root.cid(), root.data());

    for (cid, data) in blocks {
        let len = block_length(cid, data);
        if size + len >= threshold {
            shards.push(write_car(&current)?);
            current = vec![(*cid, data)];
            size = len;
        } else {
            current.push((*cid, data));
            size += len;
        }
    }
    shards.push(write_car(&current)?);
    Ok(shards)
}

fn write_car(blocks: &[(Cid, &[u8])]) -> Result<Vec<u8>, Error> {
    let root = blocks[0].0;
    let mut writer = CarWriter::new(CarHeader::new(vec![root]), Vec::new());
    for (cid, data) in blocks {
        writer.write(*cid, data)?;
    }
    Ok(writer.finish()?)
}
