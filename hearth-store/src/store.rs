use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cid::Cid;
use libipld::Ipld;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{decode_cbor, encode_cbor, Block};
use crate::error::Error;
use crate::gateway::{Gateway, StoreKind};

/// Fixed gateway key under which meta and WAL state live.
const MAIN_KEY: &str = "main";

/// Serde adapter for `Vec<Cid>` as CID strings.
pub(crate) mod cid_vec {
    use cid::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(cids: &[Cid], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(cids.iter().map(|cid| cid.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Cid>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| Cid::try_from(s.as_str()).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// The published description of a ledger: the CAR group of its latest
/// commit, plus optionally the key material a fresh party needs before it
/// can read anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMeta {
    #[serde(with = "cid_vec")]
    pub cars: Vec<Cid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// One entry of the serialized meta payload. `data` carries the dag-cbor
/// event block base64-encoded so the payload stays valid JSON.
#[derive(Debug, Serialize, Deserialize)]
struct MetaEntry {
    cid: String,
    data: String,
    parents: Vec<String>,
}

fn encode_meta_event(meta: &DbMeta, parents: &[Cid]) -> Result<Block, Error> {
    let mut data = BTreeMap::new();
    data.insert(
        "dbMeta".to_string(),
        Ipld::Bytes(serde_json::to_vec(meta)?),
    );
    let mut event = BTreeMap::new();
    event.insert("data".to_string(), Ipld::Map(data));
    event.insert(
        "parents".to_string(),
        Ipld::List(parents.iter().copied().map(Ipld::Link).collect()),
    );
    encode_cbor(&Ipld::Map(event))
}

fn decode_meta_event(bytes: &[u8]) -> Result<DbMeta, Error> {
    let Ipld::Map(event) = decode_cbor(bytes)? else {
        return Err(Error::Encoding("meta event is not a map".into()));
    };
    let Some(Ipld::Map(data)) = event.get("data") else {
        return Err(Error::Encoding("meta event missing data".into()));
    };
    let Some(Ipld::Bytes(db_meta)) = data.get("dbMeta") else {
        return Err(Error::Encoding("meta event missing dbMeta".into()));
    };
    Ok(serde_json::from_slice(db_meta)?)
}

/// CAR shard storage, keyed by shard CID.
#[derive(Debug)]
pub struct DataStore {
    name: String,
    gateway: Arc<dyn Gateway>,
}

impl DataStore {
    pub fn new(name: String, gateway: Arc<dyn Gateway>) -> Self {
        Self { name, gateway }
    }

    pub async fn save(&self, car: &Block) -> Result<(), Error> {
        self.gateway
            .put(
                StoreKind::Data,
                &self.name,
                &car.cid().to_string(),
                car.data().to_vec(),
            )
            .await
    }

    pub async fn load(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.gateway
            .get(StoreKind::Data, &self.name, &cid.to_string())
            .await?
            .ok_or(Error::CarNotFound(*cid))
    }

    pub async fn contains(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self
            .gateway
            .get(StoreKind::Data, &self.name, &cid.to_string())
            .await?
            .is_some())
    }

    pub async fn remove(&self, cid: &Cid) -> Result<(), Error> {
        self.gateway
            .delete(StoreKind::Data, &self.name, &cid.to_string())
            .await
    }

    pub async fn destroy(&self) -> Result<(), Error> {
        self.gateway.destroy(StoreKind::Data, &self.name).await
    }
}

/// Publishes and loads [`DbMeta`] descriptions.
///
/// Each publication is wrapped in an event block whose parents are the
/// previously seen meta events, giving readers a causal chain across
/// parties publishing to the same ledger.
#[derive(Debug)]
pub struct MetaStore {
    name: String,
    gateway: Arc<dyn Gateway>,
    parents: Mutex<Vec<Cid>>,
}

impl MetaStore {
    pub fn new(name: String, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name,
            gateway,
            parents: Mutex::new(Vec::new()),
        }
    }

    /// Loads the current meta payload, remembering its event CIDs as the
    /// parents of the next publication.
    pub async fn load(&self) -> Result<Option<Vec<DbMeta>>, Error> {
        let Some(bytes) = self
            .gateway
            .get(StoreKind::Meta, &self.name, MAIN_KEY)
            .await?
        else {
            return Ok(None);
        };
        let entries: Vec<MetaEntry> = serde_json::from_slice(&bytes)?;

        let mut metas = Vec::with_capacity(entries.len());
        let mut parents = Vec::with_capacity(entries.len());
        for entry in &entries {
            parents.push(Cid::try_from(entry.cid.as_str())?);
            let block = BASE64.decode(&entry.data)?;
            metas.push(decode_meta_event(&block)?);
        }
        *self.parents.lock() = parents;
        debug!(name = %self.name, count = metas.len(), "loaded meta");
        Ok(Some(metas))
    }

    /// Publishes `meta`, chaining it onto the parents seen so far.
    pub async fn save(&self, meta: &DbMeta) -> Result<Cid, Error> {
        let parents = self.parents.lock().clone();
        let event = encode_meta_event(meta, &parents)?;
        let entry = MetaEntry {
            cid: event.cid().to_string(),
            data: BASE64.encode(event.data()),
            parents: parents.iter().map(|cid| cid.to_string()).collect(),
        };
        let payload = serde_json::to_vec(&[entry])?;
        self.gateway
            .put(StoreKind::Meta, &self.name, MAIN_KEY, payload)
            .await?;
        let cid = *event.cid();
        *self.parents.lock() = vec![cid];
        debug!(name = %self.name, %cid, "published meta");
        Ok(cid)
    }

    pub async fn destroy(&self) -> Result<(), Error> {
        self.parents.lock().clear();
        self.gateway.destroy(StoreKind::Meta, &self.name).await
    }
}

/// One pending write: the CAR group of a commit that has been stored but
/// whose meta may not be published yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalOp {
    #[serde(with = "cid_vec")]
    pub cars: Vec<Cid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalState {
    pub operations: Vec<WalOp>,
}

/// Write-ahead log: commits are enqueued after their CAR shards are stored
/// and dequeued only once the meta pointing at them is published. Whatever
/// is left in the log on startup marks a crash window to recover.
#[derive(Debug)]
pub struct WalStore {
    name: String,
    gateway: Arc<dyn Gateway>,
}

impl WalStore {
    pub fn new(name: String, gateway: Arc<dyn Gateway>) -> Self {
        Self { name, gateway }
    }

    pub async fn load(&self) -> Result<WalState, Error> {
        match self
            .gateway
            .get(StoreKind::Wal, &self.name, MAIN_KEY)
            .await?
        {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(WalState::default()),
        }
    }

    pub async fn save(&self, state: &WalState) -> Result<(), Error> {
        self.gateway
            .put(
                StoreKind::Wal,
                &self.name,
                MAIN_KEY,
                serde_json::to_vec(state)?,
            )
            .await
    }

    pub async fn enqueue(&self, op: WalOp) -> Result<(), Error> {
        let mut state = self.load().await?;
        state.operations.push(op);
        self.save(&state).await
    }

    /// Drops the operation whose CAR group matches `cars`.
    pub async fn dequeue(&self, cars: &[Cid]) -> Result<(), Error> {
        let mut state = self.load().await?;
        state.operations.retain(|op| op.cars != cars);
        self.save(&state).await
    }

    pub async fn destroy(&self) -> Result<(), Error> {
        self.gateway.destroy(StoreKind::Wal, &self.name).await
    }
}
