use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use hearth_car::CarReader;
use hearth_keybag::KeyBag;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::block::{Block, RAW_CODE};
use crate::commit::{prepare_car_shards, CarGroup, CarLog, CommitHeader};
use crate::crypto::{IvStrategy, KeyedCrypto, ENCRYPTED_CODE};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::store::{DataStore, DbMeta, MetaStore, WalOp, WalState, WalStore};
use crate::transaction::TransactionMeta;

/// One fetched and parsed CAR shard.
#[derive(Debug)]
struct ParsedCar {
    roots: Vec<Cid>,
    blocks: HashMap<Cid, Vec<u8>>,
}

/// Loads, commits and indexes the CAR shards of one ledger.
///
/// The car log is ordered newest first. Block reads walk the log and fault
/// in shards on demand; parsed shards are cached by CID, which is safe
/// because shard content is immutable.
#[derive(Debug)]
pub(crate) struct Loader {
    name: String,
    gateway: Arc<dyn Gateway>,
    data: DataStore,
    meta: MetaStore,
    wal: WalStore,
    key_bag: KeyBag,
    public: bool,
    iv_strategy: IvStrategy,
    threshold: usize,
    crypto: OnceCell<Option<KeyedCrypto>>,
    car_log: RwLock<CarLog>,
    parsed: Mutex<HashMap<Cid, Arc<ParsedCar>>>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl Loader {
    pub(crate) fn new(
        name: String,
        gateway: Arc<dyn Gateway>,
        key_bag: KeyBag,
        public: bool,
        iv_strategy: IvStrategy,
        threshold: usize,
    ) -> Self {
        Self {
            data: DataStore::new(name.clone(), gateway.clone()),
            meta: MetaStore::new(name.clone(), gateway.clone()),
            wal: WalStore::new(name.clone(), gateway.clone()),
            gateway,
            name,
            key_bag,
            public,
            iv_strategy,
            threshold,
            crypto: OnceCell::new(),
            car_log: RwLock::new(Vec::new()),
            parsed: Mutex::new(HashMap::new()),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn data_key_name(&self) -> String {
        format!("@{}:data@", self.name)
    }

    async fn crypto(&self) -> Result<Option<KeyedCrypto>, Error> {
        let crypto = self
            .crypto
            .get_or_try_init(|| async {
                if self.public {
                    return Ok::<_, Error>(None);
                }
                let keys = self
                    .key_bag
                    .named_key(&self.data_key_name(), None, false)
                    .await?;
                Ok(Some(KeyedCrypto::new(keys, self.iv_strategy)))
            })
            .await?;
        Ok(crypto.clone())
    }

    /// Key material to publish with meta, for first-sync bootstrap.
    async fn export_key(&self) -> Result<Option<String>, Error> {
        match self.crypto().await? {
            Some(crypto) => Ok(Some(crypto.keys().default_key()?.material_str())),
            None => Ok(None),
        }
    }

    pub(crate) fn car_log(&self) -> CarLog {
        self.car_log.read().clone()
    }

    pub(crate) fn car_log_len(&self) -> usize {
        self.car_log.read().len()
    }

    /// Brings the loader up to date with published meta, then replays the
    /// write-ahead log. Returns the transaction metas to integrate, oldest
    /// first.
    pub(crate) async fn start(&self) -> Result<Vec<TransactionMeta>, Error> {
        self.gateway.start(&self.name).await?;
        let mut applied = Vec::new();

        if let Some(db_metas) = self.meta.load().await? {
            for db_meta in db_metas {
                if let Some(key) = &db_meta.key {
                    if !self.public {
                        self.key_bag.set_named_key(&self.data_key_name(), key).await?;
                    }
                }
                if let Some(header) = self.merge_car_group(&db_meta.cars).await? {
                    applied.push(header.meta);
                }
            }
        }

        // Anything still in the WAL was committed but never published.
        let wal = self.wal.load().await?;
        if !wal.operations.is_empty() {
            debug!(name = %self.name, pending = wal.operations.len(), "recovering write-ahead log");
            for op in &wal.operations {
                if self.car_log.read().iter().any(|group| *group == op.cars) {
                    continue;
                }
                let mut complete = true;
                for cid in &op.cars {
                    if !self.data.contains(cid).await? {
                        complete = false;
                        break;
                    }
                }
                if !complete {
                    warn!(name = %self.name, "dropping incomplete pending commit");
                    continue;
                }
                if let Some(header) = self.merge_car_group(&op.cars).await? {
                    // the crash window ended before publication; finish it
                    self.meta
                        .save(&DbMeta {
                            cars: op.cars.clone(),
                            key: self.export_key().await?,
                        })
                        .await?;
                    applied.push(header.meta);
                }
            }
            self.wal.save(&WalState::default()).await?;
        }

        Ok(applied)
    }

    /// Integrates a published CAR group into the car log, returning its
    /// commit header when the group was new.
    pub(crate) async fn merge_car_group(
        &self,
        group: &[Cid],
    ) -> Result<Option<CommitHeader>, Error> {
        if group.is_empty() || self.car_log.read().iter().any(|g| g == group) {
            return Ok(None);
        }
        let header = self.header_for_group(group).await?;
        {
            let mut log = self.car_log.write();
            if log.iter().any(|g| g == group) {
                return Ok(None);
            }
            log.insert(0, group.to_vec());
            // adopt the history the commit carries with it
            for prev in &header.cars {
                if !log.iter().any(|g| g == prev) {
                    log.push(prev.clone());
                }
            }
        }
        Ok(Some(header))
    }

    async fn header_for_group(&self, group: &[Cid]) -> Result<CommitHeader, Error> {
        let first = group.first().ok_or_else(|| {
            Error::Encoding("car group is empty".into())
        })?;
        let parsed = self.load_car(first).await?;
        let root = *parsed
            .roots
            .first()
            .ok_or_else(|| Error::Encoding("car shard has no root".into()))?;
        let bytes = parsed.blocks.get(&root).ok_or(Error::NotFound(root))?;
        CommitHeader::from_bytes(bytes)
    }

    async fn load_car(&self, cid: &Cid) -> Result<Arc<ParsedCar>, Error> {
        if let Some(parsed) = self.parsed.lock().get(cid) {
            return Ok(parsed.clone());
        }
        let stored = self.data.load(cid).await?;
        let car_bytes = if cid.codec() == ENCRYPTED_CODE {
            let crypto = self.crypto().await?.ok_or(Error::MissingKey)?;
            crypto.decrypt(&stored)?
        } else {
            stored
        };
        let reader = CarReader::from_bytes(car_bytes)?;
        let roots = reader.header().roots.clone();
        let blocks = reader
            .blocks()
            .collect::<Result<HashMap<_, _>, _>>()?;
        let parsed = Arc::new(ParsedCar { roots, blocks });
        self.parsed.lock().insert(*cid, parsed.clone());
        Ok(parsed)
    }

    /// Finds a block by walking the car log, newest shard first.
    pub(crate) async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        let log = self.car_log();
        for group in &log {
            for car in group {
                let parsed = self.load_car(car).await?;
                if let Some(data) = parsed.blocks.get(cid) {
                    return Ok(Some(data.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Commits one transaction: header, shard split, encrypt, store, WAL,
    /// publish, then car log update and WAL dequeue, in that order. The
    /// commit lock serializes writers so shards never interleave.
    pub(crate) async fn commit(
        &self,
        blocks: Vec<(Cid, Vec<u8>)>,
        meta: &TransactionMeta,
        compact: bool,
    ) -> Result<CarGroup, Error> {
        let _guard = self.commit_lock.lock().await;

        let prev_log = self.car_log();
        let header = CommitHeader::for_commit(meta.clone(), prev_log, compact);
        let root = header.to_block()?;
        let shards = prepare_car_shards(self.threshold, &root, &blocks)?;

        let crypto = self.crypto().await?;
        let mut group = Vec::with_capacity(shards.len());
        let mut cars = Vec::with_capacity(shards.len());
        for shard in shards {
            let car = match &crypto {
                Some(crypto) => crypto.encrypt(&shard)?,
                None => Block::encode_raw(RAW_CODE, shard),
            };
            group.push(*car.cid());
            cars.push(car);
        }

        for car in &cars {
            self.data.save(car).await?;
        }
        self.wal.enqueue(WalOp { cars: group.clone() }).await?;
        self.meta
            .save(&DbMeta {
                cars: group.clone(),
                key: self.export_key().await?,
            })
            .await?;

        let superseded: Vec<Cid> = {
            let mut log = self.car_log.write();
            if compact {
                let old = log.iter().flatten().copied().collect();
                *log = vec![group.clone()];
                old
            } else {
                log.insert(0, group.clone());
                Vec::new()
            }
        };
        for cid in superseded {
            self.parsed.lock().remove(&cid);
            if let Err(e) = self.data.remove(&cid).await {
                warn!(name = %self.name, %cid, "failed to remove compacted shard: {e}");
            }
        }

        self.wal.dequeue(&group).await?;
        debug!(name = %self.name, shards = group.len(), compact, "committed");
        Ok(group)
    }

    /// Waits for an in-flight commit to finish.
    pub(crate) async fn drain(&self) {
        let _guard = self.commit_lock.lock().await;
    }

    /// Removes every stored artifact of this ledger.
    pub(crate) async fn destroy(&self) -> Result<(), Error> {
        self.car_log.write().clear();
        self.parsed.lock().clear();
        self.data.destroy().await?;
        self.meta.destroy().await?;
        self.wal.destroy().await?;
        Ok(())
    }
}
