use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use hearth_keybag::KeyBag;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::block::{Block, BlockFetcher, MemoryBlockstore};
use crate::commit::{CarGroup, CarLog, DEFAULT_THRESHOLD};
use crate::crypto::IvStrategy;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::loader::Loader;

/// What a transaction produced, carried from the writer through the commit
/// header to every reader of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionMeta {
    pub head: Vec<Cid>,
}

/// Per-commit options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOpts {
    /// This commit replaces the whole car log instead of extending it.
    pub compact: bool,
}

/// Configuration for [`EncryptedBlockstore`].
#[derive(Debug, Clone)]
pub struct BlockstoreOpts {
    pub name: String,
    pub gateway: Arc<dyn Gateway>,
    pub key_bag: KeyBag,
    /// Skip encryption entirely; shards are stored as plain CAR bytes.
    pub public: bool,
    pub iv_strategy: IvStrategy,
    /// Shard split threshold in bytes.
    pub threshold: usize,
    /// Auto-compact once the car log grows past this many commits.
    /// Zero disables it.
    pub auto_compact: usize,
    pub meta_handler: Option<Arc<dyn MetaHandler>>,
}

impl BlockstoreOpts {
    pub fn new(name: impl Into<String>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name: name.into(),
            gateway,
            key_bag: KeyBag::new(),
            public: false,
            iv_strategy: IvStrategy::default(),
            threshold: DEFAULT_THRESHOLD,
            auto_compact: 100,
            meta_handler: None,
        }
    }
}

/// Hooks the domain layer above the blockstore plugs in: integrating
/// transaction metas arriving from storage, and rebuilding a compacted
/// state through a [`CompactionFetcher`].
#[async_trait]
pub trait MetaHandler: Send + Sync + std::fmt::Debug {
    async fn apply_meta(
        &self,
        blockstore: &Arc<EncryptedBlockstore>,
        meta: &TransactionMeta,
    ) -> Result<(), Error>;

    async fn compact(&self, fetcher: &CompactionFetcher) -> Result<TransactionMeta, Error>;
}

/// A staging area for one transaction's blocks.
///
/// Reads fall through to the parent blockstore, so a transaction sees its
/// own writes plus everything already committed. Nothing leaves the
/// process until the transaction is committed.
pub struct CarTransaction {
    parent: Arc<dyn BlockFetcher>,
    staged: Mutex<MemoryBlockstore>,
}

impl std::fmt::Debug for CarTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarTransaction")
            .field("staged", &self.staged.lock().len())
            .finish_non_exhaustive()
    }
}

impl CarTransaction {
    pub fn new(parent: Arc<dyn BlockFetcher>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            staged: Mutex::new(MemoryBlockstore::new()),
        })
    }

    pub fn put(&self, block: Block) {
        self.staged.lock().put(block);
    }

    pub async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        if let Some(data) = self.staged.lock().get(cid) {
            return Ok(Some(data.to_vec()));
        }
        self.parent.get_block(cid).await
    }

    pub fn is_empty(&self) -> bool {
        self.staged.lock().is_empty()
    }

    /// Snapshot of staged blocks in insertion order.
    pub(crate) fn entries(&self) -> Vec<(Cid, Vec<u8>)> {
        self.staged
            .lock()
            .entries()
            .map(|(cid, data)| (*cid, data.to_vec()))
            .collect()
    }
}

#[async_trait]
impl BlockFetcher for CarTransaction {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        self.get(cid).await
    }
}

/// Transactional blockstore with no durability: commits merge the staged
/// blocks into an in-memory committed set. The durable pipeline lives in
/// [`EncryptedBlockstore`]; this base form backs layers that only need
/// transaction semantics, and it is where commit atomicity is easiest to
/// see in isolation.
#[derive(Debug, Default)]
pub struct BaseBlockstore {
    committed: Mutex<MemoryBlockstore>,
    last_meta: Mutex<Option<TransactionMeta>>,
}

impl BaseBlockstore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transaction(self: &Arc<Self>) -> Arc<CarTransaction> {
        CarTransaction::new(self.clone())
    }

    /// Makes a transaction's staged blocks visible, atomically from the
    /// point of view of readers of this store.
    pub fn commit_transaction(&self, tx: &CarTransaction, meta: TransactionMeta) {
        let entries = tx.entries();
        let mut committed = self.committed.lock();
        for (cid, data) in entries {
            committed.put(Block::new(cid, data));
        }
        *self.last_meta.lock() = Some(meta);
    }

    pub fn last_meta(&self) -> Option<TransactionMeta> {
        self.last_meta.lock().clone()
    }
}

#[async_trait]
impl BlockFetcher for BaseBlockstore {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.committed.lock().get(cid).map(|data| data.to_vec()))
    }
}

/// Block reader used during compaction. Every block it serves is also
/// staged into a transaction, so the set of blocks touched while
/// rebuilding the state becomes exactly the content of the compacted CAR.
#[derive(Debug)]
pub struct CompactionFetcher {
    blockstore: Arc<EncryptedBlockstore>,
    tx: Arc<CarTransaction>,
}

impl CompactionFetcher {
    fn new(blockstore: Arc<EncryptedBlockstore>) -> Self {
        let tx = CarTransaction::new(blockstore.clone());
        Self { blockstore, tx }
    }

    pub async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        let Some(data) = self.blockstore.get_block(cid).await? else {
            return Ok(None);
        };
        self.tx.put(Block::new(*cid, data.clone()));
        Ok(Some(data))
    }
}

#[async_trait]
impl BlockFetcher for CompactionFetcher {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        self.get(cid).await
    }
}

/// The ledger blockstore: encrypted CAR shards behind a transactional
/// surface.
///
/// All writes go through [`CarTransaction`]s committed here; reads walk
/// the car log via the loader. Commit ordering guarantees a reader never
/// observes meta pointing at shards that are not durable yet.
#[derive(Debug)]
pub struct EncryptedBlockstore {
    me: Weak<Self>,
    loader: Loader,
    meta_handler: Option<Arc<dyn MetaHandler>>,
    auto_compact: usize,
    started: OnceCell<()>,
    last_meta: Mutex<Option<TransactionMeta>>,
    compacting: AtomicBool,
    closed: AtomicBool,
}

impl EncryptedBlockstore {
    pub fn new(opts: BlockstoreOpts) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            loader: Loader::new(
                opts.name,
                opts.gateway,
                opts.key_bag,
                opts.public,
                opts.iv_strategy,
                opts.threshold,
            ),
            meta_handler: opts.meta_handler,
            auto_compact: opts.auto_compact,
            started: OnceCell::new(),
            last_meta: Mutex::new(None),
            compacting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Loads published meta and replays the write-ahead log, once. Safe to
    /// call from every operation; later calls are free.
    pub async fn ready(&self) -> Result<(), Error> {
        self.started
            .get_or_try_init(|| async {
                let metas = self.loader.start().await?;
                if let Some(handler) = &self.meta_handler {
                    let me = self.me.upgrade().ok_or(Error::Closed)?;
                    for meta in &metas {
                        handler.apply_meta(&me, meta).await?;
                        *self.last_meta.lock() = Some(meta.clone());
                    }
                }
                Ok::<_, Error>(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        self.loader.get_block(cid).await
    }

    /// Commits a transaction's staged blocks with its resulting meta.
    pub async fn commit_transaction(
        &self,
        tx: &CarTransaction,
        meta: TransactionMeta,
        opts: CommitOpts,
    ) -> Result<CarGroup, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let group = self.loader.commit(tx.entries(), &meta, opts.compact).await?;
        *self.last_meta.lock() = Some(meta);

        if !opts.compact && self.auto_compact > 0 && self.loader.car_log_len() > self.auto_compact
        {
            self.defer_compact();
        }
        Ok(group)
    }

    /// Integrates meta arriving from storage (another party's commit).
    pub async fn apply_meta(self: &Arc<Self>, cars: &[Cid]) -> Result<(), Error> {
        if let Some(header) = self.loader.merge_car_group(cars).await? {
            if let Some(handler) = &self.meta_handler {
                handler.apply_meta(self, &header.meta).await?;
            }
            *self.last_meta.lock() = Some(header.meta);
        }
        Ok(())
    }

    /// Rewrites the ledger as a single CAR group holding only the blocks
    /// reachable from the current state. No-op when a compaction is
    /// already running or there is nothing to fold.
    pub async fn compact(&self) -> Result<(), Error> {
        let Some(handler) = self.meta_handler.clone() else {
            return Err(Error::NoMetaHandler);
        };
        if self.loader.car_log_len() < 2 {
            return Ok(());
        }
        if self.compacting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.compact_inner(handler).await;
        self.compacting.store(false, Ordering::SeqCst);
        result
    }

    async fn compact_inner(&self, handler: Arc<dyn MetaHandler>) -> Result<(), Error> {
        let me = self.me.upgrade().ok_or(Error::Closed)?;
        let fetcher = CompactionFetcher::new(me);
        let meta = handler.compact(&fetcher).await?;
        self.commit_transaction(&fetcher.tx, meta, CommitOpts { compact: true })
            .await?;
        debug!(len = self.loader.car_log_len(), "compacted");
        Ok(())
    }

    fn defer_compact(&self) {
        let me = self.me.clone();
        tokio::spawn(async move {
            // let the committing caller return first
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(store) = me.upgrade() {
                if let Err(e) = store.compact().await {
                    warn!("auto-compaction failed: {e}");
                }
            }
        });
    }

    /// Meta of the most recent local or integrated commit.
    pub fn last_meta(&self) -> Option<TransactionMeta> {
        self.last_meta.lock().clone()
    }

    pub fn car_log(&self) -> CarLog {
        self.loader.car_log()
    }

    /// Stops accepting writes and waits for an in-flight commit to finish.
    pub async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        self.loader.drain().await;
        Ok(())
    }

    /// Deletes every stored artifact of this ledger.
    pub async fn destroy(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        self.loader.destroy().await
    }
}

#[async_trait]
impl BlockFetcher for EncryptedBlockstore {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        EncryptedBlockstore::get_block(self, cid).await
    }
}
