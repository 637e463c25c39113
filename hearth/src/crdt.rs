use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use hearth_keybag::KeyBag;
use hearth_store::{
    BlockstoreOpts, CarTransaction, CommitOpts, CompactionFetcher, EncryptedBlockstore, Gateway,
    IvStrategy, MetaHandler, TransactionMeta, DEFAULT_THRESHOLD,
};
use tracing::debug;

use crate::clock::CrdtClock;
use crate::error::Error;
use crate::helpers::{apply_bulk_update, clock_changes, do_compact, get_value};
use crate::types::{sanitize, Changes, ChangesOpts, CrdtMeta, DocUpdate, DocValue};

/// Configuration for a [`Crdt`] ledger.
#[derive(Debug, Clone)]
pub struct CrdtOpts {
    pub name: String,
    pub gateway: Arc<dyn Gateway>,
    pub key_bag: KeyBag,
    /// Store shards unencrypted.
    pub public: bool,
    pub iv_strategy: IvStrategy,
    /// CAR shard split threshold in bytes.
    pub threshold: usize,
    /// Auto-compact past this many commits; zero disables.
    pub auto_compact: usize,
}

impl CrdtOpts {
    pub fn new(name: impl Into<String>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name: name.into(),
            gateway,
            key_bag: KeyBag::new(),
            public: false,
            iv_strategy: IvStrategy::default(),
            threshold: DEFAULT_THRESHOLD,
            auto_compact: 100,
        }
    }
}

/// Bridges the blockstore back into the clock: metas arriving from storage
/// are merged into the head, and compaction replays the reachable state.
#[derive(Debug)]
struct CrdtMetaHandler {
    clock: Arc<CrdtClock>,
}

#[async_trait]
impl MetaHandler for CrdtMetaHandler {
    async fn apply_meta(
        &self,
        blockstore: &Arc<EncryptedBlockstore>,
        meta: &TransactionMeta,
    ) -> Result<(), hearth_store::Error> {
        self.clock
            .apply_head(blockstore.as_ref(), meta.head.clone(), None)
            .await
            .map_err(Error::into_store)
    }

    async fn compact(
        &self,
        fetcher: &CompactionFetcher,
    ) -> Result<TransactionMeta, hearth_store::Error> {
        let head = self.clock.head();
        do_compact(fetcher, &head)
            .await
            .map_err(Error::into_store)?;
        Ok(TransactionMeta { head })
    }
}

/// A document ledger: a merkle-clock CRDT over an encrypted blockstore.
///
/// All writes funnel through [`bulk`](Crdt::bulk) under a single-writer
/// queue; reads traverse the event DAG from the current head. Everything
/// is durable and published before it becomes visible locally.
#[derive(Debug)]
pub struct Crdt {
    blockstore: Arc<EncryptedBlockstore>,
    clock: Arc<CrdtClock>,
    write_queue: tokio::sync::Mutex<()>,
}

impl Crdt {
    pub fn new(opts: CrdtOpts) -> Arc<Self> {
        let clock = Arc::new(CrdtClock::new());
        let mut store_opts = BlockstoreOpts::new(opts.name, opts.gateway);
        store_opts.key_bag = opts.key_bag;
        store_opts.public = opts.public;
        store_opts.iv_strategy = opts.iv_strategy;
        store_opts.threshold = opts.threshold;
        store_opts.auto_compact = opts.auto_compact;
        store_opts.meta_handler = Some(Arc::new(CrdtMetaHandler {
            clock: clock.clone(),
        }) as Arc<dyn MetaHandler>);

        Arc::new(Self {
            blockstore: EncryptedBlockstore::new(store_opts),
            clock,
            write_queue: tokio::sync::Mutex::new(()),
        })
    }

    /// Loads published state and replays pending commits, once.
    pub async fn ready(&self) -> Result<(), Error> {
        self.blockstore.ready().await?;
        Ok(())
    }

    /// Applies a batch of document writes as one transaction and one clock
    /// event. The commit is durable and published before the local head
    /// moves.
    pub async fn bulk(&self, updates: Vec<DocUpdate>) -> Result<CrdtMeta, Error> {
        self.ready().await?;
        let _writer = self.write_queue.lock().await;

        let updates: Vec<DocUpdate> = updates
            .into_iter()
            .map(|mut update| {
                update.value = update.value.as_ref().map(sanitize);
                update
            })
            .collect();

        let prev_head = self.clock.head();
        let tx = CarTransaction::new(self.blockstore.clone());
        let head = apply_bulk_update(&tx, &prev_head, &updates).await?;

        self.blockstore
            .commit_transaction(
                &tx,
                TransactionMeta { head: head.clone() },
                CommitOpts::default(),
            )
            .await?;
        self.clock
            .apply_head(self.blockstore.as_ref(), head.clone(), Some(updates))
            .await?;

        debug!(head_len = head.len(), "bulk committed");
        Ok(CrdtMeta { head })
    }

    /// The current value of `id`, or `None` when absent or deleted.
    pub async fn get(&self, id: &str) -> Result<Option<DocValue>, Error> {
        self.ready().await?;
        get_value(self.blockstore.as_ref(), &self.clock.head(), id).await
    }

    /// Every live and deleted document with its current state.
    pub async fn all_docs(&self) -> Result<Changes, Error> {
        self.changes(&[], ChangesOpts::default()).await
    }

    /// Updates since the given head, newest first.
    pub async fn changes(&self, since: &[Cid], opts: ChangesOpts) -> Result<Changes, Error> {
        self.ready().await?;
        let head = self.clock.head();
        let updates = clock_changes(self.blockstore.as_ref(), &head, since, opts).await?;
        Ok(Changes { updates, head })
    }

    /// Folds the whole car log into one compacted commit.
    pub async fn compact(&self) -> Result<(), Error> {
        self.ready().await?;
        let _writer = self.write_queue.lock().await;
        self.blockstore.compact().await?;
        Ok(())
    }

    pub fn clock(&self) -> &CrdtClock {
        &self.clock
    }

    pub fn blockstore(&self) -> &Arc<EncryptedBlockstore> {
        &self.blockstore
    }

    /// Current clock head.
    pub fn head(&self) -> Vec<Cid> {
        self.clock.head()
    }

    /// Stops writes, drains in-flight commits and drops subscriptions.
    pub async fn close(&self) -> Result<(), Error> {
        self.clock.close();
        self.blockstore.close().await?;
        Ok(())
    }

    /// Deletes the ledger's stored artifacts.
    pub async fn destroy(&self) -> Result<(), Error> {
        self.blockstore.destroy().await?;
        Ok(())
    }
}
