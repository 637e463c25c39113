use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use hearth_keybag::KeyBag;
use hearth_store::{
    Block, BlockstoreOpts, CarTransaction, CommitOpts, CompactionFetcher, EncryptedBlockstore,
    Error, Gateway, MemoryGateway, MetaHandler, StoreKind, TransactionMeta, RAW_CODE,
};
use parking_lot::Mutex;

/// Gateway wrapper that can be told to fail writes, for crash-window tests.
#[derive(Debug)]
struct FailingGateway {
    inner: Arc<MemoryGateway>,
    fail_meta_puts: AtomicBool,
    fail_data_puts: AtomicBool,
}

impl FailingGateway {
    fn new(inner: Arc<MemoryGateway>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_meta_puts: AtomicBool::new(false),
            fail_data_puts: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Gateway for FailingGateway {
    async fn put(
        &self,
        kind: StoreKind,
        name: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), Error> {
        match kind {
            StoreKind::Meta if self.fail_meta_puts.load(Ordering::SeqCst) => {
                return Err(Error::Gateway("meta put failed".into()))
            }
            StoreKind::Data if self.fail_data_puts.load(Ordering::SeqCst) => {
                return Err(Error::Gateway("data put failed".into()))
            }
            _ => {}
        }
        self.inner.put(kind, name, key, body).await
    }

    async fn get(&self, kind: StoreKind, name: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(kind, name, key).await
    }

    async fn delete(&self, kind: StoreKind, name: &str, key: &str) -> Result<(), Error> {
        self.inner.delete(kind, name, key).await
    }

    async fn destroy(&self, kind: StoreKind, name: &str) -> Result<(), Error> {
        self.inner.destroy(kind, name).await
    }
}

/// Handler remembering every committed block, so compaction can rebuild
/// the full state by fetching them.
#[derive(Debug, Default)]
struct RememberingHandler {
    committed: Mutex<Vec<Cid>>,
    applied: Mutex<Vec<TransactionMeta>>,
}

#[async_trait]
impl MetaHandler for RememberingHandler {
    async fn apply_meta(
        &self,
        _blockstore: &Arc<EncryptedBlockstore>,
        meta: &TransactionMeta,
    ) -> Result<(), Error> {
        self.applied.lock().push(meta.clone());
        Ok(())
    }

    async fn compact(&self, fetcher: &CompactionFetcher) -> Result<TransactionMeta, Error> {
        let committed = self.committed.lock().clone();
        let mut head = Vec::new();
        for cid in &committed {
            if fetcher.get(cid).await?.is_some() {
                head = vec![*cid];
            }
        }
        Ok(TransactionMeta { head })
    }
}

async fn commit_one(
    store: &Arc<EncryptedBlockstore>,
    payload: &[u8],
) -> Result<Cid, Error> {
    let tx = CarTransaction::new(store.clone());
    let block = Block::encode_raw(RAW_CODE, payload.to_vec());
    let cid = *block.cid();
    tx.put(block);
    store
        .commit_transaction(&tx, TransactionMeta { head: vec![cid] }, CommitOpts::default())
        .await?;
    Ok(cid)
}

#[tokio::test]
async fn commit_then_read_back() {
    let gateway = MemoryGateway::new();
    let store = EncryptedBlockstore::new(BlockstoreOpts::new("ledger", gateway));
    store.ready().await.unwrap();

    let cid = commit_one(&store, b"hello blocks").await.unwrap();

    assert_eq!(store.car_log().len(), 1);
    assert_eq!(
        store.get_block(&cid).await.unwrap(),
        Some(b"hello blocks".to_vec())
    );
    assert_eq!(store.last_meta().unwrap().head, vec![cid]);
}

#[tokio::test]
async fn transaction_reads_its_own_staged_blocks() {
    let gateway = MemoryGateway::new();
    let store = EncryptedBlockstore::new(BlockstoreOpts::new("ledger", gateway));
    store.ready().await.unwrap();

    let tx = CarTransaction::new(store.clone());
    let block = Block::encode_raw(RAW_CODE, b"staged".to_vec());
    let cid = *block.cid();
    tx.put(block);

    // visible inside the transaction, invisible outside until commit
    assert_eq!(tx.get(&cid).await.unwrap(), Some(b"staged".to_vec()));
    assert_eq!(store.get_block(&cid).await.unwrap(), None);
}

#[tokio::test]
async fn second_party_bootstraps_key_from_meta() {
    let gateway = MemoryGateway::new();
    let writer = EncryptedBlockstore::new(BlockstoreOpts::new("ledger", gateway.clone()));
    writer.ready().await.unwrap();
    let cid = commit_one(&writer, b"shared data").await.unwrap();

    // a fresh party with an empty key bag, same storage
    let mut opts = BlockstoreOpts::new("ledger", gateway);
    opts.key_bag = KeyBag::new();
    let reader = EncryptedBlockstore::new(opts);
    reader.ready().await.unwrap();

    assert_eq!(reader.car_log(), writer.car_log());
    assert_eq!(
        reader.get_block(&cid).await.unwrap(),
        Some(b"shared data".to_vec())
    );
}

#[tokio::test]
async fn failed_shard_write_leaves_no_trace() {
    let inner = MemoryGateway::new();
    let gateway = FailingGateway::new(inner.clone());
    let bag = KeyBag::new();

    let mut opts = BlockstoreOpts::new("ledger", gateway.clone());
    opts.key_bag = bag.clone();
    let store = EncryptedBlockstore::new(opts);
    store.ready().await.unwrap();

    gateway.fail_data_puts.store(true, Ordering::SeqCst);
    assert!(commit_one(&store, b"never stored").await.is_err());
    gateway.fail_data_puts.store(false, Ordering::SeqCst);

    // nothing was published, nothing is pending
    let mut opts = BlockstoreOpts::new("ledger", inner);
    opts.key_bag = bag;
    let fresh = EncryptedBlockstore::new(opts);
    fresh.ready().await.unwrap();
    assert!(fresh.car_log().is_empty());
}

#[tokio::test]
async fn crash_before_publish_is_recovered_from_wal() {
    let inner = MemoryGateway::new();
    let gateway = FailingGateway::new(inner.clone());
    let bag = KeyBag::new();

    let mut opts = BlockstoreOpts::new("ledger", gateway.clone());
    opts.key_bag = bag.clone();
    let store = EncryptedBlockstore::new(opts);
    store.ready().await.unwrap();

    // shards and WAL land, meta publication "crashes"
    gateway.fail_meta_puts.store(true, Ordering::SeqCst);
    let tx = CarTransaction::new(store.clone());
    let block = Block::encode_raw(RAW_CODE, b"almost lost".to_vec());
    let cid = *block.cid();
    tx.put(block);
    assert!(store
        .commit_transaction(&tx, TransactionMeta { head: vec![cid] }, CommitOpts::default())
        .await
        .is_err());

    // reopen over the same storage with the same keys
    let mut opts = BlockstoreOpts::new("ledger", inner.clone());
    opts.key_bag = bag;
    let reopened = EncryptedBlockstore::new(opts);
    reopened.ready().await.unwrap();

    assert_eq!(reopened.car_log().len(), 1);
    assert_eq!(
        reopened.get_block(&cid).await.unwrap(),
        Some(b"almost lost".to_vec())
    );

    // the pending op was consumed and its meta published
    let wal = hearth_store::WalStore::new("ledger".into(), inner.clone());
    assert!(wal.load().await.unwrap().operations.is_empty());

    // so even a party with a fresh key bag now sees the commit
    let third = EncryptedBlockstore::new(BlockstoreOpts::new("ledger", inner));
    third.ready().await.unwrap();
    assert_eq!(third.car_log().len(), 1);
}

#[tokio::test]
async fn oversized_block_fails_the_commit_before_any_write() {
    let gateway = MemoryGateway::new();
    let bag = KeyBag::new();

    let mut opts = BlockstoreOpts::new("ledger", gateway.clone());
    opts.key_bag = bag.clone();
    let store = EncryptedBlockstore::new(opts);
    store.ready().await.unwrap();

    // larger than any single CAR section may be
    let huge = vec![0u8; 4 * 1024 * 1024 + 1];
    assert!(commit_one(&store, &huge).await.is_err());
    assert!(store.car_log().is_empty());

    // nothing reached storage: no shard, no meta, no pending op
    let mut opts = BlockstoreOpts::new("ledger", gateway);
    opts.key_bag = bag;
    let fresh = EncryptedBlockstore::new(opts);
    fresh.ready().await.unwrap();
    assert!(fresh.car_log().is_empty());
}

#[tokio::test]
async fn compaction_folds_log_and_keeps_blocks() {
    let gateway = MemoryGateway::new();
    let handler = Arc::new(RememberingHandler::default());

    let mut opts = BlockstoreOpts::new("ledger", gateway.clone());
    opts.meta_handler = Some(handler.clone() as Arc<dyn MetaHandler>);
    opts.auto_compact = 0;
    let bag = opts.key_bag.clone();
    let store = EncryptedBlockstore::new(opts);
    store.ready().await.unwrap();

    let mut cids = Vec::new();
    for payload in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
        let cid = commit_one(&store, payload).await.unwrap();
        handler.committed.lock().push(cid);
        cids.push(cid);
    }
    assert_eq!(store.car_log().len(), 3);

    store.compact().await.unwrap();
    assert_eq!(store.car_log().len(), 1);

    for (cid, payload) in cids
        .iter()
        .zip([b"one".as_slice(), b"two".as_slice(), b"three".as_slice()])
    {
        assert_eq!(store.get_block(cid).await.unwrap(), Some(payload.to_vec()));
    }

    // a fresh party reads everything through the compacted group alone
    let mut opts = BlockstoreOpts::new("ledger", gateway);
    opts.key_bag = bag;
    let fresh = EncryptedBlockstore::new(opts);
    fresh.ready().await.unwrap();
    assert_eq!(fresh.car_log().len(), 1);
    for cid in &cids {
        assert!(fresh.get_block(cid).await.unwrap().is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_compaction_kicks_in_past_threshold() {
    let gateway = MemoryGateway::new();
    let handler = Arc::new(RememberingHandler::default());

    let mut opts = BlockstoreOpts::new("ledger", gateway);
    opts.meta_handler = Some(handler.clone() as Arc<dyn MetaHandler>);
    opts.auto_compact = 3;
    let store = EncryptedBlockstore::new(opts);
    store.ready().await.unwrap();

    for i in 0u8..5 {
        let cid = commit_one(&store, &[i; 16]).await.unwrap();
        handler.committed.lock().push(cid);
    }

    // the deferred compaction runs shortly after the threshold commit
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(store.car_log().len() < 5);
}
