//! Encrypted, content-addressed storage for hearth ledgers.
//!
//! Writes are staged in a [`CarTransaction`], committed as one or more CAR
//! shards, encrypted at shard granularity, and described by published meta.
//! The commit pipeline orders durability before visibility: shards are
//! stored and logged in the write-ahead log before meta points at them, so
//! a crash at any point leaves either an invisible commit (recovered or
//! dropped on the next start) or a fully visible one, never a dangling
//! pointer.
//!
//! The layering mirrors the stack: a [`Gateway`] moves raw bytes, the
//! stores give them meaning (shards, meta, WAL), the loader walks the car
//! log, and [`EncryptedBlockstore`] ties it together behind a
//! transactional surface for the CRDT layer above.

mod block;
mod commit;
mod crypto;
mod error;
mod gateway;
mod loader;
mod store;
mod transaction;

pub use crate::block::{
    decode_cbor, encode_cbor, Block, BlockFetcher, MemoryBlockstore, DAG_CBOR_CODE, RAW_CODE,
};
pub use crate::commit::{CarGroup, CarLog, CommitHeader, DEFAULT_THRESHOLD};
pub use crate::crypto::{IvStrategy, KeyedCrypto, ENCRYPTED_CODE, IV_LENGTH};
pub use crate::error::Error;
pub use crate::gateway::{FileGateway, Gateway, MemoryGateway, StoreKind};
pub use crate::store::{DataStore, DbMeta, MetaStore, WalOp, WalState, WalStore};
pub use crate::transaction::{
    BaseBlockstore, BlockstoreOpts, CarTransaction, CommitOpts, CompactionFetcher,
    EncryptedBlockstore, MetaHandler, TransactionMeta,
};
