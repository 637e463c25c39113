use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;

/// Which of the three per-ledger stores a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Data,
    Meta,
    Wal,
}

impl StoreKind {
    fn dir(&self) -> &'static str {
        match self {
            StoreKind::Data => "data",
            StoreKind::Meta => "meta",
            StoreKind::Wal => "wal",
        }
    }
}

/// Byte-level storage behind the data, meta and WAL stores.
///
/// Keys are scoped by ledger `name` and [`StoreKind`]; the data store uses
/// CID strings as keys, meta and WAL use well-known fixed keys.
#[async_trait]
pub trait Gateway: Send + Sync + std::fmt::Debug {
    /// Called once before the first operation on a ledger. Backends that
    /// need no preparation keep the default.
    async fn start(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn put(&self, kind: StoreKind, name: &str, key: &str, body: Vec<u8>)
        -> Result<(), Error>;
    async fn get(&self, kind: StoreKind, name: &str, key: &str) -> Result<Option<Vec<u8>>, Error>;
    async fn delete(&self, kind: StoreKind, name: &str, key: &str) -> Result<(), Error>;

    /// Removes everything stored for `kind` under `name`.
    async fn destroy(&self, kind: StoreKind, name: &str) -> Result<(), Error>;
}

/// Gateway keeping everything in process memory. The default for tests and
/// throwaway ledgers.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    entries: Mutex<HashMap<(StoreKind, String, String), Vec<u8>>>,
}

impl MemoryGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn put(
        &self,
        kind: StoreKind,
        name: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), Error> {
        trace!(?kind, name, key, len = body.len(), "memory put");
        self.entries
            .lock()
            .insert((kind, name.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get(&self, kind: StoreKind, name: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .entries
            .lock()
            .get(&(kind, name.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, kind: StoreKind, name: &str, key: &str) -> Result<(), Error> {
        self.entries
            .lock()
            .remove(&(kind, name.to_string(), key.to_string()));
        Ok(())
    }

    async fn destroy(&self, kind: StoreKind, name: &str) -> Result<(), Error> {
        self.entries
            .lock()
            .retain(|(k, n, _), _| !(*k == kind && n == name));
        Ok(())
    }
}

/// Gateway persisting to a directory tree: `<base>/<name>/<kind>/<key>`.
///
/// Writes go through a temporary file and a rename so a crash mid-write
/// never leaves a truncated object behind.
#[derive(Debug)]
pub struct FileGateway {
    base: PathBuf,
}

impl FileGateway {
    pub fn new(base: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { base: base.into() })
    }

    fn path(&self, kind: StoreKind, name: &str, key: &str) -> PathBuf {
        self.base.join(name).join(kind.dir()).join(key)
    }
}

#[async_trait]
impl Gateway for FileGateway {
    async fn put(
        &self,
        kind: StoreKind,
        name: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), Error> {
        let path = self.path(kind, name, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(?kind, name, key, len = body.len(), "file put");
        Ok(())
    }

    async fn get(&self, kind: StoreKind, name: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match tokio::fs::read(self.path(kind, name, key)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, kind: StoreKind, name: &str, key: &str) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path(kind, name, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self, kind: StoreKind, name: &str) -> Result<(), Error> {
        match tokio::fs::remove_dir_all(self.base.join(name).join(kind.dir())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_gateway_scopes_by_kind_and_name() {
        let gateway = MemoryGateway::new();
        gateway
            .put(StoreKind::Data, "a", "k", b"one".to_vec())
            .await
            .unwrap();
        gateway
            .put(StoreKind::Meta, "a", "k", b"two".to_vec())
            .await
            .unwrap();

        assert_eq!(
            gateway.get(StoreKind::Data, "a", "k").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(
            gateway.get(StoreKind::Meta, "a", "k").await.unwrap(),
            Some(b"two".to_vec())
        );
        assert_eq!(gateway.get(StoreKind::Data, "b", "k").await.unwrap(), None);

        gateway.delete(StoreKind::Data, "a", "k").await.unwrap();
        assert_eq!(gateway.get(StoreKind::Data, "a", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_gateway_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FileGateway::new(dir.path());

        gateway
            .put(StoreKind::Wal, "ledger", "main", b"state".to_vec())
            .await
            .unwrap();
        assert_eq!(
            gateway.get(StoreKind::Wal, "ledger", "main").await.unwrap(),
            Some(b"state".to_vec())
        );

        // delete is idempotent
        gateway.delete(StoreKind::Wal, "ledger", "main").await.unwrap();
        gateway.delete(StoreKind::Wal, "ledger", "main").await.unwrap();
        assert_eq!(
            gateway.get(StoreKind::Wal, "ledger", "main").await.unwrap(),
            None
        );
    }
}
