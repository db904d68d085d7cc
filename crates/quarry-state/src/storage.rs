//! Storage interface used by the graph layer.
//!
//! Graph traversal only needs two read primitives (point lookup and prefix
//! scan) and two write primitives (put and delete). [`Snapshot`] serves
//! reads from an MVCC read transaction, so readers never block the writer;
//! [`WriteBatch`] wraps the single write transaction and sees its own
//! uncommitted writes.

use redb::{ReadTransaction, ReadableTable, WriteTransaction};

use crate::error::{StateError, StateResult};
use crate::tables::Table;

/// Read access to the key/value tables.
pub trait StorageRead {
    /// Point lookup of a single key.
    fn get(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>;
}

/// Write access on top of [`StorageRead`].
pub trait StorageWrite: StorageRead {
    fn put(&self, table: Table, key: &str, value: &[u8]) -> StateResult<()>;

    /// Remove a key. Returns true if it existed.
    fn delete(&self, table: Table, key: &str) -> StateResult<bool>;
}

/// A consistent point-in-time view of the store.
pub struct Snapshot {
    txn: ReadTransaction,
}

impl Snapshot {
    pub(crate) fn new(txn: ReadTransaction) -> Self {
        Self { txn }
    }
}

impl StorageRead for Snapshot {
    fn get(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let value = table.get(key).map_err(map_err!(Read))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

/// The store's single in-flight write transaction.
///
/// Nothing written through a batch is visible to other readers until
/// [`crate::StateStore::write`] commits it.
pub struct WriteBatch {
    txn: WriteTransaction,
}

impl WriteBatch {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    pub(crate) fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))
    }

    pub(crate) fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }
}

impl StorageRead for WriteBatch {
    fn get(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let value = table.get(key).map_err(map_err!(Read))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

impl StorageWrite for WriteBatch {
    fn put(&self, table: Table, key: &str, value: &[u8]) -> StateResult<()> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table.insert(key, value).map_err(map_err!(Write))?;
        Ok(())
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }
}
