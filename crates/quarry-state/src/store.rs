//! StateStore: redb-backed persistence for the Quarry resource graph.
//!
//! The store hands out two kinds of access: read-only [`Snapshot`]s, which
//! are MVCC views that never block the writer, and closures run inside the
//! single write transaction via [`StateStore::write`]. A write closure that
//! returns `Err` aborts its transaction, so no partial change is ever
//! visible.

use std::path::Path;
use std::sync::Arc;

use quarry_core::naming::STANDARD_RESOURCE_CLASSES;
use redb::{Database, ReadableDatabase};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::graph::{Graph, GraphWriter};
use crate::storage::{Snapshot, WriteBatch};
use crate::tables::*;
use crate::types::ResourceClass;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.bootstrap()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.bootstrap()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables and seed the standard resource classes.
    fn bootstrap(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(*table).map_err(map_err!(Table))?;
        }
        let batch = WriteBatch::new(txn);
        {
            let writer = GraphWriter::new(&batch);
            for name in STANDARD_RESOURCE_CLASSES {
                if writer.reader().resource_class(name)?.is_none() {
                    writer.put_resource_class(&ResourceClass {
                        name: (*name).to_string(),
                        is_custom: false,
                    })?;
                }
            }
        }
        batch.commit()
    }

    /// A consistent read-only view of the current committed state.
    pub fn snapshot(&self) -> StateResult<Snapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(Snapshot::new(txn))
    }

    /// Run `f` against a fresh snapshot's graph.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Graph<'_>) -> Result<T, E>,
        E: From<StateError>,
    {
        let snapshot = self.snapshot()?;
        f(Graph::new(&snapshot))
    }

    /// Run `f` inside the write transaction. The transaction commits when
    /// `f` returns `Ok` and aborts when it returns `Err`.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&WriteBatch) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let batch = WriteBatch::new(txn);
        match f(&batch) {
            Ok(value) => {
                batch.commit()?;
                Ok(value)
            }
            Err(err) => {
                batch.abort()?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn put_provider(store: &StateStore, id: &str) {
        store
            .write(|batch| GraphWriter::new(batch).put_provider(&ResourceProvider::new(id, id)))
            .unwrap();
    }

    #[test]
    fn standard_classes_seeded() {
        let store = StateStore::open_in_memory().unwrap();
        let classes = store
            .read(|graph| graph.resource_classes())
            .unwrap();
        assert_eq!(classes.len(), STANDARD_RESOURCE_CLASSES.len());
        assert!(classes.iter().all(|c| !c.is_custom));
    }

    #[test]
    fn committed_write_is_visible() {
        let store = StateStore::open_in_memory().unwrap();
        put_provider(&store, "cn1");
        let provider = store.read(|graph| graph.provider("cn1")).unwrap();
        assert_eq!(provider.map(|p| p.name), Some("cn1".to_string()));
    }

    #[test]
    fn failed_write_is_rolled_back() {
        let store = StateStore::open_in_memory().unwrap();
        let result: StateResult<()> = store.write(|batch| {
            GraphWriter::new(batch).put_provider(&ResourceProvider::new("cn1", "cn1"))?;
            Err(StateError::NotFound("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.read(|graph| graph.provider("cn1")).unwrap().is_none());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let store = StateStore::open_in_memory().unwrap();
        put_provider(&store, "cn1");
        let snapshot = store.snapshot().unwrap();
        put_provider(&store, "cn2");

        let old = Graph::new(&snapshot);
        assert_eq!(old.root_ids().unwrap(), vec!["cn1"]);
        let fresh = store.read(|graph| graph.root_ids()).unwrap();
        assert_eq!(fresh, vec!["cn1", "cn2"]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("graph.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            put_provider(&store, "cn1");
            store
                .write(|batch| GraphWriter::new(batch).set_global_generation(7))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.read(|graph| graph.provider("cn1")).unwrap().is_some());
        assert_eq!(store.read(|graph| graph.global_generation()).unwrap(), 7);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .read(|graph| {
                assert!(graph.root_ids()?.is_empty());
                assert_eq!(graph.global_generation()?, 0);
                assert!(graph.consumer("nope")?.is_none());
                Ok::<_, StateError>(())
            })
            .unwrap();
    }
}
