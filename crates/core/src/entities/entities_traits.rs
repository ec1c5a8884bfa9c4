use async_trait::async_trait;

use super::{EntityKey, EntityType, Record, RecordFilter, SyncStatus};
use crate::errors::Result;
use crate::sync::{NewMutation, PendingMutation, RemoteEntity};

/// One atomic unit of local work: a record change and its outbox bookkeeping.
///
/// Everything in a `LocalChange` becomes visible together or not at all, so a reader never
/// sees a pending edit without its queued mutation (or the reverse).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalChange {
    pub upsert: Option<Record>,
    pub remove: Option<EntityKey>,
    /// Outbox rows to drop, by mutation id.
    pub discard_mutations: Vec<String>,
    pub enqueue: Option<NewMutation>,
}

impl LocalChange {
    pub fn upsert(record: Record) -> Self {
        Self {
            upsert: Some(record),
            ..Self::default()
        }
    }

    pub fn remove(key: EntityKey) -> Self {
        Self {
            remove: Some(key),
            ..Self::default()
        }
    }

    pub fn discarding(mut self, mutation_ids: Vec<String>) -> Self {
        self.discard_mutations = mutation_ids;
        self
    }

    pub fn enqueueing(mut self, mutation: NewMutation) -> Self {
        self.enqueue = Some(mutation);
        self
    }
}

/// Durable, transactional storage for cached records.
///
/// Partitions are keyed by [`EntityType`]. Reads are served from a connection pool; every
/// write is a single transaction. Storage failures surface as `Error::StorageIo` and are
/// never retried here.
#[async_trait]
pub trait LocalStoreTrait: Send + Sync {
    /// Upserts into the record's own partition.
    async fn put(&self, record: Record) -> Result<()>;

    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>>;

    /// Full scan of a partition, narrowed by `filter`. A fresh call re-scans.
    fn get_all(&self, entity_type: EntityType, filter: &RecordFilter) -> Result<Vec<Record>>;

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool>;

    async fn clear(&self, entity_type: EntityType) -> Result<usize>;

    fn count(&self, entity_type: EntityType) -> Result<usize>;

    /// All-or-nothing upsert of many records.
    async fn bulk_put(&self, records: Vec<Record>) -> Result<usize>;

    /// Applies a [`LocalChange`] atomically and returns the enqueued mutation, if any.
    async fn commit(&self, change: LocalChange) -> Result<Option<PendingMutation>>;

    /// Caches remote snapshots as `synced` in one transaction.
    ///
    /// Records with unsynced local edits keep their payload and status; only their
    /// `cached_at` moves. Entities deleted locally with a queued delete are skipped.
    /// Returns the local view of the remaining entities, in input order.
    async fn cache_remote(
        &self,
        entity_type: EntityType,
        entities: Vec<RemoteEntity>,
    ) -> Result<Vec<Record>>;

    /// Applies a remote acknowledgement of `mutation` and removes it from the outbox.
    ///
    /// The record always adopts the acknowledged `server_version`. It becomes `synced` with the
    /// server payload only when no other outbox rows remain for the entity.
    async fn acknowledge(
        &self,
        mutation: &PendingMutation,
        ack: RemoteEntity,
    ) -> Result<Option<Record>>;

    async fn set_sync_status(&self, key: EntityKey, status: SyncStatus) -> Result<bool>;

    /// Deletes every record of the partition matching `filter`.
    async fn delete_many(&self, entity_type: EntityType, filter: RecordFilter) -> Result<usize>;
}
