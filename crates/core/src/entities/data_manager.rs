//! Entity data manager: the application's single entry point for reading and writing entities.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    ChecklistEntry, ChecklistEntryPatch, EntityKey, EntityPayload, EntityType, LocalChange,
    LocalStoreTrait, Mission, Record, RecordFilter, SyncStatus,
};
use crate::errors::{Error, Result};
use crate::events::SyncEvent;
use crate::sync::{
    ConflictPolicy, DrainReport, MutationOperation, NewMutation, PendingMutation, RemoteEntity,
    RemoteError, RemoteErrorKind, SyncManager, SyncTrigger,
};

/// Read-through cache and write-through outbox over the local store.
///
/// Reads prefer the remote authority while online and fall back to the cache. Writes are
/// applied locally and queued in one transaction; the caller never waits on the network.
#[derive(Clone)]
pub struct EntityDataManager {
    store: Arc<dyn LocalStoreTrait>,
    sync: Arc<SyncManager>,
}

impl EntityDataManager {
    pub fn new(store: Arc<dyn LocalStoreTrait>, sync: Arc<SyncManager>) -> Self {
        Self { store, sync }
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Record> {
        let mut remote_err = None;
        if self.sync.network().is_online() {
            match self.fetch_remote(entity_type, id).await {
                Ok(entity) => {
                    let mut cached = self.store.cache_remote(entity_type, vec![entity]).await?;
                    return cached.pop().ok_or_else(|| Error::NotFound {
                        entity_type,
                        id: id.to_string(),
                    });
                }
                Err(err) => {
                    debug!(
                        "[DataManager] Remote read of {} {} failed, using cache: {}",
                        entity_type, id, err
                    );
                    remote_err = Some(err);
                }
            }
        }

        if let Some(record) = self.store.get(entity_type, id)? {
            return Ok(record);
        }
        Err(match remote_err {
            Some(RemoteError::Rejected {
                kind: RemoteErrorKind::NotFound,
                ..
            }) => Error::NotFound {
                entity_type,
                id: id.to_string(),
            },
            Some(err) if !err.is_transient() => self.sync.remote_error(err),
            _ => Error::Unavailable {
                entity_type,
                id: id.to_string(),
            },
        })
    }

    /// Lists entities matching `filter`.
    ///
    /// Payload field filters are passed to the remote; the status filter and the offline
    /// fallback are evaluated locally. Unsynced local records are part of the result either way.
    pub async fn list(&self, entity_type: EntityType, filter: RecordFilter) -> Result<Vec<Record>> {
        if self.sync.network().is_online() {
            match self.list_remote(entity_type, &filter.fields).await {
                Ok(entities) => {
                    let mut records = self.store.cache_remote(entity_type, entities).await?;
                    let seen: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
                    let unsynced = self
                        .store
                        .get_all(entity_type, &filter)?
                        .into_iter()
                        .filter(|record| !record.is_synced() && !seen.contains(&record.id));
                    records.extend(unsynced);
                    records.retain(|record| filter.matches(record));
                    return Ok(records);
                }
                Err(err) => {
                    debug!(
                        "[DataManager] Remote list of {} failed, using cache: {}",
                        entity_type, err
                    );
                }
            }
        }
        self.store.get_all(entity_type, &filter)
    }

    /// Creates an entity locally and queues it. The id comes from the payload or is generated.
    pub async fn create(&self, entity_type: EntityType, payload: serde_json::Value) -> Result<Record> {
        let serde_json::Value::Object(mut fields) = payload else {
            return Err(Error::invalid_payload("Entity payload must be a JSON object"));
        };
        let id = match fields.get("id").and_then(|value| value.as_str()) {
            Some(id) => id.to_string(),
            None => Uuid::now_v7().to_string(),
        };
        if self.store.get(entity_type, &id)?.is_some() {
            return Err(Error::invalid_payload(format!(
                "{} '{}' already exists",
                entity_type, id
            )));
        }
        fields.insert("id".to_string(), serde_json::Value::String(id.clone()));
        let payload = serde_json::Value::Object(fields);

        let record = Record::new_local(entity_type, id.clone(), payload.clone());
        let mutation = NewMutation::new(entity_type, id, MutationOperation::Create, payload);
        self.store
            .commit(LocalChange::upsert(record.clone()).enqueueing(mutation))
            .await?;
        self.after_local_write()?;
        Ok(record)
    }

    /// Applies a partial payload optimistically and queues it.
    ///
    /// Returns the updated local view; a record that was never cached is created from the patch.
    pub async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        partial_payload: serde_json::Value,
    ) -> Result<Record> {
        let mut record = match self.store.get(entity_type, id)? {
            Some(record) => record,
            None => Record::new_local(
                entity_type,
                id,
                serde_json::Value::Object(serde_json::Map::new()),
            ),
        };
        let base_version = record.server_version.clone();
        record.apply_local_patch(&partial_payload)?;

        let mutation = NewMutation::new(entity_type, id, MutationOperation::Update, partial_payload)
            .with_base_version(base_version);
        self.store
            .commit(LocalChange::upsert(record.clone()).enqueueing(mutation))
            .await?;
        self.after_local_write()?;
        Ok(record)
    }

    /// Removes the local record and queues the remote delete. Returns whether it was cached.
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let existing = self.store.get(entity_type, id)?;
        let base_version = existing.as_ref().and_then(|r| r.server_version.clone());
        let mutation = NewMutation::new(
            entity_type,
            id,
            MutationOperation::Delete,
            serde_json::Value::Null,
        )
        .with_base_version(base_version);
        self.store
            .commit(LocalChange::remove(EntityKey::new(entity_type, id)).enqueueing(mutation))
            .await?;
        self.after_local_write()?;
        Ok(existing.is_some())
    }

    /// Outstanding mutations, held conflicts included.
    pub fn pending_count(&self) -> Result<usize> {
        self.sync.outbox().pending_count()
    }

    /// Drops cached records that have no unsynced local edits. The outbox is untouched.
    pub async fn clear_cache(&self) -> Result<usize> {
        let mut removed = 0;
        for entity_type in EntityType::ALL {
            removed += self
                .store
                .delete_many(entity_type, RecordFilter::with_status(SyncStatus::Synced))
                .await?;
        }
        info!("[DataManager] Cleared {} cached records", removed);
        Ok(removed)
    }

    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.sync.sync_now().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.events().subscribe()
    }

    pub fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        self.sync.outbox().dead_letters()
    }

    /// Puts a dead-lettered mutation back in the queue.
    pub async fn retry_dead_letter(&self, mutation_id: &str) -> Result<bool> {
        let requeued = self.sync.outbox().requeue_dead_letter(mutation_id).await?;
        if requeued.is_some() && self.should_sync_on_write() {
            self.sync.request_drain(SyncTrigger::Manual);
        }
        Ok(requeued.is_some())
    }

    pub async fn discard_dead_letter(&self, mutation_id: &str) -> Result<bool> {
        self.sync.outbox().discard_dead_letter(mutation_id).await
    }

    pub async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        id: &str,
        policy: ConflictPolicy,
    ) -> Result<()> {
        self.sync.resolve_conflict(entity_type, id, policy).await
    }

    pub async fn get_mission(&self, id: &str) -> Result<Mission> {
        let record = self.get(EntityType::Mission, id).await?;
        EntityPayload::decode(&record)?.into_mission()
    }

    pub async fn list_checklist_entries(&self, mission_id: &str) -> Result<Vec<ChecklistEntry>> {
        let filter = RecordFilter::all().field("missionId", serde_json::json!(mission_id));
        self.list(EntityType::ChecklistEntry, filter)
            .await?
            .iter()
            .map(|record| EntityPayload::decode(record)?.into_checklist_entry())
            .collect()
    }

    pub async fn update_checklist_entry(
        &self,
        id: &str,
        patch: ChecklistEntryPatch,
    ) -> Result<ChecklistEntry> {
        let partial = serde_json::to_value(&patch)?;
        let record = self.update(EntityType::ChecklistEntry, id, partial).await?;
        EntityPayload::decode(&record)?.into_checklist_entry()
    }

    fn should_sync_on_write(&self) -> bool {
        self.sync.config().auto_sync_on_write && self.sync.network().is_online()
    }

    fn after_local_write(&self) -> Result<()> {
        self.sync.outbox().notify_pending_count()?;
        if self.should_sync_on_write() {
            self.sync.request_drain(SyncTrigger::LocalMutation);
        }
        Ok(())
    }

    async fn fetch_remote(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> std::result::Result<RemoteEntity, RemoteError> {
        let call = self.sync.remote().fetch(entity_type, id);
        match tokio::time::timeout(self.sync.config().request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    async fn list_remote(
        &self,
        entity_type: EntityType,
        filters: &[(String, serde_json::Value)],
    ) -> std::result::Result<Vec<RemoteEntity>, RemoteError> {
        let call = self.sync.remote().list(entity_type, filters);
        match tokio::time::timeout(self.sync.config().request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}
