use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use fieldsync_core::entities::{
    EntityKey, EntityType, LocalChange, LocalStoreTrait, Record, RecordFilter, SyncStatus,
};
use fieldsync_core::errors::Result;
use fieldsync_core::sync::{MutationOperation, OutboxStatus, PendingMutation, RemoteEntity};

use super::model::{format_timestamp, RecordDB};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::outbox::{discard_outbox_mutations, write_outbox_mutation};
use crate::schema::{outbox, records};

pub(crate) fn load_record(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: &str,
) -> Result<Option<RecordDB>> {
    Ok(records::table
        .find((entity_type.as_str(), id))
        .first::<RecordDB>(conn)
        .optional()
        .map_err(StorageError::from)?)
}

pub(crate) fn upsert_record(conn: &mut SqliteConnection, row: &RecordDB) -> Result<()> {
    diesel::insert_into(records::table)
        .values(row)
        .on_conflict((records::entity_type, records::id))
        .do_update()
        .set(row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn delete_record(conn: &mut SqliteConnection, entity_type: EntityType, id: &str) -> Result<bool> {
    let deleted = diesel::delete(records::table.find((entity_type.as_str(), id)))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(deleted > 0)
}

/// Outbox rows still owed to the remote for one entity (pending or held).
fn open_mutation_count(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<i64> {
    Ok(outbox::table
        .filter(outbox::entity_type.eq(entity_type.as_str()))
        .filter(outbox::entity_id.eq(entity_id))
        .filter(outbox::status.eq_any([
            OutboxStatus::Pending.as_str(),
            OutboxStatus::Conflict.as_str(),
        ]))
        .select(count_star())
        .first(conn)
        .map_err(StorageError::from)?)
}

fn load_partition(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    filter: &RecordFilter,
) -> Result<Vec<Record>> {
    let mut query = records::table
        .filter(records::entity_type.eq(entity_type.as_str()))
        .into_boxed();
    if let Some(status) = filter.sync_status {
        query = query.filter(records::sync_status.eq(status.as_str()));
    }
    let rows = query
        .order(records::id.asc())
        .load::<RecordDB>(conn)
        .map_err(StorageError::from)?;

    let mut matched = Vec::with_capacity(rows.len());
    for row in rows {
        let record = row.into_domain()?;
        if filter.matches_fields(&record.payload) {
            matched.push(record);
        }
    }
    Ok(matched)
}

/// SQLite-backed record cache.
pub struct RecordRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl RecordRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl LocalStoreTrait for RecordRepository {
    async fn put(&self, record: Record) -> Result<()> {
        let row = RecordDB::from_domain(&record)?;
        self.writer.exec(move |conn| upsert_record(conn, &row)).await
    }

    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
        let mut conn = get_connection(&self.pool)?;
        load_record(&mut conn, entity_type, id)?
            .map(RecordDB::into_domain)
            .transpose()
    }

    fn get_all(&self, entity_type: EntityType, filter: &RecordFilter) -> Result<Vec<Record>> {
        let mut conn = get_connection(&self.pool)?;
        load_partition(&mut conn, entity_type, filter)
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.writer
            .exec(move |conn| delete_record(conn, entity_type, &id))
            .await
    }

    async fn clear(&self, entity_type: EntityType) -> Result<usize> {
        let cleared = self
            .writer
            .exec(move |conn| {
                Ok(diesel::delete(
                    records::table.filter(records::entity_type.eq(entity_type.as_str())),
                )
                .execute(conn)
                .map_err(StorageError::from)?)
            })
            .await?;
        debug!("[LocalStore] Cleared {} {} records", cleared, entity_type);
        Ok(cleared)
    }

    fn count(&self, entity_type: EntityType) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let count: i64 = records::table
            .filter(records::entity_type.eq(entity_type.as_str()))
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count as usize)
    }

    async fn bulk_put(&self, records_in: Vec<Record>) -> Result<usize> {
        let rows = records_in
            .iter()
            .map(RecordDB::from_domain)
            .collect::<Result<Vec<_>>>()?;
        self.writer
            .exec(move |conn| {
                for row in &rows {
                    upsert_record(conn, row)?;
                }
                Ok(rows.len())
            })
            .await
    }

    async fn commit(&self, change: LocalChange) -> Result<Option<PendingMutation>> {
        let upsert = change.upsert.as_ref().map(RecordDB::from_domain).transpose()?;
        self.writer
            .exec(move |conn| {
                if let Some(row) = &upsert {
                    upsert_record(conn, row)?;
                }
                if let Some(key) = &change.remove {
                    delete_record(conn, key.entity_type, &key.id)?;
                }
                discard_outbox_mutations(conn, &change.discard_mutations)?;
                change
                    .enqueue
                    .map(|mutation| write_outbox_mutation(conn, mutation))
                    .transpose()
            })
            .await
    }

    async fn cache_remote(
        &self,
        entity_type: EntityType,
        entities: Vec<RemoteEntity>,
    ) -> Result<Vec<Record>> {
        self.writer
            .exec(move |conn| {
                let now = Utc::now();
                let mut cached = Vec::with_capacity(entities.len());
                for entity in entities {
                    match load_record(conn, entity_type, &entity.id)? {
                        Some(existing) if existing.sync_status != SyncStatus::Synced.as_str() => {
                            // unsynced local edits win over the remote snapshot
                            let mut row = existing;
                            row.cached_at = Some(format_timestamp(&now));
                            upsert_record(conn, &row)?;
                            cached.push(row.into_domain()?);
                        }
                        None if open_mutation_count(conn, entity_type, &entity.id)? > 0 => {
                            // deleted locally, delete not yet acknowledged
                        }
                        existing => {
                            let mut record = Record::from_remote(
                                entity_type,
                                entity.id,
                                entity.payload,
                                entity.server_version,
                            );
                            record.cached_at = Some(now);
                            if let Some(previous) = existing.map(RecordDB::into_domain).transpose()? {
                                // a refetch of an unchanged snapshot is not a local change
                                if previous.payload == record.payload
                                    && previous.server_version == record.server_version
                                {
                                    record.local_updated_at = previous.local_updated_at;
                                }
                            }
                            upsert_record(conn, &RecordDB::from_domain(&record)?)?;
                            cached.push(record);
                        }
                    }
                }
                Ok(cached)
            })
            .await
    }

    async fn acknowledge(
        &self,
        mutation: &PendingMutation,
        ack: RemoteEntity,
    ) -> Result<Option<Record>> {
        let mutation = mutation.clone();
        self.writer
            .exec(move |conn| {
                diesel::delete(outbox::table.find(mutation.id.as_str()))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if mutation.operation == MutationOperation::Delete {
                    return Ok(None);
                }
                let Some(mut row) = load_record(conn, mutation.entity_type, &mutation.entity_id)?
                else {
                    return Ok(None);
                };

                row.server_version = Some(ack.server_version);
                if open_mutation_count(conn, mutation.entity_type, &mutation.entity_id)? == 0 {
                    row.payload = serde_json::to_string(&ack.payload)?;
                    row.sync_status = SyncStatus::Synced.as_str().to_string();
                    row.cached_at = Some(format_timestamp(&Utc::now()));
                }
                upsert_record(conn, &row)?;
                row.into_domain().map(Some)
            })
            .await
    }

    async fn set_sync_status(&self, key: EntityKey, status: SyncStatus) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let updated = diesel::update(records::table.find((key.entity_type.as_str(), key.id)))
                    .set(records::sync_status.eq(status.as_str()))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(updated > 0)
            })
            .await
    }

    async fn delete_many(&self, entity_type: EntityType, filter: RecordFilter) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let ids: Vec<String> = load_partition(conn, entity_type, &filter)?
                    .into_iter()
                    .map(|record| record.id)
                    .collect();
                if ids.is_empty() {
                    return Ok(0);
                }
                Ok(diesel::delete(
                    records::table
                        .filter(records::entity_type.eq(entity_type.as_str()))
                        .filter(records::id.eq_any(ids)),
                )
                .execute(conn)
                .map_err(StorageError::from)?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::sync::NewMutation;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::db::open;
    use crate::outbox::OutboxRepository;
    use fieldsync_core::sync::OutboxRepositoryTrait;

    fn setup_db() -> (RecordRepository, OutboxRepository) {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let (pool, writer) = open(&app_data).expect("open db");
        (
            RecordRepository::new(pool.clone(), writer.clone()),
            OutboxRepository::new(pool, writer),
        )
    }

    fn remote(id: &str, payload: serde_json::Value, version: &str) -> RemoteEntity {
        RemoteEntity {
            id: id.to_string(),
            payload,
            server_version: version.to_string(),
        }
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let (store, _) = setup_db();
        let record = Record::from_remote(
            EntityType::Mission,
            "m1",
            json!({ "status": "planned" }),
            "1",
        );

        store.put(record.clone()).await.unwrap();
        let loaded = store.get(EntityType::Mission, "m1").unwrap().unwrap();
        assert_eq!(loaded.payload, record.payload);
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
        assert_eq!(loaded.server_version.as_deref(), Some("1"));
        assert!(store.get(EntityType::ChecklistEntry, "m1").unwrap().is_none());

        assert!(store.delete(EntityType::Mission, "m1").await.unwrap());
        assert!(!store.delete(EntityType::Mission, "m1").await.unwrap());
        assert_eq!(store.count(EntityType::Mission).unwrap(), 0);
    }

    #[tokio::test]
    async fn get_all_filters_by_status_and_fields() {
        let (store, _) = setup_db();
        store
            .bulk_put(vec![
                Record::from_remote(
                    EntityType::ChecklistEntry,
                    "c1",
                    json!({ "missionId": "m1" }),
                    "1",
                ),
                Record::new_local(EntityType::ChecklistEntry, "c2", json!({ "missionId": "m1" })),
                Record::new_local(EntityType::ChecklistEntry, "c3", json!({ "missionId": "m2" })),
            ])
            .await
            .unwrap();

        let pending = store
            .get_all(
                EntityType::ChecklistEntry,
                &RecordFilter::with_status(SyncStatus::Pending),
            )
            .unwrap();
        assert_eq!(
            pending.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["c2", "c3"]
        );

        let for_mission = store
            .get_all(
                EntityType::ChecklistEntry,
                &RecordFilter::all().field("missionId", json!("m1")),
            )
            .unwrap();
        assert_eq!(for_mission.len(), 2);

        assert_eq!(store.clear(EntityType::ChecklistEntry).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn commit_applies_record_and_outbox_together() {
        let (store, outbox) = setup_db();
        let mut record = Record::new_local(EntityType::Mission, "m1", json!({}));
        record
            .apply_local_patch(&json!({ "status": "in_progress" }))
            .unwrap();

        let queued = store
            .commit(LocalChange::upsert(record).enqueueing(NewMutation::new(
                EntityType::Mission,
                "m1",
                MutationOperation::Update,
                json!({ "status": "in_progress" }),
            )))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outbox.all_pending().unwrap(), vec![queued]);
        assert_eq!(
            store.get(EntityType::Mission, "m1").unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_record_write() {
        let (store, outbox) = setup_db();
        let mut mutation = NewMutation::new(
            EntityType::Mission,
            "m1",
            MutationOperation::Update,
            json!({}),
        );
        mutation.id = Some("fixed-id".to_string());
        store
            .commit(LocalChange::default().enqueueing(mutation.clone()))
            .await
            .unwrap();

        let record = Record::new_local(EntityType::Mission, "m2", json!({}));
        let result = store
            .commit(LocalChange::upsert(record).enqueueing(mutation))
            .await;

        assert!(result.is_err(), "duplicate mutation id must fail");
        assert!(store.get(EntityType::Mission, "m2").unwrap().is_none());
        assert_eq!(outbox.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_remote_never_overwrites_local_edits() {
        let (store, _) = setup_db();
        let mut local = Record::from_remote(
            EntityType::Mission,
            "m1",
            json!({ "status": "planned" }),
            "1",
        );
        local
            .apply_local_patch(&json!({ "status": "in_progress" }))
            .unwrap();
        store.put(local).await.unwrap();

        let cached = store
            .cache_remote(
                EntityType::Mission,
                vec![
                    remote("m1", json!({ "status": "cancelled" }), "2"),
                    remote("m2", json!({ "status": "planned" }), "7"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(cached[0].payload, json!({ "status": "in_progress" }));
        assert_eq!(cached[0].sync_status, SyncStatus::Pending);
        assert!(cached[0].cached_at.is_some());
        assert_eq!(cached[1].sync_status, SyncStatus::Synced);
        assert_eq!(cached[1].server_version.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn cache_remote_refetch_only_moves_cached_at() {
        let (store, _) = setup_db();
        let first = store
            .cache_remote(
                EntityType::Mission,
                vec![remote("m1", json!({ "status": "planned" }), "1")],
            )
            .await
            .unwrap()
            .remove(0);

        let again = store
            .cache_remote(
                EntityType::Mission,
                vec![remote("m1", json!({ "status": "planned" }), "1")],
            )
            .await
            .unwrap()
            .remove(0);
        assert_eq!(again.local_updated_at, first.local_updated_at);
        assert!(again.cached_at >= first.cached_at);
        assert_eq!(
            store.get(EntityType::Mission, "m1").unwrap().unwrap().local_updated_at,
            first.local_updated_at
        );

        let changed = store
            .cache_remote(
                EntityType::Mission,
                vec![remote("m1", json!({ "status": "completed" }), "2")],
            )
            .await
            .unwrap()
            .remove(0);
        assert!(changed.local_updated_at >= first.local_updated_at);
        assert_eq!(changed.server_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn cache_remote_skips_entities_deleted_locally() {
        let (store, _) = setup_db();
        store
            .commit(LocalChange::default().enqueueing(NewMutation::new(
                EntityType::Mission,
                "m1",
                MutationOperation::Delete,
                serde_json::Value::Null,
            )))
            .await
            .unwrap();

        let cached = store
            .cache_remote(
                EntityType::Mission,
                vec![remote("m1", json!({ "status": "planned" }), "3")],
            )
            .await
            .unwrap();

        assert!(cached.is_empty());
        assert!(store.get(EntityType::Mission, "m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn acknowledge_syncs_record_only_after_last_mutation() {
        let (store, outbox) = setup_db();
        let mut record = Record::from_remote(
            EntityType::Mission,
            "m1",
            json!({ "status": "planned" }),
            "1",
        );
        record.apply_local_patch(&json!({ "status": "in_progress" })).unwrap();
        store.put(record).await.unwrap();
        let first = outbox
            .enqueue(NewMutation::new(
                EntityType::Mission,
                "m1",
                MutationOperation::Update,
                json!({ "status": "in_progress" }),
            ))
            .await
            .unwrap();
        let second = outbox
            .enqueue(NewMutation::new(
                EntityType::Mission,
                "m1",
                MutationOperation::Update,
                json!({ "status": "completed" }),
            ))
            .await
            .unwrap();

        let acked = store
            .acknowledge(&first, remote("m1", json!({ "status": "in_progress" }), "2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acked.sync_status, SyncStatus::Pending);
        assert_eq!(acked.server_version.as_deref(), Some("2"));

        let acked = store
            .acknowledge(&second, remote("m1", json!({ "status": "completed" }), "3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acked.sync_status, SyncStatus::Synced);
        assert_eq!(acked.payload, json!({ "status": "completed" }));
        assert_eq!(outbox.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_many_keeps_unsynced_records() {
        let (store, _) = setup_db();
        store
            .bulk_put(vec![
                Record::from_remote(EntityType::Mission, "m1", json!({}), "1"),
                Record::new_local(EntityType::Mission, "m2", json!({})),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_many(EntityType::Mission, RecordFilter::with_status(SyncStatus::Synced))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(EntityType::Mission, "m2").unwrap().is_some());
    }

    #[tokio::test]
    async fn set_sync_status_marks_conflict() {
        let (store, _) = setup_db();
        store
            .put(Record::new_local(EntityType::Mission, "m1", json!({})))
            .await
            .unwrap();
        assert!(store
            .set_sync_status(EntityKey::new(EntityType::Mission, "m1"), SyncStatus::Conflict)
            .await
            .unwrap());
        assert_eq!(
            store.get(EntityType::Mission, "m1").unwrap().unwrap().sync_status,
            SyncStatus::Conflict
        );
    }
}
