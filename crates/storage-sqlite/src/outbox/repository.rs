//! Repository for the outbox table and the sync engine state row.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{count_star, max};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use fieldsync_core::entities::EntityType;
use fieldsync_core::errors::{Error, Result};
use fieldsync_core::sync::{
    AttemptOutcome, DrainReport, DrainStatus, NewMutation, OutboxRepositoryTrait, OutboxStatus,
    PendingMutation, SyncEngineStatus,
};

use super::model::{OutboxMutationDB, SyncEngineStateDB};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::records::format_timestamp;
use crate::schema::{outbox, sync_engine_state};

const OPEN_STATUSES: [&str; 2] = ["pending", "conflict"];

fn next_seq(conn: &mut SqliteConnection) -> Result<i64> {
    let current: Option<i64> = outbox::table
        .select(max(outbox::seq))
        .first(conn)
        .map_err(StorageError::from)?;
    Ok(current.unwrap_or(0) + 1)
}

fn load_mutation(conn: &mut SqliteConnection, id: &str) -> Result<Option<OutboxMutationDB>> {
    Ok(outbox::table
        .find(id)
        .first::<OutboxMutationDB>(conn)
        .optional()
        .map_err(StorageError::from)?)
}

fn load_required(conn: &mut SqliteConnection, id: &str) -> Result<OutboxMutationDB> {
    load_mutation(conn, id)?
        .ok_or_else(|| Error::storage(format!("Outbox mutation '{}' not found", id)))
}

fn to_mutations(rows: Vec<OutboxMutationDB>) -> Result<Vec<PendingMutation>> {
    rows.into_iter().map(OutboxMutationDB::into_domain).collect()
}

/// Appends a mutation inside the caller's transaction.
///
/// Used next to the record write it belongs to, so both commit or roll back together.
pub fn write_outbox_mutation(
    conn: &mut SqliteConnection,
    request: NewMutation,
) -> Result<PendingMutation> {
    let mutation = PendingMutation {
        id: request.resolve_id(),
        seq: next_seq(conn)?,
        entity_type: request.entity_type,
        entity_id: request.entity_id,
        operation: request.operation,
        payload: request.payload,
        base_version: request.base_version,
        status: OutboxStatus::Pending,
        created_at: Utc::now(),
        attempts: 0,
        last_error: None,
        last_attempt_at: None,
        next_retry_at: None,
    };

    diesel::insert_into(outbox::table)
        .values(&OutboxMutationDB::from_domain(&mutation)?)
        .execute(conn)
        .map_err(StorageError::from)?;

    Ok(mutation)
}

/// Drops outbox rows inside the caller's transaction.
pub fn discard_outbox_mutations(conn: &mut SqliteConnection, ids: &[String]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    Ok(
        diesel::delete(outbox::table.filter(outbox::mutation_id.eq_any(ids)))
            .execute(conn)
            .map_err(StorageError::from)?,
    )
}

pub struct OutboxRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl OutboxRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    fn load_by_status(&self, status: OutboxStatus) -> Result<Vec<PendingMutation>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = outbox::table
            .filter(outbox::status.eq(status.as_str()))
            .order(outbox::seq.asc())
            .load::<OutboxMutationDB>(&mut conn)
            .map_err(StorageError::from)?;
        to_mutations(rows)
    }

    /// Moves a row to a non-pending status, counting the attempt that caused it.
    async fn transition(
        &self,
        id: &str,
        status: OutboxStatus,
        error: &str,
    ) -> Result<Option<PendingMutation>> {
        let id = id.to_string();
        let error = error.to_string();
        self.writer
            .exec(move |conn| {
                let Some(row) = load_mutation(conn, &id)? else {
                    return Ok(None);
                };
                let now = format_timestamp(&Utc::now());
                diesel::update(outbox::table.find(row.mutation_id.as_str()))
                    .set((
                        outbox::status.eq(status.as_str()),
                        outbox::attempts.eq(row.attempts + 1),
                        outbox::last_error.eq(Some(error)),
                        outbox::last_attempt_at.eq(Some(now)),
                        outbox::next_retry_at.eq::<Option<String>>(None),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                load_mutation(conn, &id)?
                    .map(OutboxMutationDB::into_domain)
                    .transpose()
            })
            .await
    }
}

#[async_trait]
impl OutboxRepositoryTrait for OutboxRepository {
    async fn enqueue(&self, mutation: NewMutation) -> Result<PendingMutation> {
        self.writer
            .exec(move |conn| write_outbox_mutation(conn, mutation))
            .await
    }

    async fn dequeue(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.writer
            .exec(move |conn| {
                let deleted = diesel::delete(outbox::table.find(id.as_str()))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(deleted > 0)
            })
            .await
    }

    fn get(&self, id: &str) -> Result<Option<PendingMutation>> {
        let mut conn = get_connection(&self.pool)?;
        load_mutation(&mut conn, id)?
            .map(OutboxMutationDB::into_domain)
            .transpose()
    }

    fn all_pending(&self) -> Result<Vec<PendingMutation>> {
        self.load_by_status(OutboxStatus::Pending)
    }

    async fn mark_attempt(
        &self,
        id: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<AttemptOutcome> {
        let id = id.to_string();
        let error = error.to_string();
        self.writer
            .exec(move |conn| {
                let row = load_required(conn, &id)?;
                let attempts = row.attempts + 1;
                let status = if attempts >= max_retries as i32 {
                    OutboxStatus::Dead
                } else {
                    OutboxStatus::Pending
                };
                diesel::update(outbox::table.find(id.as_str()))
                    .set((
                        outbox::attempts.eq(attempts),
                        outbox::status.eq(status.as_str()),
                        outbox::last_error.eq(Some(error)),
                        outbox::last_attempt_at.eq(Some(format_timestamp(&Utc::now()))),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;

                let updated = load_required(conn, &id)?.into_domain()?;
                Ok(match status {
                    OutboxStatus::Dead => AttemptOutcome::DeadLettered(updated),
                    _ => AttemptOutcome::Retry {
                        attempts: updated.attempts,
                    },
                })
            })
            .await
    }

    async fn schedule_retry(&self, id: &str, next_retry_at: DateTime<Utc>) -> Result<()> {
        let id = id.to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(outbox::table.find(id.as_str()))
                    .set(outbox::next_retry_at.eq(Some(format_timestamp(&next_retry_at))))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn dead_letter(&self, id: &str, error: &str) -> Result<Option<PendingMutation>> {
        self.transition(id, OutboxStatus::Dead, error).await
    }

    async fn hold_for_conflict(&self, id: &str, error: &str) -> Result<bool> {
        Ok(self
            .transition(id, OutboxStatus::Conflict, error)
            .await?
            .is_some())
    }

    fn held_conflicts(&self) -> Result<Vec<PendingMutation>> {
        self.load_by_status(OutboxStatus::Conflict)
    }

    fn mutations_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PendingMutation>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = outbox::table
            .filter(outbox::entity_type.eq(entity_type.as_str()))
            .filter(outbox::entity_id.eq(entity_id))
            .filter(outbox::status.eq_any(OPEN_STATUSES))
            .order(outbox::seq.asc())
            .load::<OutboxMutationDB>(&mut conn)
            .map_err(StorageError::from)?;
        to_mutations(rows)
    }

    fn pending_count(&self) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let count: i64 = outbox::table
            .filter(outbox::status.eq_any(OPEN_STATUSES))
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count as usize)
    }

    fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        self.load_by_status(OutboxStatus::Dead)
    }

    async fn requeue_dead_letter(&self, id: &str) -> Result<Option<PendingMutation>> {
        let id = id.to_string();
        self.writer
            .exec(move |conn| {
                match load_mutation(conn, &id)? {
                    Some(row) if row.status == OutboxStatus::Dead.as_str() => {}
                    _ => return Ok(None),
                }
                let seq = next_seq(conn)?;
                diesel::update(outbox::table.find(id.as_str()))
                    .set((
                        outbox::seq.eq(seq),
                        outbox::status.eq(OutboxStatus::Pending.as_str()),
                        outbox::attempts.eq(0),
                        outbox::last_error.eq::<Option<String>>(None),
                        outbox::next_retry_at.eq::<Option<String>>(None),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                load_mutation(conn, &id)?
                    .map(OutboxMutationDB::into_domain)
                    .transpose()
            })
            .await
    }

    async fn discard_dead_letter(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.writer
            .exec(move |conn| {
                let deleted = diesel::delete(
                    outbox::table
                        .filter(outbox::mutation_id.eq(&id))
                        .filter(outbox::status.eq(OutboxStatus::Dead.as_str())),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(deleted > 0)
            })
            .await
    }

    async fn mark_cycle_outcome(&self, report: DrainReport, error: Option<String>) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let now = format_timestamp(&Utc::now());
                let mut state = sync_engine_state::table
                    .find(1)
                    .first::<SyncEngineStateDB>(conn)
                    .optional()
                    .map_err(StorageError::from)?
                    .unwrap_or(SyncEngineStateDB {
                        id: 1,
                        ..SyncEngineStateDB::default()
                    });

                state.last_cycle_status = Some(report.status.as_str().to_string());
                state.last_cycle_trigger = Some(report.trigger.as_str().to_string());
                state.last_cycle_duration_ms = Some(report.duration_ms);
                state.last_drain_at = Some(now.clone());
                match report.status {
                    DrainStatus::Completed => {
                        state.last_success_at = Some(now);
                        state.last_error = None;
                        state.consecutive_failures = 0;
                    }
                    DrainStatus::Failed => {
                        state.last_error = error;
                        state.consecutive_failures += 1;
                    }
                    DrainStatus::Aborted | DrainStatus::Skipped => {}
                }

                diesel::insert_into(sync_engine_state::table)
                    .values(&state)
                    .on_conflict(sync_engine_state::id)
                    .do_update()
                    .set(&state)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    fn engine_status(&self) -> Result<SyncEngineStatus> {
        let mut conn = get_connection(&self.pool)?;
        let state = sync_engine_state::table
            .find(1)
            .first::<SyncEngineStateDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(state.map(SyncEngineStatus::from).unwrap_or_default())
    }
}
