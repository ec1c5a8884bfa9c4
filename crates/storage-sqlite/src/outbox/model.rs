//! Database models for the outbox and engine bookkeeping.

use diesel::prelude::*;

use fieldsync_core::entities::EntityType;
use fieldsync_core::errors::Result;
use fieldsync_core::sync::{MutationOperation, OutboxStatus, PendingMutation, SyncEngineStatus};

use crate::records::{format_timestamp_opt, parse_timestamp, parse_timestamp_opt};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(mutation_id))]
#[diesel(table_name = crate::schema::outbox)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct OutboxMutationDB {
    pub mutation_id: String,
    pub seq: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub base_version: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<String>,
    pub next_retry_at: Option<String>,
    pub created_at: String,
}

impl OutboxMutationDB {
    pub fn into_domain(self) -> Result<PendingMutation> {
        Ok(PendingMutation {
            id: self.mutation_id,
            seq: self.seq,
            entity_type: EntityType::parse(&self.entity_type)?,
            entity_id: self.entity_id,
            operation: MutationOperation::parse(&self.operation)?,
            payload: serde_json::from_str(&self.payload)?,
            base_version: self.base_version,
            status: OutboxStatus::parse(&self.status)?,
            created_at: parse_timestamp(&self.created_at)?,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
            last_attempt_at: parse_timestamp_opt(self.last_attempt_at.as_deref())?,
            next_retry_at: parse_timestamp_opt(self.next_retry_at.as_deref())?,
        })
    }

    pub fn from_domain(mutation: &PendingMutation) -> Result<Self> {
        Ok(Self {
            mutation_id: mutation.id.clone(),
            seq: mutation.seq,
            entity_type: mutation.entity_type.as_str().to_string(),
            entity_id: mutation.entity_id.clone(),
            operation: mutation.operation.as_str().to_string(),
            payload: serde_json::to_string(&mutation.payload)?,
            base_version: mutation.base_version.clone(),
            status: mutation.status.as_str().to_string(),
            attempts: mutation.attempts as i32,
            last_error: mutation.last_error.clone(),
            last_attempt_at: format_timestamp_opt(mutation.last_attempt_at.as_ref()),
            next_retry_at: format_timestamp_opt(mutation.next_retry_at.as_ref()),
            created_at: mutation.created_at.to_rfc3339(),
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Default)]
#[diesel(table_name = crate::schema::sync_engine_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct SyncEngineStateDB {
    pub id: i32,
    pub last_cycle_status: Option<String>,
    pub last_cycle_trigger: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
    pub last_drain_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
}

impl From<SyncEngineStateDB> for SyncEngineStatus {
    fn from(row: SyncEngineStateDB) -> Self {
        Self {
            last_cycle_status: row.last_cycle_status,
            last_cycle_trigger: row.last_cycle_trigger,
            last_cycle_duration_ms: row.last_cycle_duration_ms,
            last_drain_at: row.last_drain_at,
            last_success_at: row.last_success_at,
            last_error: row.last_error,
            consecutive_failures: row.consecutive_failures,
        }
    }
}
