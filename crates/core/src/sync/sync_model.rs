//! Outbox and sync-cycle domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{EntityKey, EntityType};
use crate::errors::{Error, Result};

/// Mutation kinds sent to the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "create",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "create" => Ok(MutationOperation::Create),
            "update" => Ok(MutationOperation::Update),
            "delete" => Ok(MutationOperation::Delete),
            other => Err(Error::storage(format!("Unknown mutation operation '{}'", other))),
        }
    }
}

/// Outbox lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be drained.
    Pending,
    /// Held after a remote conflict until a resolution policy runs.
    Conflict,
    /// Removed from the active queue after exhausting retries or a permanent rejection.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Conflict => "conflict",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OutboxStatus::Pending),
            "conflict" => Ok(OutboxStatus::Conflict),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(Error::storage(format!("Unknown outbox status '{}'", other))),
        }
    }
}

/// One entry of the outbox: a local mutation not yet confirmed by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: String,
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: MutationOperation,
    pub payload: serde_json::Value,
    /// Server version the local edit was made against.
    pub base_version: Option<String>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// Request to append a mutation to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub id: Option<String>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: MutationOperation,
    pub payload: serde_json::Value,
    pub base_version: Option<String>,
}

impl NewMutation {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: MutationOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            base_version: None,
        }
    }

    pub fn with_base_version(mut self, base_version: Option<String>) -> Self {
        self.base_version = base_version;
        self
    }

    /// Id assigned at enqueue time: UUIDv7, ordered by creation time.
    pub fn resolve_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string())
    }
}

/// Result of recording a failed delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Still queued; `attempts` is the new count.
    Retry { attempts: u32 },
    /// Attempts reached the maximum; the mutation left the active queue.
    DeadLettered(PendingMutation),
}

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    NetworkOnline,
    Manual,
    RetryTimer,
    BackgroundWake,
    LocalMutation,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::NetworkOnline => "network_online",
            SyncTrigger::Manual => "manual",
            SyncTrigger::RetryTimer => "retry_timer",
            SyncTrigger::BackgroundWake => "background_wake",
            SyncTrigger::LocalMutation => "local_mutation",
        }
    }
}

/// Ephemeral run-state of the (single) active drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycle {
    pub in_progress: bool,
    pub processed_count: usize,
    pub total_count: usize,
}

/// Terminal status of one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    Completed,
    /// Network lost mid-cycle; untried items stay queued.
    Aborted,
    /// Unexpected (storage) failure.
    Failed,
    /// Another drain was already running; the trigger was dropped.
    Skipped,
}

impl DrainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainStatus::Completed => "completed",
            DrainStatus::Aborted => "aborted",
            DrainStatus::Failed => "failed",
            DrainStatus::Skipped => "skipped",
        }
    }
}

/// Summary of one drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub trigger: SyncTrigger,
    pub status: DrainStatus,
    pub processed: usize,
    pub total: usize,
    pub dead_lettered: usize,
    pub conflicts: usize,
    /// Items left queued: transient failures and entities blocked behind them.
    pub deferred: usize,
    pub duration_ms: i64,
}

impl DrainReport {
    pub fn new(trigger: SyncTrigger, total: usize) -> Self {
        Self {
            trigger,
            status: DrainStatus::Completed,
            processed: 0,
            total,
            dead_lettered: 0,
            conflicts: 0,
            deferred: 0,
            duration_ms: 0,
        }
    }

    pub fn skipped(trigger: SyncTrigger) -> Self {
        Self {
            status: DrainStatus::Skipped,
            ..Self::new(trigger, 0)
        }
    }
}

/// Persisted outcome of the most recent drains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEngineStatus {
    pub last_cycle_status: Option<String>,
    pub last_cycle_trigger: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
    pub last_drain_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [OutboxStatus::Pending, OutboxStatus::Conflict, OutboxStatus::Dead] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("sent").is_err());
    }

    #[test]
    fn generated_mutation_ids_sort_by_creation() {
        let request = NewMutation::new(
            EntityType::Mission,
            "1",
            MutationOperation::Update,
            serde_json::json!({}),
        );
        let first = request.resolve_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = request.resolve_id();
        assert!(first < second);
    }
}
