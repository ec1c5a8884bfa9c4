//! Outbox queue: the durable, ordered log of local mutations awaiting remote confirmation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::{AttemptOutcome, DrainReport, NewMutation, PendingMutation, SyncEngineStatus};
use crate::entities::EntityType;
use crate::errors::{Error, Result};
use crate::events::{EventBus, SyncEvent};

/// Persistence for outbox rows and engine bookkeeping.
///
/// Ordering is by `seq`, assigned at enqueue inside the writing transaction, which keeps
/// per-entity creation order even when wall clocks step backwards.
#[async_trait]
pub trait OutboxRepositoryTrait: Send + Sync {
    async fn enqueue(&self, mutation: NewMutation) -> Result<PendingMutation>;

    /// Removes a mutation after the remote acknowledged it.
    async fn dequeue(&self, id: &str) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<PendingMutation>>;

    /// Mutations in `pending` status, ascending by `seq`.
    fn all_pending(&self) -> Result<Vec<PendingMutation>>;

    /// Records a failed attempt. When `attempts` reaches `max_retries` the row moves to
    /// the dead-letter state in the same transaction.
    async fn mark_attempt(
        &self,
        id: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<AttemptOutcome>;

    async fn schedule_retry(&self, id: &str, next_retry_at: DateTime<Utc>) -> Result<()>;

    /// Moves a mutation to the dead-letter state regardless of its attempt count.
    async fn dead_letter(&self, id: &str, error: &str) -> Result<Option<PendingMutation>>;

    async fn hold_for_conflict(&self, id: &str, error: &str) -> Result<bool>;

    fn held_conflicts(&self) -> Result<Vec<PendingMutation>>;

    /// Pending and held mutations of one entity, ascending by `seq`.
    fn mutations_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PendingMutation>>;

    /// Pending plus held rows: everything not yet confirmed and not dead.
    fn pending_count(&self) -> Result<usize>;

    fn dead_letters(&self) -> Result<Vec<PendingMutation>>;

    /// Puts a dead letter back at the tail of the queue with its attempts reset.
    async fn requeue_dead_letter(&self, id: &str) -> Result<Option<PendingMutation>>;

    async fn discard_dead_letter(&self, id: &str) -> Result<bool>;

    async fn mark_cycle_outcome(&self, report: DrainReport, error: Option<String>) -> Result<()>;

    fn engine_status(&self) -> Result<SyncEngineStatus>;
}

/// Outbox operations with their notifications attached.
#[derive(Clone)]
pub struct Outbox {
    repository: Arc<dyn OutboxRepositoryTrait>,
    events: EventBus,
    max_retries: u32,
}

impl Outbox {
    pub fn new(repository: Arc<dyn OutboxRepositoryTrait>, events: EventBus, max_retries: u32) -> Self {
        Self {
            repository,
            events,
            max_retries,
        }
    }

    /// Appends a mutation and returns its id.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<String> {
        let queued = self.repository.enqueue(mutation).await?;
        debug!(
            "[Outbox] Enqueued {} {} {} (seq {})",
            queued.operation.as_str(),
            queued.entity_type,
            queued.entity_id,
            queued.seq
        );
        self.notify_pending_count()?;
        Ok(queued.id)
    }

    pub async fn dequeue(&self, id: &str) -> Result<bool> {
        self.repository.dequeue(id).await
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingMutation>> {
        self.repository.get(id)
    }

    pub fn all_pending(&self) -> Result<Vec<PendingMutation>> {
        self.repository.all_pending()
    }

    /// Records a failed attempt and announces a dead letter when the bound is reached.
    pub async fn mark_attempt(&self, id: &str, error: &str) -> Result<AttemptOutcome> {
        let outcome = self
            .repository
            .mark_attempt(id, error, self.max_retries)
            .await?;
        if let AttemptOutcome::DeadLettered(mutation) = &outcome {
            let exhausted = Error::MaxRetriesExceeded {
                mutation_id: mutation.id.clone(),
                attempts: mutation.attempts,
            };
            self.announce_dead_letter(mutation.clone(), &format!("{}: {}", exhausted, error));
        }
        Ok(outcome)
    }

    pub async fn schedule_retry(&self, id: &str, next_retry_at: DateTime<Utc>) -> Result<()> {
        self.repository.schedule_retry(id, next_retry_at).await
    }

    /// Dead-letters a mutation that can never succeed.
    pub async fn dead_letter(&self, id: &str, error: &str) -> Result<Option<PendingMutation>> {
        let dead = self.repository.dead_letter(id, error).await?;
        if let Some(mutation) = &dead {
            self.announce_dead_letter(mutation.clone(), error);
        }
        Ok(dead)
    }

    pub async fn hold_for_conflict(&self, id: &str, error: &str) -> Result<bool> {
        self.repository.hold_for_conflict(id, error).await
    }

    pub fn held_conflicts(&self) -> Result<Vec<PendingMutation>> {
        self.repository.held_conflicts()
    }

    pub fn mutations_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PendingMutation>> {
        self.repository.mutations_for_entity(entity_type, entity_id)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.repository.pending_count()
    }

    pub fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        self.repository.dead_letters()
    }

    pub async fn requeue_dead_letter(&self, id: &str) -> Result<Option<PendingMutation>> {
        let requeued = self.repository.requeue_dead_letter(id).await?;
        if requeued.is_some() {
            self.notify_pending_count()?;
        }
        Ok(requeued)
    }

    pub async fn discard_dead_letter(&self, id: &str) -> Result<bool> {
        self.repository.discard_dead_letter(id).await
    }

    pub async fn mark_cycle_outcome(&self, report: DrainReport, error: Option<String>) -> Result<()> {
        self.repository.mark_cycle_outcome(report, error).await
    }

    pub fn engine_status(&self) -> Result<SyncEngineStatus> {
        self.repository.engine_status()
    }

    /// Emits `pending-count-changed` with the current count.
    pub fn notify_pending_count(&self) -> Result<usize> {
        let count = self.repository.pending_count()?;
        self.events.emit(SyncEvent::PendingCountChanged { count });
        Ok(count)
    }

    fn announce_dead_letter(&self, mutation: PendingMutation, error: &str) {
        warn!(
            "[Outbox] Dead-lettered {} {} {} after {} attempts: {}",
            mutation.operation.as_str(),
            mutation.entity_type,
            mutation.entity_id,
            mutation.attempts,
            error
        );
        self.events.emit(SyncEvent::MutationDeadLettered {
            mutation,
            error: error.to_string(),
        });
    }
}
