//! Sync manager: owns the single drain cycle of the outbox against the remote authority.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    resolve, AttemptOutcome, ConflictPolicy, DrainReport, DrainStatus, MutationOperation,
    NewMutation, Outbox, PendingMutation, RemoteAuthority, RemoteEntity, RemoteError,
    Resolution, SyncCycle, SyncEngineStatus, SyncTrigger,
};
use crate::config::SyncConfig;
use crate::entities::{EntityKey, EntityType, LocalChange, LocalStoreTrait, Record, SyncStatus};
use crate::errors::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ScheduledRetry {
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// Marks the cycle as in progress for its lifetime and resets it on every exit path.
struct CycleGuard<'a> {
    state: &'a Mutex<SyncCycle>,
}

impl<'a> CycleGuard<'a> {
    fn enter(state: &'a Mutex<SyncCycle>) -> Self {
        *lock(state) = SyncCycle {
            in_progress: true,
            processed_count: 0,
            total_count: 0,
        };
        Self { state }
    }

    fn update(&self, processed: usize, total: usize) {
        let mut cycle = lock(self.state);
        cycle.processed_count = processed;
        cycle.total_count = total;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = SyncCycle::default();
    }
}

/// Effect of a conflict resolution on the outbox.
struct AppliedResolution {
    discarded: Vec<String>,
    resubmitted: bool,
}

pub struct SyncManager {
    this: Weak<SyncManager>,
    store: Arc<dyn LocalStoreTrait>,
    outbox: Outbox,
    remote: Arc<dyn RemoteAuthority>,
    network: NetworkMonitor,
    events: EventBus,
    config: SyncConfig,
    cycle_mutex: tokio::sync::Mutex<()>,
    cycle: Mutex<SyncCycle>,
    retry_timer: Mutex<Option<ScheduledRetry>>,
    connectivity_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn LocalStoreTrait>,
        outbox: Outbox,
        remote: Arc<dyn RemoteAuthority>,
        network: NetworkMonitor,
        events: EventBus,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            outbox,
            remote,
            network,
            events,
            config,
            cycle_mutex: tokio::sync::Mutex::new(()),
            cycle: Mutex::new(SyncCycle::default()),
            retry_timer: Mutex::new(None),
            connectivity_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Snapshot of the running cycle; `in_progress` is false while idle.
    pub fn cycle(&self) -> SyncCycle {
        *lock(&self.cycle)
    }

    pub fn status(&self) -> Result<SyncEngineStatus> {
        self.outbox.engine_status()
    }

    /// Explicit "sync now" request.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.drain(SyncTrigger::Manual).await
    }

    /// Platform background-sync wake-up.
    pub async fn background_wake(&self) -> Result<DrainReport> {
        self.drain(SyncTrigger::BackgroundWake).await
    }

    /// Starts a drain on a background task without waiting for it.
    pub fn request_drain(&self, trigger: SyncTrigger) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = manager.drain(trigger).await {
                warn!("[Sync] Background drain ({}) failed: {}", trigger.as_str(), err);
            }
        });
    }

    /// Drains the outbox once.
    ///
    /// Returns a `Skipped` report without emitting anything when another drain is running.
    /// Storage failures end the cycle with `sync-failed` and are returned to the caller.
    pub async fn drain(&self, trigger: SyncTrigger) -> Result<DrainReport> {
        let Ok(cycle_lock) = self.cycle_mutex.try_lock() else {
            debug!(
                "[Sync] Drain already in progress; dropping {} trigger",
                trigger.as_str()
            );
            return Ok(DrainReport::skipped(trigger));
        };
        self.run_cycle(trigger, cycle_lock).await
    }

    /// Drains once, waiting for a running drain to finish first.
    ///
    /// Used by the retry timer. A running drain has already passed the mutation the
    /// timer was armed for.
    async fn drain_after_current(&self, trigger: SyncTrigger) -> Result<DrainReport> {
        let cycle_lock = self.cycle_mutex.lock().await;
        self.run_cycle(trigger, cycle_lock).await
    }

    async fn run_cycle(
        &self,
        trigger: SyncTrigger,
        _cycle_lock: tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<DrainReport> {
        let cycle = CycleGuard::enter(&self.cycle);
        let started_at = Instant::now();

        info!("[Sync] Drain started ({})", trigger.as_str());
        self.events.emit(SyncEvent::SyncStarted { trigger });

        let mut report = DrainReport::new(trigger, 0);
        let outcome = self.run_drain(&mut report, &cycle).await;
        report.duration_ms = started_at.elapsed().as_millis() as i64;
        if outcome.is_err() {
            report.status = DrainStatus::Failed;
        }

        let error_message = outcome.as_ref().err().map(|err| err.to_string());
        let result = match outcome {
            Ok(()) => self
                .outbox
                .mark_cycle_outcome(report.clone(), None)
                .await
                .and_then(|()| self.outbox.pending_count()),
            Err(err) => {
                if let Err(persist_err) = self
                    .outbox
                    .mark_cycle_outcome(report.clone(), error_message)
                    .await
                {
                    error!("[Sync] Failed to record cycle outcome: {}", persist_err);
                }
                Err(err)
            }
        };

        match result {
            Ok(pending) => {
                match report.status {
                    DrainStatus::Aborted => {
                        info!(
                            "[Sync] Drain aborted: network lost after {}/{} ({} left queued)",
                            report.processed, report.total, pending
                        );
                        self.events.emit(SyncEvent::SyncAborted);
                    }
                    _ => {
                        info!(
                            "[Sync] Drain completed: processed={} total={} dead_lettered={} conflicts={} deferred={} in {}ms",
                            report.processed,
                            report.total,
                            report.dead_lettered,
                            report.conflicts,
                            report.deferred,
                            report.duration_ms
                        );
                        self.events.emit(SyncEvent::SyncCompleted);
                    }
                }
                self.events
                    .emit(SyncEvent::PendingCountChanged { count: pending });
                Ok(report)
            }
            Err(err) => {
                error!("[Sync] Drain failed: {}", err);
                self.events.emit(SyncEvent::SyncFailed {
                    message: err.to_string(),
                });
                if let Ok(count) = self.outbox.pending_count() {
                    self.events.emit(SyncEvent::PendingCountChanged { count });
                }
                Err(err)
            }
        }
    }

    async fn run_drain(&self, report: &mut DrainReport, cycle: &CycleGuard<'_>) -> Result<()> {
        // Entities whose earlier mutation is held or failed in this drain wait for a later one.
        let mut blocked = self.resolve_held_conflicts().await?;

        let queue = self.outbox.all_pending()?;
        report.total = queue.len();
        cycle.update(0, report.total);

        // Mutations folded into a conflict resolution earlier in this drain.
        let mut settled: HashSet<String> = HashSet::new();
        let mut resubmitted = false;

        for mutation in queue {
            if settled.contains(&mutation.id) {
                self.advance(report, cycle);
                continue;
            }
            let key = mutation.entity_key();
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }
            if !self.network.is_online() {
                report.status = DrainStatus::Aborted;
                return Ok(());
            }

            match self.send(&mutation).await? {
                Ok(ack) => {
                    debug!(
                        "[Sync] {} {} {} acknowledged at version {}",
                        mutation.operation.as_str(),
                        mutation.entity_type,
                        mutation.entity_id,
                        ack.server_version
                    );
                    self.store.acknowledge(&mutation, ack).await?;
                }
                Err(err) if err.is_conflict() => {
                    report.conflicts += 1;
                    match self.handle_conflict(&mutation, err).await? {
                        Some(applied) => {
                            resubmitted |= applied.resubmitted;
                            settled.extend(applied.discarded);
                        }
                        None => {
                            blocked.insert(key);
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    if matches!(err, RemoteError::Unavailable(_)) {
                        debug!("[Sync] Remote unreachable: {}", err);
                    } else {
                        warn!(
                            "[Sync] Transient failure for {} {}: {}",
                            mutation.entity_type, mutation.entity_id, err
                        );
                    }
                    match self.outbox.mark_attempt(&mutation.id, &err.to_string()).await? {
                        AttemptOutcome::DeadLettered(_) => {
                            report.dead_lettered += 1;
                        }
                        AttemptOutcome::Retry { attempts } => {
                            let delay = self.config.backoff.delay(attempts);
                            let retry_at = Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero());
                            self.outbox.schedule_retry(&mutation.id, retry_at).await?;
                            self.schedule_retry(delay);
                            blocked.insert(key);
                            report.deferred += 1;
                            continue;
                        }
                    }
                }
                Err(err) => {
                    // Validation and not-found rejections cannot succeed on retry.
                    self.outbox.dead_letter(&mutation.id, &err.to_string()).await?;
                    report.dead_lettered += 1;
                }
            }
            self.advance(report, cycle);
        }

        if resubmitted {
            self.schedule_retry(self.config.backoff.delay(0));
        }
        Ok(())
    }

    /// Retries the configured policy for conflicts held because the server copy could not
    /// be fetched. Returns the entities that stay held.
    async fn resolve_held_conflicts(&self) -> Result<HashSet<EntityKey>> {
        let mut held: Vec<PendingMutation> = Vec::new();
        for mutation in self.outbox.held_conflicts()? {
            if !held.iter().any(|m| m.entity_key() == mutation.entity_key()) {
                held.push(mutation);
            }
        }

        let mut blocked = HashSet::new();
        for mutation in held {
            let key = mutation.entity_key();
            let Some(server) = self.fetch_server_copy(&key).await else {
                self.retry_conflict_later(&mutation);
                blocked.insert(key);
                continue;
            };
            let policy = self.config.conflict_policies.for_entity(key.entity_type);
            self.apply_resolution(&key, policy, server).await?;
        }
        Ok(blocked)
    }

    /// Arms the retry timer for a held conflict while the remote is reachable.
    ///
    /// Offline, the reconnect drain picks the conflict up instead.
    fn retry_conflict_later(&self, mutation: &PendingMutation) {
        if self.network.is_online() {
            self.schedule_retry(self.config.backoff.delay(mutation.attempts));
        }
    }

    fn advance(&self, report: &mut DrainReport, cycle: &CycleGuard<'_>) {
        report.processed += 1;
        cycle.update(report.processed, report.total);
        self.events.emit(SyncEvent::SyncProgress {
            processed: report.processed,
            total: report.total,
        });
    }

    /// Sends one mutation against the record's current server version.
    ///
    /// The outer `Result` carries storage failures; the inner one the remote outcome.
    async fn send(
        &self,
        mutation: &PendingMutation,
    ) -> Result<std::result::Result<RemoteEntity, RemoteError>> {
        let base_version = match self.store.get(mutation.entity_type, &mutation.entity_id)? {
            Some(record) if record.server_version.is_some() => record.server_version,
            _ => mutation.base_version.clone(),
        };
        let call = self.remote.send(mutation, base_version.as_deref());
        Ok(
            match tokio::time::timeout(self.config.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            },
        )
    }

    /// Holds the mutation, then resolves the conflict right away when the server copy is known.
    ///
    /// Returns `None` when the entity stays held; the next drain tries the policy again.
    async fn handle_conflict(
        &self,
        mutation: &PendingMutation,
        err: RemoteError,
    ) -> Result<Option<AppliedResolution>> {
        let key = mutation.entity_key();
        warn!(
            "[Sync] Conflict on {} {}: {}",
            key.entity_type, key.id, err
        );
        self.outbox
            .hold_for_conflict(&mutation.id, &err.to_string())
            .await?;
        self.store
            .set_sync_status(key.clone(), SyncStatus::Conflict)
            .await?;
        self.events.emit(SyncEvent::ConflictDetected {
            entity_type: key.entity_type,
            entity_id: key.id.clone(),
        });

        let server = match err {
            RemoteError::Rejected {
                current: Some(current),
                ..
            } => Some(current),
            _ => self.fetch_server_copy(&key).await,
        };
        let Some(server) = server else {
            warn!(
                "[Sync] Server copy of {} {} unavailable; conflict held until the next drain",
                key.entity_type, key.id
            );
            self.retry_conflict_later(mutation);
            return Ok(None);
        };

        let policy = self.config.conflict_policies.for_entity(key.entity_type);
        self.apply_resolution(&key, policy, server).await.map(Some)
    }

    async fn fetch_server_copy(&self, key: &EntityKey) -> Option<RemoteEntity> {
        if !self.network.is_online() {
            return None;
        }
        let call = self.remote.fetch(key.entity_type, &key.id);
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(Ok(entity)) => Some(entity),
            Ok(Err(err)) => {
                debug!(
                    "[Sync] Fetching server copy of {} {} failed: {}",
                    key.entity_type, key.id, err
                );
                None
            }
            Err(_) => None,
        }
    }

    /// Applies `policy` to the entity's whole unsynced tail in one local transaction.
    async fn apply_resolution(
        &self,
        key: &EntityKey,
        policy: ConflictPolicy,
        server: RemoteEntity,
    ) -> Result<AppliedResolution> {
        let tail = self.outbox.mutations_for_entity(key.entity_type, &key.id)?;
        let local = self.store.get(key.entity_type, &key.id)?;
        let discarded: Vec<String> = tail.iter().map(|m| m.id.clone()).collect();

        let resolution = resolve(policy, local.as_ref(), &server, &tail, Utc::now());
        let resubmitted = !matches!(resolution, Resolution::AcceptServer { .. });
        let change = match resolution {
            Resolution::AcceptServer { payload } => LocalChange::upsert(Record::from_remote(
                key.entity_type,
                key.id.clone(),
                payload,
                server.server_version.clone(),
            ))
            .discarding(discarded.clone()),
            Resolution::Resubmit { payload } => {
                let mut record = local
                    .unwrap_or_else(|| Record::new_local(key.entity_type, key.id.clone(), payload.clone()));
                record.payload = payload.clone();
                record.sync_status = SyncStatus::Pending;
                record.server_version = Some(server.server_version.clone());
                record.touch();
                LocalChange::upsert(record)
                    .discarding(discarded.clone())
                    .enqueueing(
                        NewMutation::new(
                            key.entity_type,
                            key.id.clone(),
                            MutationOperation::Update,
                            payload,
                        )
                        .with_base_version(Some(server.server_version.clone())),
                    )
            }
            Resolution::ResubmitDelete => LocalChange::default()
                .discarding(discarded.clone())
                .enqueueing(
                    NewMutation::new(
                        key.entity_type,
                        key.id.clone(),
                        MutationOperation::Delete,
                        serde_json::Value::Null,
                    )
                    .with_base_version(Some(server.server_version.clone())),
                ),
        };
        self.store.commit(change).await?;

        info!(
            "[Sync] Resolved conflict on {} {} with {} ({} queued mutations replaced)",
            key.entity_type,
            key.id,
            policy.as_str(),
            discarded.len()
        );
        self.events.emit(SyncEvent::ConflictResolved {
            entity_type: key.entity_type,
            entity_id: key.id.clone(),
            policy,
        });
        Ok(AppliedResolution {
            discarded,
            resubmitted,
        })
    }

    /// Resolves a held conflict with an explicit policy.
    ///
    /// Waits for a running drain to finish. Needs the server copy, so it fails with
    /// `Unavailable` while the remote cannot be reached.
    pub async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        id: &str,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let _cycle_lock = self.cycle_mutex.lock().await;
        let key = EntityKey::new(entity_type, id);
        let server = self
            .fetch_server_copy(&key)
            .await
            .ok_or_else(|| Error::Unavailable {
                entity_type,
                id: id.to_string(),
            })?;
        let applied = self.apply_resolution(&key, policy, server).await?;
        self.outbox.notify_pending_count()?;
        if applied.resubmitted {
            self.schedule_retry(self.config.backoff.delay(0));
        }
        Ok(())
    }

    /// Arms the retry timer. A single timer exists; a sooner deadline replaces a later one.
    fn schedule_retry(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut slot = lock(&self.retry_timer);
        if let Some(existing) = slot.as_ref() {
            if !existing.handle.is_finished() && existing.deadline <= deadline {
                return;
            }
        }
        if let Some(existing) = slot.take() {
            existing.handle.abort();
        }

        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            manager.clear_retry_timer(deadline);
            if let Err(err) = manager.drain_after_current(SyncTrigger::RetryTimer).await {
                warn!("[Sync] Retry drain failed: {}", err);
            }
        });
        debug!("[Sync] Retry scheduled in {:?}", delay);
        *slot = Some(ScheduledRetry { deadline, handle });
    }

    fn clear_retry_timer(&self, deadline: Instant) {
        let mut slot = lock(&self.retry_timer);
        if slot.as_ref().is_some_and(|timer| timer.deadline == deadline) {
            slot.take();
        }
    }

    /// Re-arms the retry timer from persisted retry deadlines, e.g. after a restart.
    pub fn rearm_retry_timer(&self) -> Result<()> {
        let earliest = self
            .outbox
            .all_pending()?
            .into_iter()
            .filter_map(|mutation| mutation.next_retry_at)
            .min();
        if let Some(retry_at) = earliest {
            let delay = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.schedule_retry(delay);
        }
        Ok(())
    }

    /// Drains on every offline→online transition until [`SyncManager::shutdown`].
    pub fn watch_connectivity(&self) {
        let mut changes = self.network.subscribe();
        let mut was_online = *changes.borrow_and_update() == NetworkStatus::Online;
        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let online = *changes.borrow_and_update() == NetworkStatus::Online;
                if online && !was_online {
                    let Some(manager) = this.upgrade() else {
                        break;
                    };
                    if let Err(err) = manager.drain(SyncTrigger::NetworkOnline).await {
                        warn!("[Sync] Drain after reconnect failed: {}", err);
                    }
                }
                was_online = online;
            }
        });

        if let Some(previous) = lock(&self.connectivity_task).replace(handle) {
            previous.abort();
        }
    }

    /// Stops the connectivity watcher and any scheduled retry.
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.connectivity_task).take() {
            task.abort();
        }
        if let Some(timer) = lock(&self.retry_timer).take() {
            timer.handle.abort();
        }
        debug!("[Sync] Background tasks stopped");
    }

    /// Maps a remote failure into the core error, with the configured timeout filled in.
    pub(crate) fn remote_error(&self, err: RemoteError) -> Error {
        match err {
            RemoteError::Timeout => Error::Timeout(self.config.request_timeout),
            other => Error::from(other),
        }
    }

    pub(crate) fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteAuthority> {
        &self.remote
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_guard_resets_state_on_drop() {
        let state = Mutex::new(SyncCycle::default());
        {
            let guard = CycleGuard::enter(&state);
            guard.update(2, 5);
            assert_eq!(
                *lock(&state),
                SyncCycle {
                    in_progress: true,
                    processed_count: 2,
                    total_count: 5,
                }
            );
        }
        assert_eq!(*lock(&state), SyncCycle::default());
    }

    #[test]
    fn cycle_guard_resets_state_on_unwind() {
        let state = Mutex::new(SyncCycle::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = CycleGuard::enter(&state);
            panic!("drain blew up");
        }));
        assert!(result.is_err());
        assert!(!lock(&state).in_progress);
    }
}
