//! Drains the offline action queue against the remote store.
//!
//! Per action: `Pending -> Applying -> Confirmed | FailedRetryable |
//! FailedPermanent`. Network errors back off and stay queued; permission and
//! schema errors drop the action at once, as does exhausting the retry
//! budget. Within one entity actions apply strictly in enqueue order: once
//! an action is deferred or backed off, later actions for the same entity
//! wait for it.

use crate::config::Config;
use crate::db::queue::OfflineQueue;
use crate::db::settings;
use crate::db::{LocalCache, RecordFilter};
use crate::error::{RemoteError, RetryClass};
use crate::model::{
    now_millis, ActionKind, ActionState, EntityRecord, EntityType, OfflineAction, SyncStatus,
};
use crate::remote::{Filter, RemoteStore};
use crate::sync_map::{SchemaConstraints, SyncTableEntry, SyncTableMap};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Attempts before a retryable action is dropped.
    pub max_attempts: u32,
    pub max_backoff_secs: i64,
    pub poll_interval: Duration,
}

impl SyncPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.app.max_attempts,
            max_backoff_secs: i64::try_from(cfg.app.max_backoff_seconds).unwrap_or(i64::MAX),
            poll_interval: Duration::from_millis(cfg.app.poll_interval_ms),
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_backoff_secs: 300,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    PermissionDenied,
    Misconfigured,
    Rejected,
    RetryBudgetExhausted,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::PermissionDenied => "permission_denied",
            DropReason::Misconfigured => "misconfigured",
            DropReason::Rejected => "rejected",
            DropReason::RetryBudgetExhausted => "retry_budget_exhausted",
        }
    }

    /// Text for the error toast shown when an action is dropped.
    pub fn user_message(&self) -> &'static str {
        match self {
            DropReason::PermissionDenied => {
                "Permission denied while saving your changes. Please contact an admin."
            }
            DropReason::Misconfigured => {
                "A change could not be saved because of a server configuration problem."
            }
            DropReason::Rejected => "The server rejected a change; it has been discarded.",
            DropReason::RetryBudgetExhausted => {
                "A change could not be saved after several attempts and was discarded."
            }
        }
    }
}

/// A permanently failed action, reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropNotice {
    pub action_id: i64,
    pub entity: EntityType,
    pub entity_id: String,
    pub reason: DropReason,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub confirmed: usize,
    pub retried: usize,
    /// Not due yet, or waiting behind an earlier action for the same entity.
    pub deferred: usize,
    pub dropped: Vec<DropNotice>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.confirmed == 0 && self.retried == 0 && self.deferred == 0 && self.dropped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub applied: usize,
    /// Remote rows older than the cached version.
    pub skipped: usize,
    pub invalid: usize,
}

pub struct Orchestrator {
    cache: LocalCache,
    queue: OfflineQueue,
    remote: Arc<dyn RemoteStore>,
    map: SyncTableMap,
    policy: SyncPolicy,
}

impl Orchestrator {
    /// Fails when the table map disagrees with `schema`; syncing with a wrong
    /// conflict key would duplicate or overwrite rows.
    pub fn new(
        cache: LocalCache,
        remote: Arc<dyn RemoteStore>,
        map: SyncTableMap,
        schema: &SchemaConstraints,
        policy: SyncPolicy,
    ) -> Result<Self> {
        if let Err(mismatches) = map.validate(schema) {
            for mismatch in &mismatches {
                error!(%mismatch, "sync table map does not match remote schema");
            }
            bail!(
                "sync table map has {} conflict key mismatch(es); first: {}",
                mismatches.len(),
                mismatches[0]
            );
        }
        let queue = OfflineQueue::new(cache.pool().clone());
        Ok(Self {
            cache,
            queue,
            remote,
            map,
            policy,
        })
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Apply every due action once, in queue order.
    #[instrument(skip_all)]
    pub async fn sync_pass(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();
        let mut actions = self.queue.dequeue_in_order();
        while let Some(action) = actions.try_next().await? {
            let key = (action.entity_type, action.entity_id.clone());
            if blocked.contains(&key) {
                debug!(id = action.id, "waiting behind earlier action for the same entity");
                report.deferred += 1;
                continue;
            }
            if action.due_at > now {
                blocked.insert(key);
                report.deferred += 1;
                continue;
            }
            let state = self.process(&action, now, &mut report).await?;
            if state == ActionState::FailedRetryable {
                blocked.insert(key);
            }
        }
        Ok(report)
    }

    async fn process(
        &self,
        action: &OfflineAction,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<ActionState> {
        let entry = self.map.resolve(action.entity_type);
        debug!(
            id = action.id,
            entity = %action.entity_type,
            kind = action.kind.as_str(),
            state = ?ActionState::Applying,
            "applying action"
        );
        let err = match self.apply(entry, action).await {
            Ok(returned) => {
                self.queue.remove(action.id).await?;
                self.confirm(entry, action, returned).await?;
                info!(
                    id = action.id,
                    entity = %action.entity_type,
                    entity_id = %action.entity_id,
                    "action confirmed"
                );
                report.confirmed += 1;
                return Ok(ActionState::Confirmed);
            }
            Err(err) => err,
        };

        let reason = match err.retry_class() {
            RetryClass::Retryable => {
                let attempts = u32::try_from(action.attempt).unwrap_or(0) + 1;
                if attempts < self.policy.max_attempts {
                    let cap = self.policy.max_backoff_secs;
                    let due = self
                        .queue
                        .backoff(action.id, action.attempt, now, cap, &err.to_string())
                        .await?;
                    warn!(?err, id = action.id, attempt = attempts, %due, "action failed; backoff");
                    report.retried += 1;
                    return Ok(ActionState::FailedRetryable);
                }
                DropReason::RetryBudgetExhausted
            }
            RetryClass::PermissionDenied => {
                error!(
                    ?err,
                    id = action.id,
                    table = entry.table,
                    "permission denied by remote store"
                );
                DropReason::PermissionDenied
            }
            RetryClass::Misconfigured => {
                error!(
                    ?err,
                    id = action.id,
                    table = entry.table,
                    conflict_key = %entry.effective_conflict_key().join(","),
                    "constraint violation; sync table map is out of date with the remote schema"
                );
                DropReason::Misconfigured
            }
            RetryClass::Permanent => DropReason::Rejected,
        };
        self.drop_action(action, reason, &err, now, report).await?;
        Ok(ActionState::FailedPermanent)
    }

    async fn apply(
        &self,
        entry: &SyncTableEntry,
        action: &OfflineAction,
    ) -> Result<Option<Value>, RemoteError> {
        let key = entry.effective_conflict_key();
        match action.kind {
            ActionKind::Create | ActionKind::Update => {
                key_filters(entry, &action.row, &key)?;
                self.remote.upsert(entry.table, &action.row, &key).await.map(Some)
            }
            ActionKind::Delete => {
                let filters = key_filters(entry, &action.row, &key)?;
                self.remote.delete(entry.table, &filters).await.map(|_| None)
            }
        }
    }

    /// Phase two of an optimistic write: adopt the stored row and mark the
    /// local record confirmed once nothing else is queued for it.
    async fn confirm(
        &self,
        entry: &SyncTableEntry,
        action: &OfflineAction,
        returned: Option<Value>,
    ) -> Result<()> {
        let entity = action.entity_type;
        if self.queue.count_for_entity(entity, &action.entity_id).await? > 0 {
            return Ok(());
        }
        if let Some(row) = returned {
            match EntityRecord::from_remote_row(&row) {
                Ok(mut stored) => {
                    stored.sync_status = SyncStatus::Confirmed;
                    if stored.id != action.entity_id {
                        debug!(
                            local = %action.entity_id,
                            remote = %stored.id,
                            "remote kept its own id; re-keying"
                        );
                        self.cache.delete(entity, &action.entity_id).await?;
                    }
                    if let Some(columns) = entry.on_conflict {
                        self.drop_settled_twins(entity, &stored, columns).await?;
                    }
                    self.cache.put(entity, &stored).await?;
                }
                Err(err) => warn!(?err, id = action.id, "could not parse row returned by upsert"),
            }
        }
        // No-op if the user edited the record again since the count above.
        self.cache
            .set_sync_status(entity, &action.entity_id, SyncStatus::Confirmed)
            .await?;
        Ok(())
    }

    /// Remove cached twins of `stored` that have nothing queued; the remote
    /// row now stands for all of them. Twins with queued changes stay and
    /// are reconciled when their own actions confirm.
    async fn drop_settled_twins(
        &self,
        entity: EntityType,
        stored: &EntityRecord,
        columns: &[&str],
    ) -> Result<()> {
        for twin in self.cache.find_by_columns(entity, stored, columns).await? {
            if self.queue.count_for_entity(entity, &twin.id).await? > 0 {
                continue;
            }
            debug!(twin = %twin.id, kept = %stored.id, "removing cached twin of confirmed row");
            self.cache.delete(entity, &twin.id).await?;
        }
        Ok(())
    }

    async fn drop_action(
        &self,
        action: &OfflineAction,
        reason: DropReason,
        err: &RemoteError,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<()> {
        warn!(
            id = action.id,
            entity = %action.entity_type,
            entity_id = %action.entity_id,
            kind = action.kind.as_str(),
            attempt = action.attempt,
            reason = reason.as_str(),
            error = %err,
            "Dropping action"
        );
        let error = err.to_string();
        self.queue.drop_action(action, reason.as_str(), &error, now).await?;
        // Later actions for the entity keep it pending until they settle.
        self.cache
            .set_sync_status(action.entity_type, &action.entity_id, SyncStatus::Failed)
            .await?;
        report.dropped.push(DropNotice {
            action_id: action.id,
            entity: action.entity_type,
            entity_id: action.entity_id.clone(),
            reason,
            error,
        });
        Ok(())
    }

    /// Fetch remote rows for `filter` and merge them into the cache.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn pull(&self, entity: EntityType, filter: &RecordFilter) -> Result<PullReport> {
        let entry = self.map.resolve(entity);
        let mut filters = Vec::new();
        if let Some(user_id) = &filter.user_id {
            filters.push(Filter::eq("user_id", user_id.as_str()));
        }
        if let Some(from) = filter.date_from {
            filters.push(Filter::gte("date", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = filter.date_to {
            filters.push(Filter::lte("date", to.format("%Y-%m-%d").to_string()));
        }
        let rows = self.remote.select(entry.table, &filters).await?;

        let mut report = PullReport::default();
        for row in rows {
            match EntityRecord::from_remote_row(&row) {
                Ok(record) => {
                    if self.merge_remote(entity, entry, record).await? {
                        report.applied += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Err(err) => {
                    warn!(?err, table = entry.table, "skipping malformed remote row");
                    report.invalid += 1;
                }
            }
        }
        settings::set_setting(
            self.cache.pool(),
            &format!("pull_cursor:{entity}"),
            &now_millis().to_rfc3339(),
        )
        .await?;
        info!(
            applied = report.applied,
            skipped = report.skipped,
            invalid = report.invalid,
            "pull finished"
        );
        Ok(report)
    }

    /// Last-write-wins merge of one remote row. Cached twins under the same
    /// composite key but a different id are replaced when the remote is
    /// newer; a twin with queued changes is kept until they are applied.
    async fn merge_remote(
        &self,
        entity: EntityType,
        entry: &SyncTableEntry,
        mut remote: EntityRecord,
    ) -> Result<bool> {
        let twins = match entry.on_conflict {
            Some(columns) => self.cache.find_by_columns(entity, &remote, columns).await?,
            None => Vec::new(),
        };
        for twin in &twins {
            if self.queue.count_for_entity(entity, &twin.id).await? > 0 {
                debug!(
                    local = %twin.id,
                    remote = %remote.id,
                    "local twin has queued changes; keeping it"
                );
                return Ok(false);
            }
            if twin.updated_at > remote.updated_at {
                return Ok(false);
            }
        }
        for twin in twins {
            debug!(local = %twin.id, remote = %remote.id, "re-keying local twin to remote id");
            self.cache.delete(entity, &twin.id).await?;
        }
        remote.sync_status = if self.queue.count_for_entity(entity, &remote.id).await? > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Confirmed
        };
        self.cache.put(entity, &remote).await
    }

    /// Sync whenever connectivity comes back and on every poll tick while
    /// online, until `shutdown` resolves or the connectivity sender is gone.
    pub async fn run<F>(&self, mut online: watch::Receiver<bool>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("sync loop stopping");
                    return Ok(());
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        info!("connectivity channel closed; sync loop stopping");
                        return Ok(());
                    }
                    if !*online.borrow_and_update() {
                        info!("offline; sync paused");
                        continue;
                    }
                    info!("back online; syncing");
                }
                _ = ticker.tick() => {
                    if !*online.borrow() {
                        continue;
                    }
                }
            }
            match self.sync_pass(now_millis()).await {
                Ok(report) if !report.is_empty() => info!(
                    confirmed = report.confirmed,
                    retried = report.retried,
                    deferred = report.deferred,
                    dropped = report.dropped.len(),
                    "sync pass finished"
                ),
                Ok(_) => {}
                Err(err) => error!(?err, "sync pass failed"),
            }
        }
    }
}

/// Equality filters on the conflict key columns of `row`; a missing column
/// means the row cannot be matched and is a misconfiguration.
fn key_filters(
    entry: &SyncTableEntry,
    row: &Value,
    key: &[&str],
) -> Result<Vec<Filter>, RemoteError> {
    key.iter()
        .map(|column| match row.get(*column) {
            Some(value) if !value.is_null() => Ok(Filter::eq(*column, value.clone())),
            _ => Err(RemoteError::Constraint {
                table: entry.table.to_string(),
                message: format!("row is missing conflict key column {column}: {}", json!(row)),
            }),
        })
        .collect()
}
