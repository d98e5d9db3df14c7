//! Optimistic local mutations.
//!
//! Every mutation is applied to the local cache immediately with
//! `SyncStatus::Pending` and, in the same SQLite transaction, recorded as an
//! offline action. The orchestrator later confirms it remotely or marks the
//! record failed.

use crate::db::cache::{delete_record, put_record};
use crate::db::queue::{enqueue_action, OfflineQueue};
use crate::db::{LocalCache, RecordFilter};
use crate::model::{
    now_millis, ActionKind, DroppedAction, EntityRecord, EntityType, NewAction, SyncStatus,
};
use crate::sync_map::SyncTableMap;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, instrument};

/// What the UI shows about sync progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineStatus {
    pub pending: i64,
    pub dropped: i64,
    /// True while local changes have not reached the remote store.
    pub working_offline: bool,
}

#[derive(Debug, Clone)]
pub struct OfflineStore {
    cache: LocalCache,
    queue: OfflineQueue,
    map: SyncTableMap,
}

impl OfflineStore {
    pub fn new(cache: LocalCache, map: SyncTableMap) -> Self {
        let queue = OfflineQueue::new(cache.pool().clone());
        Self { cache, queue, map }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub async fn get(&self, entity: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        self.cache.get(entity, id).await
    }

    pub async fn list_day(
        &self,
        entity: EntityType,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<EntityRecord>> {
        self.cache.get_all(entity, &RecordFilter::day(user_id, date)).await
    }

    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn create(
        &self,
        entity: EntityType,
        mut record: EntityRecord,
    ) -> Result<EntityRecord> {
        record.sync_status = SyncStatus::Pending;
        let action = NewAction {
            entity_type: entity,
            entity_id: record.id.clone(),
            kind: ActionKind::Create,
            payload: Value::Object(record.fields.clone()),
            row: record.to_remote_row(),
            created_at: record.updated_at,
        };
        let mut tx = self.cache.pool().begin().await?;
        put_record(&mut tx, entity, &record).await?;
        let action_id = enqueue_action(&mut tx, &action).await?;
        tx.commit().await?;
        info!(id = %record.id, action_id, "record created locally");
        Ok(record)
    }

    /// Merge `patch` into the record's fields. A `date` key moves the record
    /// to another day.
    #[instrument(skip_all, fields(entity = %entity, id = %id))]
    pub async fn update(
        &self,
        entity: EntityType,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<EntityRecord> {
        let mut record = self
            .cache
            .get(entity, id)
            .await?
            .ok_or_else(|| anyhow!("{entity} {id} not found"))?;
        for (key, value) in &patch {
            match key.as_str() {
                "id" | "user_id" | "created_at" | "updated_at" => {
                    return Err(anyhow!("{key} cannot be changed by an update"));
                }
                "date" => {
                    record.date = match value {
                        Value::Null => None,
                        Value::String(raw) => Some(crate::model::parse_date(raw)?),
                        other => return Err(anyhow!("invalid date {other}")),
                    };
                }
                _ => {
                    record.fields.insert(key.clone(), value.clone());
                }
            }
        }
        record.updated_at = next_write_time(record.updated_at);
        record.sync_status = SyncStatus::Pending;

        let action = NewAction {
            entity_type: entity,
            entity_id: record.id.clone(),
            kind: ActionKind::Update,
            payload: Value::Object(patch),
            row: record.to_remote_row(),
            created_at: record.updated_at,
        };
        let mut tx = self.cache.pool().begin().await?;
        put_record(&mut tx, entity, &record).await?;
        enqueue_action(&mut tx, &action).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Flip the `completed` flag of a task.
    pub async fn toggle_complete(&self, entity: EntityType, id: &str) -> Result<EntityRecord> {
        let current = self
            .cache
            .get(entity, id)
            .await?
            .ok_or_else(|| anyhow!("{entity} {id} not found"))?;
        let completed = current
            .fields
            .get("completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut patch = Map::new();
        patch.insert("completed".into(), json!(!completed));
        self.update(entity, id, patch).await
    }

    /// Remove the record locally and queue the remote delete. Returns false
    /// when there was nothing to delete.
    #[instrument(skip_all, fields(entity = %entity, id = %id))]
    pub async fn delete(&self, entity: EntityType, id: &str) -> Result<bool> {
        let Some(record) = self.cache.get(entity, id).await? else {
            return Ok(false);
        };
        let entry = self.map.resolve(entity);
        let mut key = Map::new();
        for column in entry.effective_conflict_key() {
            let value = record
                .column(column)
                .ok_or_else(|| anyhow!("{entity} {id} has no value for key column {column}"))?;
            key.insert(column.to_string(), value);
        }
        let key = Value::Object(key);
        let action = NewAction {
            entity_type: entity,
            entity_id: record.id.clone(),
            kind: ActionKind::Delete,
            payload: key.clone(),
            row: key,
            created_at: now_millis(),
        };
        let mut tx = self.cache.pool().begin().await?;
        delete_record(&mut tx, entity, id).await?;
        enqueue_action(&mut tx, &action).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn status(&self) -> Result<OfflineStatus> {
        let pending = self.queue.count().await?;
        let dropped = self.queue.count_dropped().await?;
        Ok(OfflineStatus {
            pending,
            dropped,
            working_offline: pending > 0,
        })
    }

    pub async fn dropped(&self) -> Result<Vec<DroppedAction>> {
        self.queue.list_dropped().await
    }
}

/// A write time strictly after `previous`, so local edits always win
/// against the version they replace.
fn next_write_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_millis();
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use futures::TryStreamExt;

    async fn store() -> OfflineStore {
        OfflineStore::new(LocalCache::new(test_pool().await), SyncTableMap::default())
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 10).unwrap()
    }

    fn task(title: &str) -> EntityRecord {
        let mut fields = Map::new();
        fields.insert("title".into(), json!(title));
        fields.insert("completed".into(), json!(false));
        EntityRecord::new("user-1", Some(day()), fields)
    }

    #[tokio::test]
    async fn create_applies_locally_and_queues() {
        let store = store().await;
        let rec = store.create(EntityType::LightWorkTasks, task("stretch")).await.unwrap();

        let cached = store.get(EntityType::LightWorkTasks, &rec.id).await.unwrap().unwrap();
        assert_eq!(cached.sync_status, SyncStatus::Pending);

        let actions: Vec<_> = store.queue().dequeue_in_order().try_collect().await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Create);
        assert_eq!(actions[0].entity_id, rec.id);
        assert_eq!(actions[0].row["title"], json!("stretch"));

        let status = store.status().await.unwrap();
        assert!(status.working_offline);
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn toggle_records_patch_payload() {
        let store = store().await;
        let rec = store.create(EntityType::LightWorkTasks, task("email")).await.unwrap();
        let toggled = store.toggle_complete(EntityType::LightWorkTasks, &rec.id).await.unwrap();
        assert_eq!(toggled.fields["completed"], json!(true));
        assert!(toggled.updated_at > rec.updated_at);

        let actions: Vec<_> = store.queue().dequeue_in_order().try_collect().await.unwrap();
        assert_eq!(actions[1].kind, ActionKind::Update);
        assert_eq!(actions[1].payload, json!({ "completed": true }));
        assert_eq!(actions[1].row["title"], json!("email"));
        assert_eq!(actions[1].row["completed"], json!(true));
    }

    #[tokio::test]
    async fn update_rejects_identity_changes() {
        let store = store().await;
        let rec = store.create(EntityType::DeepWorkTasks, task("focus")).await.unwrap();
        let mut patch = Map::new();
        patch.insert("user_id".into(), json!("someone-else"));
        assert!(store.update(EntityType::DeepWorkTasks, &rec.id, patch).await.is_err());

        let missing = store.update(EntityType::DeepWorkTasks, "nope", Map::new()).await;
        assert!(missing.unwrap_err().to_string().contains("not found"));
    }

    #[tokio::test]
    async fn delete_queues_conflict_key_columns() {
        let store = store().await;
        let mut block = task("deep work");
        block.fields.insert("start_time".into(), json!("09:00"));
        let rec = store.create(EntityType::TimeBlocks, block).await.unwrap();

        assert!(store.delete(EntityType::TimeBlocks, &rec.id).await.unwrap());
        assert!(store.get(EntityType::TimeBlocks, &rec.id).await.unwrap().is_none());
        assert!(!store.delete(EntityType::TimeBlocks, &rec.id).await.unwrap());

        let actions: Vec<_> = store.queue().dequeue_in_order().try_collect().await.unwrap();
        let delete = actions.last().unwrap();
        assert_eq!(delete.kind, ActionKind::Delete);
        assert_eq!(
            delete.row,
            json!({ "user_id": "user-1", "date": "2025-02-10", "start_time": "09:00" })
        );
    }

    #[tokio::test]
    async fn list_day_reads_from_cache() {
        let store = store().await;
        store.create(EntityType::LightWorkTasks, task("a")).await.unwrap();
        store.create(EntityType::LightWorkTasks, task("b")).await.unwrap();
        let next_day = NaiveDate::from_ymd_opt(2025, 2, 11);
        let other_day = EntityRecord::new("user-1", next_day, Map::new());
        store.create(EntityType::LightWorkTasks, other_day).await.unwrap();

        let today = store.list_day(EntityType::LightWorkTasks, "user-1", day()).await.unwrap();
        assert_eq!(today.len(), 2);
    }
}
