use super::model::{action_from_row, dropped_from_row};
use super::Pool;
use crate::model::{DroppedAction, EntityType, NewAction, OfflineAction};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::{Row, SqliteConnection};
use tracing::instrument;

/// Append-only log of pending mutations, drained in enqueue order.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    pool: Pool,
}

impl OfflineQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(entity = %action.entity_type, kind = action.kind.as_str()))]
    pub async fn enqueue(&self, action: &NewAction) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        enqueue_action(&mut conn, action).await
    }

    /// Every queued action, oldest first. Lazy and finite: each item is one
    /// keyset query, so callers may remove or back off actions while
    /// iterating. Calling again restarts from the head of the queue.
    pub fn dequeue_in_order(&self) -> BoxStream<'_, Result<OfflineAction>> {
        stream::try_unfold(0_i64, move |after| async move {
            let row = sqlx::query(
                "SELECT * FROM offline_actions WHERE id > ? ORDER BY id ASC LIMIT 1",
            )
            .bind(after)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => {
                    let action = action_from_row(&row)?;
                    let next = action.id;
                    Ok(Some((action, next)))
                }
                None => Ok(None),
            }
        })
        .boxed()
    }

    pub async fn get(&self, id: i64) -> Result<Option<OfflineAction>> {
        let row = sqlx::query("SELECT * FROM offline_actions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    #[instrument(skip_all)]
    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM offline_actions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count the attempt and push `due_at` out by the backoff for it.
    #[instrument(skip_all)]
    pub async fn backoff(
        &self,
        id: i64,
        attempt: i32,
        now: DateTime<Utc>,
        max_cap_secs: i64,
        error: &str,
    ) -> Result<DateTime<Utc>> {
        let due_at = now + backoff_delay(attempt, max_cap_secs);
        sqlx::query(
            "UPDATE offline_actions SET attempt = ?, due_at_ms = ?, last_error = ? WHERE id = ?",
        )
        .bind(attempt + 1)
        .bind(due_at.timestamp_millis())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(due_at)
    }

    /// Move an action to `dropped_actions` so it is never retried.
    #[instrument(skip_all)]
    pub async fn drop_action(
        &self,
        action: &OfflineAction,
        reason: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO dropped_actions \
                 (id, entity_type, entity_id, kind, payload, attempt, reason, error, \
                  dropped_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(action.id)
        .bind(action.entity_type.as_str())
        .bind(&action.entity_id)
        .bind(action.kind.as_str())
        .bind(serde_json::to_string(&action.payload)?)
        .bind(action.attempt)
        .bind(reason)
        .bind(error)
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM offline_actions WHERE id = ?")
            .bind(action.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_for_entity(&self, entity: EntityType, entity_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM offline_actions WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(entity.as_str())
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Earliest time any queued action becomes due, if the queue is non-empty.
    pub async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(due_at_ms) AS due FROM offline_actions")
            .fetch_one(&self.pool)
            .await?;
        let due: Option<i64> = row.try_get("due")?;
        Ok(due.map(crate::model::millis_to_datetime))
    }

    pub async fn list_dropped(&self) -> Result<Vec<DroppedAction>> {
        let rows = sqlx::query("SELECT * FROM dropped_actions ORDER BY dropped_at_ms DESC, id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dropped_from_row).collect()
    }

    pub async fn count_dropped(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dropped_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Forget a dropped action once the user has seen it.
    pub async fn dismiss_dropped(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM dropped_actions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub(crate) async fn enqueue_action(conn: &mut SqliteConnection, action: &NewAction) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO offline_actions \
             (entity_type, entity_id, kind, payload, row_snapshot, created_at_ms, \
              attempt, due_at_ms) \
         VALUES (?, ?, ?, ?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(action.entity_type.as_str())
    .bind(&action.entity_id)
    .bind(action.kind.as_str())
    .bind(serde_json::to_string(&action.payload)?)
    .bind(serde_json::to_string(&action.row)?)
    .bind(action.created_at.timestamp_millis())
    .bind(action.created_at.timestamp_millis())
    .fetch_one(&mut *conn)
    .await?;
    Ok(rec.get("id"))
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (or 3600s
/// when the cap is not positive).
pub fn backoff_delay(attempt: i32, max_cap_secs: i64) -> Duration {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    Duration::seconds(secs.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::model::{now_millis, ActionKind};
    use futures::TryStreamExt;
    use serde_json::json;

    fn update(entity_id: &str, completed: bool) -> NewAction {
        NewAction {
            entity_type: EntityType::LightWorkTasks,
            entity_id: entity_id.into(),
            kind: ActionKind::Update,
            payload: json!({ "completed": completed }),
            row: json!({ "id": entity_id, "completed": completed }),
            created_at: now_millis(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0, 60), Duration::seconds(5));
        assert_eq!(backoff_delay(1, 60), Duration::seconds(10));
        assert_eq!(backoff_delay(3, 60), Duration::seconds(40));
        assert_eq!(backoff_delay(4, 60), Duration::seconds(60));
        assert_eq!(backoff_delay(30, 0), Duration::seconds(3600));
    }

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let queue = OfflineQueue::new(test_pool().await);
        let a = queue.enqueue(&update("t1", true)).await.unwrap();
        let b = queue.enqueue(&update("t2", true)).await.unwrap();
        let c = queue.enqueue(&update("t1", false)).await.unwrap();
        assert!(a < b && b < c);

        let ids: Vec<i64> = queue
            .dequeue_in_order()
            .map_ok(|a| a.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec![a, b, c]);

        // Restartable: a second drain starts from the head again.
        let again: Vec<OfflineAction> = queue.dequeue_in_order().try_collect().await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again[0].payload, json!({ "completed": true }));
    }

    #[tokio::test]
    async fn remove_while_draining() {
        let queue = OfflineQueue::new(test_pool().await);
        for i in 0..3 {
            queue.enqueue(&update(&format!("t{i}"), true)).await.unwrap();
        }
        let mut drained = 0;
        let mut stream = queue.dequeue_in_order();
        while let Some(action) = stream.try_next().await.unwrap() {
            queue.remove(action.id).await.unwrap();
            drained += 1;
        }
        drop(stream);
        assert_eq!(drained, 3);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backoff_then_drop() {
        let queue = OfflineQueue::new(test_pool().await);
        let id = queue.enqueue(&update("t1", true)).await.unwrap();
        let now = now_millis();

        let due = queue.backoff(id, 0, now, 60, "timeout").await.unwrap();
        assert_eq!(due, now + Duration::seconds(5));
        let action = queue.get(id).await.unwrap().unwrap();
        assert_eq!(action.attempt, 1);
        assert_eq!(action.due_at, due);
        assert_eq!(action.last_error.as_deref(), Some("timeout"));
        assert_eq!(queue.next_due_at().await.unwrap(), Some(due));

        queue.drop_action(&action, "retry budget exhausted", "timeout", now).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
        assert_eq!(queue.next_due_at().await.unwrap(), None);
        let dropped = queue.list_dropped().await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, id);
        assert_eq!(dropped[0].reason, "retry budget exhausted");

        queue.dismiss_dropped(id).await.unwrap();
        assert_eq!(queue.count_dropped().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_per_entity() {
        let queue = OfflineQueue::new(test_pool().await);
        queue.enqueue(&update("t1", true)).await.unwrap();
        queue.enqueue(&update("t1", false)).await.unwrap();
        queue.enqueue(&update("t2", true)).await.unwrap();
        assert_eq!(queue.count_for_entity(EntityType::LightWorkTasks, "t1").await.unwrap(), 2);
        assert_eq!(queue.count_for_entity(EntityType::DeepWorkTasks, "t1").await.unwrap(), 0);
    }
}
