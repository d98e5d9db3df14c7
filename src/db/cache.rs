use super::model::record_from_row;
use super::Pool;
use crate::model::{EntityRecord, EntityType, SyncStatus};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

/// Index-backed filter for [`LocalCache::get_all`]. Empty matches everything
/// in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub user_id: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn day(user_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: Some(user_id.into()),
            date_from: Some(date),
            date_to: Some(date),
        }
    }
}

/// The local source of truth for reads. Writes from the user and from the
/// orchestrator merge by last-write-wins on `updated_at`.
#[derive(Debug, Clone)]
pub struct LocalCache {
    pool: Pool,
}

impl LocalCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all, fields(store = %store))]
    pub async fn get(&self, store: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        let row = sqlx::query("SELECT * FROM cache_records WHERE store = ? AND id = ?")
            .bind(store.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Store `record` unless a strictly newer version is already cached.
    /// Returns whether the write was applied.
    #[instrument(skip_all, fields(store = %store))]
    pub async fn put(&self, store: EntityType, record: &EntityRecord) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        put_record(&mut conn, store, record).await
    }

    #[instrument(skip_all, fields(store = %store))]
    pub async fn delete(&self, store: EntityType, id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        delete_record(&mut conn, store, id).await
    }

    #[instrument(skip_all, fields(store = %store))]
    pub async fn get_all(
        &self,
        store: EntityType,
        filter: &RecordFilter,
    ) -> Result<Vec<EntityRecord>> {
        let date_from = filter.date_from.map(|d| d.format("%Y-%m-%d").to_string());
        let date_to = filter.date_to.map(|d| d.format("%Y-%m-%d").to_string());
        let rows = sqlx::query(
            "SELECT * FROM cache_records \
             WHERE store = ? \
               AND (? IS NULL OR user_id = ?) \
               AND (? IS NULL OR date >= ?) \
               AND (? IS NULL OR date <= ?) \
             ORDER BY date, created_at_ms, id",
        )
        .bind(store.as_str())
        .bind(filter.user_id.as_deref())
        .bind(filter.user_id.as_deref())
        .bind(date_from.as_deref())
        .bind(date_from.as_deref())
        .bind(date_to.as_deref())
        .bind(date_to.as_deref())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Settle the sync status of a record that has nothing left in the queue.
    /// Returns false, leaving the record untouched, while any action for it is
    /// still queued.
    pub async fn set_sync_status(
        &self,
        store: EntityType,
        id: &str,
        status: SyncStatus,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE cache_records SET sync_status = ? \
             WHERE store = ? AND id = ? \
               AND NOT EXISTS ( \
                   SELECT 1 FROM offline_actions WHERE entity_type = ? AND entity_id = ? \
               )",
        )
        .bind(status.as_str())
        .bind(store.as_str())
        .bind(id)
        .bind(store.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update sync status")?;
        Ok(res.rows_affected() > 0)
    }

    /// Other cached records (different ids) of the same user and day whose
    /// `columns` equal those of `probe`: local twins under a composite
    /// conflict key.
    pub async fn find_by_columns(
        &self,
        store: EntityType,
        probe: &EntityRecord,
        columns: &[&str],
    ) -> Result<Vec<EntityRecord>> {
        let filter = RecordFilter {
            user_id: Some(probe.user_id.clone()),
            date_from: probe.date,
            date_to: probe.date,
        };
        let twins = self
            .get_all(store, &filter)
            .await?
            .into_iter()
            .filter(|candidate| {
                candidate.id != probe.id
                    && columns.iter().all(|c| candidate.column(c) == probe.column(c))
            })
            .collect();
        Ok(twins)
    }
}

pub(crate) async fn put_record(
    conn: &mut SqliteConnection,
    store: EntityType,
    record: &EntityRecord,
) -> Result<bool> {
    let data = serde_json::to_string(&record.fields)?;
    let res = sqlx::query(
        "INSERT INTO cache_records \
             (store, id, user_id, date, data, created_at_ms, updated_at_ms, sync_status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (store, id) DO UPDATE SET \
             user_id = excluded.user_id, \
             date = excluded.date, \
             data = excluded.data, \
             created_at_ms = excluded.created_at_ms, \
             updated_at_ms = excluded.updated_at_ms, \
             sync_status = excluded.sync_status \
         WHERE excluded.updated_at_ms >= cache_records.updated_at_ms",
    )
    .bind(store.as_str())
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(record.date.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(data)
    .bind(record.created_at.timestamp_millis())
    .bind(record.updated_at.timestamp_millis())
    .bind(record.sync_status.as_str())
    .execute(&mut *conn)
    .await?;
    let applied = res.rows_affected() > 0;
    if !applied {
        debug!(id = %record.id, "stale write ignored; cached version is newer");
    }
    Ok(applied)
}

pub(crate) async fn delete_record(
    conn: &mut SqliteConnection,
    store: EntityType,
    id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM cache_records WHERE store = ? AND id = ?")
        .bind(store.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
