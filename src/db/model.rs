//! Row mapping shared by the repositories.
//!
//! Timestamps are stored as unix milliseconds so ordering and last-write-wins
//! comparisons happen in SQL on plain integers.

use crate::model::{
    millis_to_datetime, parse_date, ActionKind, DroppedAction, EntityRecord, EntityType,
    OfflineAction, SyncStatus,
};
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) fn record_from_row(row: &SqliteRow) -> Result<EntityRecord> {
    let id: String = row.get("id");
    let data: String = row.get("data");
    let fields: Map<String, Value> =
        serde_json::from_str(&data).with_context(|| format!("corrupt cached record {id}"))?;
    let date = row
        .try_get::<Option<String>, _>("date")?
        .map(|d| parse_date(&d))
        .transpose()?;
    let status: String = row.get("sync_status");
    Ok(EntityRecord {
        user_id: row.get("user_id"),
        date,
        fields,
        created_at: millis_to_datetime(row.get("created_at_ms")),
        updated_at: millis_to_datetime(row.get("updated_at_ms")),
        sync_status: SyncStatus::parse(&status)
            .ok_or_else(|| anyhow!("record {id} has unknown sync status {status}"))?,
        id,
    })
}

pub(crate) fn action_from_row(row: &SqliteRow) -> Result<OfflineAction> {
    let id: i64 = row.get("id");
    let entity: String = row.get("entity_type");
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");
    let snapshot: String = row.get("row_snapshot");
    Ok(OfflineAction {
        id,
        entity_type: EntityType::parse(&entity)
            .ok_or_else(|| anyhow!("action {id} has unknown entity type {entity}"))?,
        entity_id: row.get("entity_id"),
        kind: ActionKind::parse(&kind)
            .ok_or_else(|| anyhow!("action {id} has unknown kind {kind}"))?,
        payload: serde_json::from_str(&payload)
            .with_context(|| format!("corrupt payload on action {id}"))?,
        row: serde_json::from_str(&snapshot)
            .with_context(|| format!("corrupt row snapshot on action {id}"))?,
        created_at: millis_to_datetime(row.get("created_at_ms")),
        attempt: row.get("attempt"),
        due_at: millis_to_datetime(row.get("due_at_ms")),
        last_error: row.try_get("last_error")?,
    })
}

pub(crate) fn dropped_from_row(row: &SqliteRow) -> Result<DroppedAction> {
    let id: i64 = row.get("id");
    let entity: String = row.get("entity_type");
    let kind: String = row.get("kind");
    Ok(DroppedAction {
        id,
        entity_type: EntityType::parse(&entity)
            .ok_or_else(|| anyhow!("dropped action {id} has unknown entity type {entity}"))?,
        entity_id: row.get("entity_id"),
        kind: ActionKind::parse(&kind)
            .ok_or_else(|| anyhow!("dropped action {id} has unknown kind {kind}"))?,
        attempt: row.get("attempt"),
        reason: row.get("reason"),
        error: row.get("error"),
        dropped_at: millis_to_datetime(row.get("dropped_at_ms")),
    })
}
