use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Logical entity types synced between the local cache and the remote store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    LightWorkTasks,
    DeepWorkTasks,
    DailyRoutines,
    DailyReflections,
    WellnessTracking,
    TimeBlocks,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::LightWorkTasks,
        EntityType::DeepWorkTasks,
        EntityType::DailyRoutines,
        EntityType::DailyReflections,
        EntityType::WellnessTracking,
        EntityType::TimeBlocks,
    ];

    /// Name of the local object store holding records of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::LightWorkTasks => "lightWorkTasks",
            EntityType::DeepWorkTasks => "deepWorkTasks",
            EntityType::DailyRoutines => "dailyRoutines",
            EntityType::DailyReflections => "dailyReflections",
            EntityType::WellnessTracking => "wellnessTracking",
            EntityType::TimeBlocks => "timeBlocks",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == value)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confirmation state of an optimistic local write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Confirmed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Confirmed => "confirmed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SyncStatus::Pending),
            "confirmed" => Some(SyncStatus::Confirmed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ActionKind::Create),
            "update" => Some(ActionKind::Update),
            "delete" => Some(ActionKind::Delete),
            _ => None,
        }
    }
}

/// Lifecycle of a single queued action while the orchestrator handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Applying,
    Confirmed,
    FailedRetryable,
    FailedPermanent,
}

/// A day-scoped record owned by one user, e.g. a light-work task or a routine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub user_id: String,
    pub date: Option<NaiveDate>,
    /// Domain columns (title, completed, metadata, routine_type, ...).
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl EntityRecord {
    /// New pending record with a generated id, stamped with the current time.
    pub fn new(
        user_id: impl Into<String>,
        date: Option<NaiveDate>,
        fields: Map<String, Value>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            date,
            fields,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
        }
    }

    /// Flatten into the column layout of the remote table.
    pub fn to_remote_row(&self) -> Value {
        let mut row = self.fields.clone();
        row.insert("id".into(), json!(self.id));
        row.insert("user_id".into(), json!(self.user_id));
        if let Some(date) = self.date {
            row.insert("date".into(), json!(date.format("%Y-%m-%d").to_string()));
        }
        row.insert("created_at".into(), json!(self.created_at.to_rfc3339()));
        row.insert("updated_at".into(), json!(self.updated_at.to_rfc3339()));
        Value::Object(row)
    }

    /// Parse a remote row. Missing timestamps sort before any local write.
    pub fn from_remote_row(row: &Value) -> anyhow::Result<Self> {
        let Some(obj) = row.as_object() else {
            anyhow::bail!("remote row is not an object: {row}");
        };
        let mut fields = obj.clone();
        let id = take_string(&mut fields, "id")
            .ok_or_else(|| anyhow::anyhow!("remote row has no id"))?;
        let user_id = take_string(&mut fields, "user_id")
            .ok_or_else(|| anyhow::anyhow!("remote row {id} has no user_id"))?;
        let date = match take_string(&mut fields, "date") {
            Some(raw) => Some(parse_date(&raw)?),
            None => None,
        };
        let created_at = take_timestamp(&mut fields, "created_at")?;
        let updated_at = take_timestamp(&mut fields, "updated_at")?;
        let updated_at = updated_at.or(created_at).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(Self {
            id,
            user_id,
            date,
            fields,
            created_at: created_at.unwrap_or(updated_at),
            updated_at,
            sync_status: SyncStatus::Confirmed,
        })
    }

    /// Value of a column as it would appear in the remote row.
    pub fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(json!(self.id)),
            "user_id" => Some(json!(self.user_id)),
            "date" => self.date.map(|d| json!(d.format("%Y-%m-%d").to_string())),
            other => self.fields.get(other).filter(|v| !v.is_null()).cloned(),
        }
    }

    /// Equality on the fields a user can see: identity, day and domain
    /// columns. Timestamps, sync status and extra server columns are ignored.
    pub fn visible_eq(&self, other: &EntityRecord) -> bool {
        self.id == other.id
            && self.user_id == other.user_id
            && self.date == other.date
            && self
                .fields
                .iter()
                .all(|(k, v)| other.fields.get(k) == Some(v))
    }
}

/// A pending mutation recorded while offline or before server acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineAction {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: ActionKind,
    /// Fields for a create, the patch for an update, key columns for a delete.
    pub payload: Value,
    /// Remote row to apply (full row for create/update, key columns for delete).
    pub row: Value,
    pub created_at: DateTime<Utc>,
    pub attempt: i32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Action about to be enqueued; the queue assigns id, attempt and due time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: ActionKind,
    pub payload: Value,
    pub row: Value,
    pub created_at: DateTime<Utc>,
}

/// An action removed from the queue without being applied remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DroppedAction {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: ActionKind,
    pub attempt: i32,
    pub reason: String,
    pub error: String,
    pub dropped_at: DateTime<Utc>,
}

/// Current time truncated to the millisecond precision of local storage.
pub fn now_millis() -> DateTime<Utc> {
    millis_to_datetime(Utc::now().timestamp_millis())
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    // Remote `date` columns may come back as full timestamps.
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|err| anyhow::anyhow!("invalid date {raw:?}: {err}"))
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn take_timestamp(
    fields: &mut Map<String, Value>,
    key: &str,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    let Some(raw) = take_string(fields, key) else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(&raw)
        .map_err(|err| anyhow::anyhow!("invalid {key} {raw:?}: {err}"))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntityRecord {
        let mut fields = Map::new();
        fields.insert("title".into(), json!("Inbox zero"));
        fields.insert("completed".into(), json!(false));
        EntityRecord::new("user-1", NaiveDate::from_ymd_opt(2025, 3, 14), fields)
    }

    #[test]
    fn entity_store_names_round_trip() {
        for entity in EntityType::ALL {
            assert_eq!(EntityType::parse(entity.as_str()), Some(entity));
        }
        assert_eq!(EntityType::LightWorkTasks.as_str(), "lightWorkTasks");
        assert_eq!(EntityType::parse("offlineActions"), None);
    }

    #[test]
    fn remote_row_keeps_visible_fields() {
        let record = sample();
        let row = record.to_remote_row();
        assert_eq!(row["date"], json!("2025-03-14"));
        assert_eq!(row["user_id"], json!("user-1"));

        let parsed = EntityRecord::from_remote_row(&row).unwrap();
        assert!(record.visible_eq(&parsed));
        assert_eq!(parsed.updated_at, record.updated_at);
        assert_eq!(parsed.sync_status, SyncStatus::Confirmed);
    }

    #[test]
    fn remote_row_ignores_server_columns_for_visible_eq() {
        let record = sample();
        let mut row = record.to_remote_row();
        row["inserted_at"] = json!("2025-03-14T08:00:00+00:00");
        row["updated_at"] = json!("2030-01-01T00:00:00+00:00");
        let parsed = EntityRecord::from_remote_row(&row).unwrap();
        assert!(record.visible_eq(&parsed));
        assert_ne!(parsed.updated_at, record.updated_at);
    }

    #[test]
    fn remote_row_without_id_is_rejected() {
        let err = EntityRecord::from_remote_row(&json!({"user_id": "u"})).unwrap_err();
        assert!(err.to_string().contains("no id"));
    }

    #[test]
    fn timestamp_date_is_truncated_to_day() {
        let date = parse_date("2025-03-14T00:00:00+00:00").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
    }

    #[test]
    fn column_lookup_skips_nulls() {
        let mut record = sample();
        record.fields.insert("start_time".into(), Value::Null);
        assert_eq!(record.column("start_time"), None);
        assert_eq!(record.column("date"), Some(json!("2025-03-14")));
        assert_eq!(record.column("title"), Some(json!("Inbox zero")));
    }
}
