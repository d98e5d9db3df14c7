#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use lifelock_sync::db::{self, LocalCache};
use lifelock_sync::error::RemoteError;
use lifelock_sync::model::EntityRecord;
use lifelock_sync::orchestrator::{Orchestrator, SyncPolicy};
use lifelock_sync::remote::{Filter, RemoteStore};
use lifelock_sync::store::OfflineStore;
use lifelock_sync::sync_map::{SchemaConstraints, SyncTableMap};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub table: String,
    pub row: Value,
}

#[derive(Default)]
struct Table {
    unique: Vec<BTreeSet<String>>,
    rows: Vec<Map<String, Value>>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    scripted: VecDeque<RemoteError>,
    denied: HashSet<String>,
    calls: Vec<Call>,
}

/// In-process row store enforcing UNIQUE constraints like Postgres does.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn with_schema(schema: &SchemaConstraints) -> Self {
        let mut state = State::default();
        for (name, constraints) in &schema.tables {
            let mut unique = vec![constraints.primary_key.iter().cloned().collect()];
            unique.extend(constraints.unique.iter().map(|u| u.iter().cloned().collect()));
            state.tables.insert(
                name.clone(),
                Table {
                    unique,
                    rows: Vec::new(),
                },
            );
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn lifelock() -> Self {
        Self::with_schema(&SchemaConstraints::lifelock())
    }

    /// Errors returned, in order, by the next calls.
    pub async fn fail_next(&self, errors: Vec<RemoteError>) {
        self.state.lock().await.scripted.extend(errors);
    }

    /// Answer every call on `table` with a row-level-security denial.
    pub async fn deny(&self, table: &str) {
        self.state.lock().await.denied.insert(table.to_string());
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        let state = self.state.lock().await;
        state.tables[table]
            .rows
            .iter()
            .cloned()
            .map(Value::Object)
            .collect()
    }

    pub async fn insert_row(&self, table: &str, row: Value) {
        let mut state = self.state.lock().await;
        let obj = row.as_object().unwrap().clone();
        state.tables.get_mut(table).unwrap().rows.push(obj);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    fn precheck(
        state: &mut State,
        op: &'static str,
        table: &str,
        row: &Value,
    ) -> Result<(), RemoteError> {
        state.calls.push(Call {
            op,
            table: table.to_string(),
            row: row.clone(),
        });
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if state.denied.contains(table) {
            return Err(RemoteError::from_response(
                table,
                403,
                Some("42501"),
                format!("new row violates row-level security policy for table \"{table}\""),
            ));
        }
        if !state.tables.contains_key(table) {
            let message = "relation does not exist".to_string();
            return Err(RemoteError::from_response(table, 404, Some("42P01"), message));
        }
        Ok(())
    }
}

fn same(row: &Map<String, Value>, other: &Map<String, Value>, cols: &BTreeSet<String>) -> bool {
    cols.iter().all(|c| match (row.get(c), other.get(c)) {
        (Some(a), Some(b)) => !a.is_null() && a == b,
        _ => false,
    })
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(
        &self,
        table: &str,
        row: &Value,
        conflict_key: &[&str],
    ) -> Result<Value, RemoteError> {
        let mut state = self.state.lock().await;
        Self::precheck(&mut state, "upsert", table, row)?;
        let t = state.tables.get_mut(table).unwrap();
        let key: BTreeSet<String> = conflict_key.iter().map(|c| c.to_string()).collect();
        if !t.unique.contains(&key) {
            return Err(RemoteError::from_response(
                table,
                400,
                Some("42P10"),
                "there is no unique or exclusion constraint matching the ON CONFLICT specification"
                    .into(),
            ));
        }
        let incoming = row.as_object().cloned().unwrap_or_default();
        let existing = t.rows.iter().position(|r| same(r, &incoming, &key));
        let mut merged = match existing {
            Some(pos) => t.rows[pos].clone(),
            None => Map::new(),
        };
        merged.extend(incoming);
        for unique in &t.unique {
            let clash = t
                .rows
                .iter()
                .enumerate()
                .any(|(i, r)| Some(i) != existing && same(r, &merged, unique));
            if clash {
                return Err(RemoteError::from_response(
                    table,
                    409,
                    Some("23505"),
                    "duplicate key value violates unique constraint".into(),
                ));
            }
        }
        match existing {
            Some(pos) => t.rows[pos] = merged.clone(),
            None => t.rows.push(merged.clone()),
        }
        Ok(Value::Object(merged))
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError> {
        let mut state = self.state.lock().await;
        let rendered = json!(filters.iter().map(|f| f.to_string()).collect::<Vec<_>>());
        Self::precheck(&mut state, "select", table, &rendered)?;
        Ok(state.tables[table]
            .rows
            .iter()
            .cloned()
            .map(Value::Object)
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .collect())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        let rendered = json!(filters.iter().map(|f| f.to_string()).collect::<Vec<_>>());
        Self::precheck(&mut state, "delete", table, &rendered)?;
        let t = state.tables.get_mut(table).unwrap();
        t.rows.retain(|r| {
            let row = Value::Object(r.clone());
            !filters.iter().all(|f| f.matches(&row))
        });
        Ok(())
    }
}

pub struct Harness {
    pub store: OfflineStore,
    pub orchestrator: Orchestrator,
    pub remote: Arc<MemoryRemote>,
}

pub fn policy() -> SyncPolicy {
    SyncPolicy {
        max_attempts: 3,
        max_backoff_secs: 60,
        poll_interval: Duration::from_secs(3600),
    }
}

pub async fn harness() -> Harness {
    device(Arc::new(MemoryRemote::lifelock())).await
}

/// A fresh local store and orchestrator talking to `remote`, like a second
/// device signed in to the same account.
pub async fn device(remote: Arc<MemoryRemote>) -> Harness {
    let pool = db::memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let cache = LocalCache::new(pool);
    let map = SyncTableMap::default();
    let orchestrator = Orchestrator::new(
        cache.clone(),
        remote.clone(),
        map.clone(),
        &SchemaConstraints::lifelock(),
        policy(),
    )
    .unwrap();
    Harness {
        store: OfflineStore::new(cache, map),
        orchestrator,
        remote,
    }
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 4, d).unwrap()
}

pub fn record(user: &str, date: u32, fields: Value) -> EntityRecord {
    EntityRecord::new(user, Some(day(date)), fields.as_object().unwrap().clone())
}
