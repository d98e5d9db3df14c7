//! Static mapping from entity types to remote tables and their upsert keys.
//!
//! The conflict key of every entry must equal the column set the remote
//! database enforces uniqueness on. A mismatch either duplicates rows on every
//! sync or overwrites the wrong row, so [`SyncTableMap::validate`] checks the
//! map against the declared schema before any action is applied.

use crate::model::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTableEntry {
    pub table: &'static str,
    pub primary_key: &'static str,
    pub on_conflict: Option<&'static [&'static str]>,
}

impl SyncTableEntry {
    pub const fn by_id(table: &'static str) -> Self {
        Self {
            table,
            primary_key: "id",
            on_conflict: None,
        }
    }

    pub const fn composite(table: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            primary_key: "id",
            on_conflict: Some(columns),
        }
    }

    /// `on_conflict` when declared, otherwise the primary key.
    pub fn effective_conflict_key(&self) -> Vec<&'static str> {
        match self.on_conflict {
            Some(cols) => cols.to_vec(),
            None => vec![self.primary_key],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTableMap {
    entries: BTreeMap<EntityType, SyncTableEntry>,
}

impl Default for SyncTableMap {
    fn default() -> Self {
        let entries = EntityType::ALL
            .into_iter()
            .map(|entity| (entity, default_entry(entity)))
            .collect();
        Self { entries }
    }
}

fn default_entry(entity: EntityType) -> SyncTableEntry {
    match entity {
        EntityType::LightWorkTasks => SyncTableEntry::by_id("light_work_tasks"),
        EntityType::DeepWorkTasks => SyncTableEntry::by_id("deep_work_tasks"),
        EntityType::DailyRoutines => {
            SyncTableEntry::composite("daily_routines", &["user_id", "date", "routine_type"])
        }
        EntityType::DailyReflections => {
            SyncTableEntry::composite("daily_reflections", &["user_id", "date"])
        }
        EntityType::WellnessTracking => {
            SyncTableEntry::composite("wellness_tracking", &["user_id", "date"])
        }
        EntityType::TimeBlocks => {
            SyncTableEntry::composite("time_blocks", &["user_id", "date", "start_time"])
        }
    }
}

impl SyncTableMap {
    pub fn resolve(&self, entity: EntityType) -> &SyncTableEntry {
        // Every variant is inserted by `default` and `with_entry` only replaces.
        &self.entries[&entity]
    }

    pub fn with_entry(mut self, entity: EntityType, entry: SyncTableEntry) -> Self {
        self.entries.insert(entity, entry);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityType, &SyncTableEntry)> {
        self.entries.iter().map(|(e, entry)| (*e, entry))
    }

    /// Compare every effective conflict key against the remote schema.
    pub fn validate(&self, schema: &SchemaConstraints) -> Result<(), Vec<ConflictKeyMismatch>> {
        let mismatches: Vec<_> = self
            .iter()
            .filter_map(|(entity, entry)| {
                let configured = column_set(entry.effective_conflict_key());
                let Some(table) = schema.tables.get(entry.table) else {
                    return Some(ConflictKeyMismatch {
                        entity,
                        table: entry.table.to_string(),
                        configured,
                        expected: None,
                    });
                };
                let expected = table.upsert_key();
                (configured != expected).then(|| ConflictKeyMismatch {
                    entity,
                    table: entry.table.to_string(),
                    configured,
                    expected: Some(expected),
                })
            })
            .collect();
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(mismatches)
        }
    }
}

/// Uniqueness constraints of one remote table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConstraints {
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
}

impl TableConstraints {
    /// The column set an upsert must target: the composite UNIQUE constraint
    /// when the table has one, otherwise the primary key.
    pub fn upsert_key(&self) -> BTreeSet<String> {
        self.unique
            .iter()
            .find(|cols| cols.len() > 1)
            .unwrap_or(&self.primary_key)
            .iter()
            .cloned()
            .collect()
    }
}

/// Declared uniqueness constraints of the remote database, keyed by table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SchemaConstraints {
    pub tables: BTreeMap<String, TableConstraints>,
}

impl SchemaConstraints {
    /// The LifeLock production schema.
    pub fn lifelock() -> Self {
        let mut schema = Self::default();
        schema.insert("light_work_tasks", &[]);
        schema.insert("deep_work_tasks", &[]);
        schema.insert("daily_routines", &["user_id", "date", "routine_type"]);
        schema.insert("daily_reflections", &["user_id", "date"]);
        schema.insert("wellness_tracking", &["user_id", "date"]);
        schema.insert("time_blocks", &["user_id", "date", "start_time"]);
        schema
    }

    pub fn insert(&mut self, table: &str, unique: &[&str]) {
        let unique = if unique.is_empty() {
            Vec::new()
        } else {
            vec![unique.iter().map(|c| c.to_string()).collect()]
        };
        self.tables.insert(
            table.to_string(),
            TableConstraints {
                primary_key: vec!["id".to_string()],
                unique,
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictKeyMismatch {
    pub entity: EntityType,
    pub table: String,
    pub configured: BTreeSet<String>,
    /// `None` when the table is missing from the schema.
    pub expected: Option<BTreeSet<String>>,
}

impl fmt::Display for ConflictKeyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let configured = join(&self.configured);
        match &self.expected {
            Some(expected) => write!(
                f,
                "{} ({}): on_conflict ({}) does not match unique constraint ({})",
                self.entity,
                self.table,
                configured,
                join(expected)
            ),
            None => write!(
                f,
                "{} ({}): table not declared in schema (on_conflict {})",
                self.entity, self.table, configured
            ),
        }
    }
}

fn column_set(cols: Vec<&str>) -> BTreeSet<String> {
    cols.into_iter().map(str::to_string).collect()
}

fn join(cols: &BTreeSet<String>) -> String {
    cols.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
