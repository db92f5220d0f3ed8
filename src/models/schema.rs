//! Schema snapshot and drift models.
//!
//! A [`SchemaSnapshot`] is what a fetcher saw at one point in time. Two
//! snapshots of the same chat produce a [`SchemaDiff`] at table and column
//! granularity.

use crate::models::DatabaseType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Database-specific type, e.g. `integer`, `varchar(255)`, `TEXT`
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// A table, or a collection for document stores (no columns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// SHA-256 over the table name and ordered column definitions.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for column in &self.columns {
            hasher.update([0u8]);
            hasher.update(column.name.as_bytes());
            hasher.update([1u8]);
            hasher.update(column.data_type.as_bytes());
            hasher.update([column.nullable as u8]);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub db_type: DatabaseType,
    pub tables: BTreeMap<String, TableDefinition>,
    pub captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(db_type: DatabaseType, tables: impl IntoIterator<Item = TableDefinition>) -> Self {
        Self {
            db_type,
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            captured_at: Utc::now(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(name)
    }

    /// Checksum of the whole snapshot, stable across capture times.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for table in self.tables.values() {
            hasher.update(table.checksum().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Keep only the selected tables.
    pub fn filtered(mut self, selected: &SelectedCollections) -> Self {
        if let SelectedCollections::Only(names) = selected {
            self.tables.retain(|name, _| names.contains(name));
        }
        self
    }
}

/// Which tables a chat wants tracked: `"ALL"` or a comma-separated list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SelectedCollections {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl SelectedCollections {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Self::All;
        }
        let names: BTreeSet<String> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Only(names)
        }
    }

    pub fn includes(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(table),
        }
    }
}

impl std::fmt::Display for SelectedCollections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("ALL"),
            Self::Only(names) => {
                let joined: Vec<&str> = names.iter().map(String::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub column: String,
    pub old_type: String,
    pub new_type: String,
    pub old_nullable: bool,
    pub new_nullable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    pub added_columns: Vec<ColumnDefinition>,
    pub removed_columns: Vec<String>,
    pub modified_columns: Vec<ColumnChange>,
}

impl TableChange {
    fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.modified_columns.is_empty()
    }
}

/// Schema drift between two snapshots of the same chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added_tables: Vec<TableDefinition>,
    pub removed_tables: Vec<String>,
    pub modified_tables: Vec<TableChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SchemaDiff {
    pub fn between(old: &SchemaSnapshot, new: &SchemaSnapshot) -> Self {
        let mut diff = SchemaDiff {
            checksum: Some(new.checksum()),
            ..Default::default()
        };

        for (name, table) in &new.tables {
            match old.tables.get(name) {
                None => diff.added_tables.push(table.clone()),
                Some(previous) if previous.checksum() != table.checksum() => {
                    let change = diff_table(previous, table);
                    if !change.is_empty() {
                        diff.modified_tables.push(change);
                    }
                }
                Some(_) => {}
            }
        }
        diff.removed_tables = old
            .tables
            .keys()
            .filter(|name| !new.tables.contains_key(*name))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.modified_tables.is_empty()
    }
}

fn diff_table(old: &TableDefinition, new: &TableDefinition) -> TableChange {
    let mut change = TableChange {
        table: new.name.clone(),
        ..Default::default()
    };
    for column in &new.columns {
        match old.column(&column.name) {
            None => change.added_columns.push(column.clone()),
            Some(previous)
                if previous.data_type != column.data_type || previous.nullable != column.nullable =>
            {
                change.modified_columns.push(ColumnChange {
                    column: column.name.clone(),
                    old_type: previous.data_type.clone(),
                    new_type: column.data_type.clone(),
                    old_nullable: previous.nullable,
                    new_nullable: column.nullable,
                });
            }
            Some(_) => {}
        }
    }
    change.removed_columns = old
        .columns
        .iter()
        .filter(|c| new.column(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect();
    change
}
