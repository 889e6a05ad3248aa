//! Dataset and column interning.
//!
//! Every replica in a sync group must share the same schema: the ids are what
//! travels on the wire and what the merkle trie hashes.

use crate::ids::{ColumnId, DatasetId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Schema construction and lookup failures.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Two datasets share an id or a name.
    #[error("duplicate dataset {0}")]
    DuplicateDataset(String),

    /// Two columns of one dataset share an id or a name.
    #[error("duplicate column {column} in dataset {dataset}")]
    DuplicateColumn {
        /// Dataset name.
        dataset: String,
        /// Column id or name.
        column: String,
    },

    /// No dataset with this name.
    #[error("unknown dataset {0:?}")]
    UnknownDataset(String),

    /// No column with this name in the dataset.
    #[error("unknown column {column:?} in dataset {dataset:?}")]
    UnknownColumn {
        /// Dataset name.
        dataset: String,
        /// Column name.
        column: String,
    },

    /// The JSON form could not be parsed.
    #[error("invalid schema document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Declaration of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Wire id, unique within the dataset.
    pub id: u16,
    /// Column name.
    pub name: String,
}

/// Declaration of one dataset and its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDef {
    /// Wire id, unique within the schema.
    pub id: u16,
    /// Dataset name.
    pub name: String,
    /// Columns in declaration order.
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
}

impl DatasetDef {
    /// Starts a dataset declaration.
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, id: u16, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef {
            id,
            name: name.into(),
        });
        self
    }
}

#[derive(Debug, Clone)]
struct DatasetEntry {
    name: Arc<str>,
    columns_by_name: HashMap<Arc<str>, ColumnId>,
    columns_by_id: HashMap<ColumnId, Arc<str>>,
}

/// Interning table between dataset/column names and their wire ids.
#[derive(Debug, Clone)]
pub struct Schema {
    defs: Vec<DatasetDef>,
    by_name: HashMap<Arc<str>, DatasetId>,
    by_id: HashMap<DatasetId, DatasetEntry>,
}

#[derive(Serialize, Deserialize)]
struct SchemaDoc {
    datasets: Vec<DatasetDef>,
}

impl Schema {
    /// Builds a schema from dataset declarations.
    ///
    /// # Errors
    ///
    /// Fails if dataset ids or names repeat, or column ids or names repeat
    /// within a dataset.
    pub fn new(defs: Vec<DatasetDef>) -> Result<Self, SchemaError> {
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        for def in &defs {
            let name: Arc<str> = Arc::from(def.name.as_str());
            let id = DatasetId(def.id);
            if by_name.insert(Arc::clone(&name), id).is_some() || by_id.contains_key(&id) {
                return Err(SchemaError::DuplicateDataset(def.name.clone()));
            }
            let mut entry = DatasetEntry {
                name,
                columns_by_name: HashMap::new(),
                columns_by_id: HashMap::new(),
            };
            for column in &def.columns {
                let column_name: Arc<str> = Arc::from(column.name.as_str());
                let column_id = ColumnId(column.id);
                let dup_name = entry
                    .columns_by_name
                    .insert(Arc::clone(&column_name), column_id)
                    .is_some();
                let dup_id = entry.columns_by_id.insert(column_id, column_name).is_some();
                if dup_name || dup_id {
                    return Err(SchemaError::DuplicateColumn {
                        dataset: def.name.clone(),
                        column: column.name.clone(),
                    });
                }
            }
            by_id.insert(id, entry);
        }
        Ok(Self {
            defs,
            by_name,
            by_id,
        })
    }

    /// Parses the JSON form `{"datasets": [{"id", "name", "columns": [...]}]}`.
    ///
    /// # Errors
    ///
    /// Fails on invalid JSON or duplicate ids or names.
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let doc: SchemaDoc = serde_json::from_str(text)?;
        Self::new(doc.datasets)
    }

    /// Serializes to the JSON form accepted by [`from_json`](Self::from_json).
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_json(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Dataset declarations in order.
    pub fn datasets(&self) -> &[DatasetDef] {
        &self.defs
    }

    /// Looks up a dataset id by name.
    pub fn dataset_id(&self, name: &str) -> Option<DatasetId> {
        self.by_name.get(name).copied()
    }

    /// Looks up a column id by dataset id and column name.
    pub fn column_id(&self, dataset: DatasetId, name: &str) -> Option<ColumnId> {
        self.by_id.get(&dataset)?.columns_by_name.get(name).copied()
    }

    /// Name of a dataset.
    pub fn dataset_name(&self, dataset: DatasetId) -> Option<&Arc<str>> {
        self.by_id.get(&dataset).map(|entry| &entry.name)
    }

    /// Name of a column.
    pub fn column_name(&self, dataset: DatasetId, column: ColumnId) -> Option<&Arc<str>> {
        self.by_id.get(&dataset)?.columns_by_id.get(&column)
    }

    /// Returns true if `dataset` exists.
    pub fn has_dataset(&self, dataset: DatasetId) -> bool {
        self.by_id.contains_key(&dataset)
    }

    /// Returns true if `column` exists within `dataset`.
    pub fn has_column(&self, dataset: DatasetId, column: ColumnId) -> bool {
        self.column_name(dataset, column).is_some()
    }

    /// Resolves a dataset name.
    ///
    /// # Errors
    ///
    /// [`SchemaError::UnknownDataset`] if it is not declared.
    pub fn resolve_dataset(&self, dataset: &str) -> Result<DatasetId, SchemaError> {
        self.dataset_id(dataset)
            .ok_or_else(|| SchemaError::UnknownDataset(dataset.to_owned()))
    }

    /// Resolves a `(dataset, column)` name pair.
    ///
    /// # Errors
    ///
    /// Fails if either name is not declared.
    pub fn resolve(&self, dataset: &str, column: &str) -> Result<(DatasetId, ColumnId), SchemaError> {
        let dataset_id = self.resolve_dataset(dataset)?;
        let column_id =
            self.column_id(dataset_id, column)
                .ok_or_else(|| SchemaError::UnknownColumn {
                    dataset: dataset.to_owned(),
                    column: column.to_owned(),
                })?;
        Ok((dataset_id, column_id))
    }
}

impl Serialize for Schema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SchemaDoc {
            datasets: self.defs.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = SchemaDoc::deserialize(deserializer)?;
        Schema::new(doc.datasets).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            DatasetDef::new(1, "transactions")
                .column(1, "amount")
                .column(2, "payee"),
            DatasetDef::new(2, "accounts").column(1, "name"),
        ])
        .unwrap()
    }

    #[test]
    fn resolves_names_both_ways() {
        let schema = schema();
        let (dataset, column) = schema.resolve("transactions", "payee").unwrap();
        assert_eq!(dataset, DatasetId(1));
        assert_eq!(column, ColumnId(2));
        assert_eq!(&**schema.dataset_name(dataset).unwrap(), "transactions");
        assert_eq!(&**schema.column_name(dataset, column).unwrap(), "payee");
    }

    #[test]
    fn column_ids_are_scoped_per_dataset() {
        let schema = schema();
        assert_eq!(
            schema.column_name(DatasetId(2), ColumnId(1)).map(|s| &**s),
            Some("name")
        );
        assert!(!schema.has_column(DatasetId(2), ColumnId(2)));
        assert!(schema.has_column(DatasetId(1), ColumnId(2)));
    }

    #[test]
    fn unknown_names_are_errors() {
        let schema = schema();
        assert!(matches!(
            schema.resolve("budgets", "amount"),
            Err(SchemaError::UnknownDataset(_))
        ));
        assert!(matches!(
            schema.resolve("accounts", "amount"),
            Err(SchemaError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn duplicates_are_rejected() {
        let dup_dataset = Schema::new(vec![DatasetDef::new(1, "a"), DatasetDef::new(1, "b")]);
        assert!(matches!(dup_dataset, Err(SchemaError::DuplicateDataset(_))));

        let dup_column = Schema::new(vec![DatasetDef::new(1, "a").column(1, "x").column(1, "y")]);
        assert!(matches!(dup_column, Err(SchemaError::DuplicateColumn { .. })));
    }

    #[test]
    fn json_round_trip() {
        let text = schema().to_json().unwrap();
        let parsed = Schema::from_json(&text).unwrap();
        assert_eq!(parsed.datasets(), schema().datasets());
        assert!(Schema::from_json("{\"datasets\": 3}").is_err());
    }
}
