//! Materialized table shapes.
//!
//! When a model class is finalized its local fields are frozen into a
//! [`TableSchema`] and recorded in the process-wide [`SchemaCatalog`]. The
//! schema-creation routine reads tables back from the catalog.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use djorm_core::{DjormError, DjormResult};

use crate::fields::{Field, FieldType};

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Field type the column was built from.
    pub field_type: FieldType,
    /// Character length for text columns.
    pub max_length: Option<usize>,
    /// Primary key column.
    pub primary_key: bool,
    /// NULL allowed.
    pub null: bool,
    /// UNIQUE constraint.
    pub unique: bool,
    /// Index requested.
    pub db_index: bool,
    /// Referenced `(table, column)`; filled in when the target is known.
    pub references: Option<(String, String)>,
}

impl ColumnDef {
    /// Builds the column for a field. References are left unresolved.
    pub fn from_field(field: &Field) -> Self {
        Self {
            name: field.column.clone(),
            field_type: field.field_type.clone(),
            max_length: field.max_length,
            primary_key: field.primary_key,
            null: field.null,
            unique: field.is_unique(),
            db_index: field.db_index,
            references: None,
        }
    }

    /// Returns `true` if a separate index should be created.
    pub fn needs_index(&self) -> bool {
        (self.db_index || self.field_type.is_relation()) && !self.unique && !self.primary_key
    }
}

/// The frozen shape of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub table: String,
    /// Columns in field order.
    pub columns: Vec<ColumnDef>,
    /// Column groups that must be unique together.
    pub unique_together: Vec<Vec<String>>,
}

impl TableSchema {
    /// Returns the column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns the column with the given name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Process-wide record of every materialized table, keyed by table name.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    tables: RwLock<HashMap<String, (String, Arc<TableSchema>)>>,
}

impl SchemaCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `schema` as owned by the model `owner`.
    ///
    /// Recording the same owner again is a no-op that returns the frozen
    /// schema. A different model claiming the same table is an error.
    pub fn freeze(&self, owner: &str, schema: TableSchema) -> DjormResult<Arc<TableSchema>> {
        let mut tables = self
            .tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((existing_owner, existing)) = tables.get(&schema.table) {
            if existing_owner == owner {
                return Ok(Arc::clone(existing));
            }
            return Err(DjormError::ModelDeclaration(format!(
                "Table '{}' is already used by model {existing_owner}; {owner} cannot claim it.",
                schema.table
            )));
        }
        let schema = Arc::new(schema);
        tables.insert(schema.table.clone(), (owner.to_string(), Arc::clone(&schema)));
        Ok(schema)
    }

    /// Returns the schema of a table.
    pub fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(table)
            .map(|(_, schema)| Arc::clone(schema))
    }

    /// Returns the model label that owns a table.
    pub fn owner(&self, table: &str) -> Option<String> {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(table)
            .map(|(owner, _)| owner.clone())
    }

    /// Returns the number of recorded tables.
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
