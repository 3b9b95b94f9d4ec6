//! Table identity and the schema namespace tables register with.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::TableParams;
use crate::partition::update::ColumnId;
use crate::table::TableStore;

/// Stable identifier of a table within the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: ColumnId,
    pub name: String,
}

/// A secondary index definition: the indexed column, and the id of the
/// hidden table holding the index data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub column: ColumnId,
    pub index_table: TableId,
}

/// Everything the storage engine needs to know about a table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub keyspace: String,
    pub name: String,
    pub id: TableId,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    pub params: TableParams,
}

impl TableSchema {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>, id: TableId) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            id,
            columns: Vec::new(),
            indexes: Vec::new(),
            params: TableParams::default(),
        }
    }

    pub fn column(mut self, id: ColumnId, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef {
            id,
            name: name.into(),
        });
        self
    }

    pub fn index(mut self, name: impl Into<String>, column: ColumnId, index_table: TableId) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            column,
            index_table,
        });
        self
    }

    pub fn params(mut self, params: TableParams) -> Self {
        self.params = params;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.keyspace, self.name)
    }

    /// Directory component for this table under a data directory.
    pub fn dir_component(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }

    /// Schema-reproducing text dropped into snapshots.
    pub fn to_cql(&self) -> String {
        let mut out = format!("CREATE TABLE {} (\n", self.qualified_name());
        for col in &self.columns {
            out.push_str(&format!("    {} blob,\n", col.name));
        }
        out.push_str(");\n");
        for index in &self.indexes {
            if let Some(col) = self.columns.iter().find(|c| c.id == index.column) {
                out.push_str(&format!(
                    "CREATE INDEX {} ON {} ({});\n",
                    index.name,
                    self.qualified_name(),
                    col.name
                ));
            }
        }
        out
    }
}

/// The namespace table stores register with. Flush uses it to find index
/// tables; compaction uses it to walk every table.
pub struct Schema {
    tables: RwLock<HashMap<TableId, Arc<TableStore>>>,
}

impl Schema {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, table: Arc<TableStore>) {
        self.tables.write().unwrap().insert(table.id(), table);
    }

    pub fn unregister(&self, id: TableId) -> Option<Arc<TableStore>> {
        self.tables.write().unwrap().remove(&id)
    }

    pub fn table(&self, id: TableId) -> Option<Arc<TableStore>> {
        self.tables.read().unwrap().get(&id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<TableStore>> {
        self.tables.read().unwrap().values().cloned().collect()
    }

    /// Empties the namespace. Table stores hold the engine context, so the
    /// engine clears this on shutdown to break that ownership loop.
    pub fn clear(&self) {
        self.tables.write().unwrap().clear();
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_and_dir_names() {
        let schema = TableSchema::new("ks", "events", TableId(0x2a));
        assert_eq!(schema.qualified_name(), "ks.events");
        assert_eq!(schema.dir_component(), "events-0000002a");
    }

    #[test]
    fn test_to_cql_lists_columns_and_indexes() {
        let schema = TableSchema::new("ks", "events", TableId(1))
            .column(0, "payload")
            .column(1, "owner")
            .index("events_by_owner", 1, TableId(2));
        let cql = schema.to_cql();
        assert!(cql.contains("CREATE TABLE ks.events"));
        assert!(cql.contains("payload blob"));
        assert!(cql.contains("CREATE INDEX events_by_owner ON ks.events (owner)"));
    }
}
