use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::key::PartitionKey;
use super::update::PartitionUpdate;
use crate::error::{Error, Result};
use crate::schema::TableId;

/// A bundle of partition updates sharing one partition key, at most one per
/// table. This is the unit the write path accepts and the commit log
/// records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    keyspace: String,
    key: PartitionKey,
    updates: BTreeMap<TableId, PartitionUpdate>,
}

impl Mutation {
    pub fn new(keyspace: impl Into<String>, key: PartitionKey) -> Self {
        Self {
            keyspace: keyspace.into(),
            key,
            updates: BTreeMap::new(),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Adds an update. The update must target this mutation's partition key,
    /// and a table may appear at most once.
    pub fn add(&mut self, update: PartitionUpdate) -> Result<()> {
        if update.key() != &self.key {
            return Err(Error::InvalidRequest(format!(
                "update key {:?} does not match mutation key {:?}",
                update.key(),
                self.key
            )));
        }
        let table_id = update.table_id();
        if self.updates.contains_key(&table_id) {
            return Err(Error::InvalidRequest(format!(
                "mutation already carries an update for table {table_id:?}"
            )));
        }
        self.updates.insert(table_id, update);
        Ok(())
    }

    pub fn with(mut self, update: PartitionUpdate) -> Result<Self> {
        self.add(update)?;
        Ok(self)
    }

    pub fn update_for(&self, table: TableId) -> Option<&PartitionUpdate> {
        self.updates.get(&table)
    }

    pub fn updates(&self) -> impl Iterator<Item = &PartitionUpdate> {
        self.updates.values()
    }

    pub fn table_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.updates.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Size contribution when appended to the commit log.
    pub fn serialized_size(&self) -> usize {
        self.keyspace.len()
            + self.key.serialized_size()
            + self
                .updates
                .values()
                .map(PartitionUpdate::serialized_size)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::clustering::Clustering;
    use crate::partition::key::HashPartitioner;
    use crate::partition::update::{Cell, Row};

    fn key(raw: &[u8]) -> PartitionKey {
        PartitionKey::new(&HashPartitioner, raw.to_vec())
    }

    fn update(table: TableId, k: &PartitionKey) -> PartitionUpdate {
        let mut u = PartitionUpdate::new(table, k.clone());
        u.add_row(Row::new(Clustering::row(vec![b"c".to_vec()])).cell(0, Cell::live(1, b"v".to_vec())));
        u
    }

    #[test]
    fn test_one_update_per_table() {
        let k = key(b"pk");
        let mut mutation = Mutation::new("ks", k.clone());
        mutation.add(update(TableId(1), &k)).unwrap();

        let err = mutation.add(update(TableId(1), &k));
        assert!(matches!(err, Err(Error::InvalidRequest(_))));

        mutation.add(update(TableId(2), &k)).unwrap();
        assert_eq!(mutation.table_ids().count(), 2);
    }

    #[test]
    fn test_key_must_match() {
        let mut mutation = Mutation::new("ks", key(b"pk1"));
        let err = mutation.add(update(TableId(1), &key(b"pk2")));
        assert!(matches!(err, Err(Error::InvalidRequest(_))));
    }
}
