// Redb-Backed Metadata Store
//
// Every key lives in a single redb table. Each public operation runs in its
// own write transaction, so a multi-key write either commits as a whole or
// leaves the store untouched.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use super::{KvError, MetaKv};

const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("meta_entries");

/// File name of the database inside a node's `meta_root_path`.
pub const DB_FILE_NAME: &str = "meta.redb";

/// Durable store persisted in a redb database file.
pub struct RedbKv {
    db: Database,
}

impl std::fmt::Debug for RedbKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbKv").finish_non_exhaustive()
    }
}

impl RedbKv {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // later read transactions fail on a table that was never created
        let txn = db.begin_write()?;
        {
            let _t = txn.open_table(ENTRIES)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    /// Open the store kept under a node's metadata root directory.
    pub fn open_in(root: impl AsRef<Path>) -> Result<Self, KvError> {
        Self::open(root.as_ref().join(DB_FILE_NAME))
    }

    fn write<F>(&self, f: F) -> Result<(), KvError>
    where
        F: FnOnce(&WriteTransaction) -> Result<(), KvError>,
    {
        let txn = self.db.begin_write()?;
        f(&txn)?;
        txn.commit()?;
        Ok(())
    }
}

fn keys_with_prefix<T: ReadableTable<&'static str, &'static str>>(
    table: &T,
    prefix: &str,
) -> Result<Vec<String>, KvError> {
    let mut keys = Vec::new();
    for entry in table.range(prefix..)? {
        let (key, _) = entry?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

impl MetaKv for RedbKv {
    fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.write(|txn| {
            let mut table = txn.open_table(ENTRIES)?;
            table.insert(key, value)?;
            Ok(())
        })
    }

    fn multi_put(&self, entries: &[(String, String)]) -> Result<(), KvError> {
        self.write(|txn| {
            let mut table = txn.open_table(ENTRIES)?;
            for (key, value) in entries {
                table.insert(key.as_str(), value.as_str())?;
            }
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_string()));
        }
        Ok(out)
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.write(|txn| {
            let mut table = txn.open_table(ENTRIES)?;
            table.remove(key)?;
            Ok(())
        })
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<(), KvError> {
        self.multi_remove(&[], &[prefix.to_string()])
    }

    fn multi_remove(&self, keys: &[String], prefixes: &[String]) -> Result<(), KvError> {
        self.write(|txn| {
            let mut table = txn.open_table(ENTRIES)?;
            for prefix in prefixes {
                for key in keys_with_prefix(&table, prefix)? {
                    table.remove(key.as_str())?;
                }
            }
            for key in keys {
                table.remove(key.as_str())?;
            }
            Ok(())
        })
    }
}
