//! A HashMap-backed table mirrored to a single JSON file on every mutation.
//!
//! Grounded on the teacher's `sessions/store.rs` `SessionStore`: load once at
//! startup, keep the live copy behind a `RwLock`, rewrite the whole file on
//! `flush`. Fine for the row counts this store expects (conversations, jobs,
//! scheduled jobs, agent-context rows) — none of these grow unbounded the way
//! messages or activities do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use warden_domain::error::{Error, Result};

pub struct JsonTable<T> {
    path: PathBuf,
    rows: RwLock<HashMap<String, T>>,
}

impl<T> JsonTable<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn load(dir: &Path, file_name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let path = dir.join(file_name);
        let rows = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.rows.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.rows.read().values().cloned().collect()
    }

    /// Insert or replace a row and flush to disk. Caller already holds the
    /// store's write lock.
    pub fn put(&self, id: String, row: T) -> Result<()> {
        self.rows.write().insert(id, row);
        self.flush()
    }

    pub fn remove(&self, id: &str) -> Result<Option<T>> {
        let removed = self.rows.write().remove(id);
        self.flush()?;
        Ok(removed)
    }

    /// Mutate a row in place if present, then flush. Returns whether a row
    /// was found.
    pub fn update<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut T),
    {
        let found = {
            let mut rows = self.rows.write();
            match rows.get_mut(id) {
                Some(row) => {
                    f(row);
                    true
                }
                None => false,
            }
        };
        if found {
            self.flush()?;
        }
        Ok(found)
    }

    fn flush(&self) -> Result<()> {
        let rows = self.rows.read();
        let json = serde_json::to_string_pretty(&*rows)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        name: String,
    }

    #[test]
    fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let table: JsonTable<Row> = JsonTable::load(dir.path(), "rows.json").unwrap();
        table
            .put(
                "a".into(),
                Row {
                    name: "alpha".into(),
                },
            )
            .unwrap();
        assert_eq!(table.get("a").unwrap().name, "alpha");
    }

    #[test]
    fn reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table: JsonTable<Row> = JsonTable::load(dir.path(), "rows.json").unwrap();
            table
                .put(
                    "a".into(),
                    Row {
                        name: "alpha".into(),
                    },
                )
                .unwrap();
        }
        let table2: JsonTable<Row> = JsonTable::load(dir.path(), "rows.json").unwrap();
        assert_eq!(table2.get("a").unwrap().name, "alpha");
    }

    #[test]
    fn update_missing_row_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let table: JsonTable<Row> = JsonTable::load(dir.path(), "rows.json").unwrap();
        let found = table.update("missing", |r| r.name = "x".into()).unwrap();
        assert!(!found);
    }

    #[test]
    fn remove_row() {
        let dir = tempfile::tempdir().unwrap();
        let table: JsonTable<Row> = JsonTable::load(dir.path(), "rows.json").unwrap();
        table
            .put(
                "a".into(),
                Row {
                    name: "alpha".into(),
                },
            )
            .unwrap();
        let removed = table.remove("a").unwrap();
        assert!(removed.is_some());
        assert!(table.get("a").is_none());
    }
}
