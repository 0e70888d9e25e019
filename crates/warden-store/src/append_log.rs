//! Append-only log: bounded in-memory ring plus a JSONL file on disk.
//!
//! Grounded on the teacher's `gateway/runtime/runs.rs` `RunStore`/
//! `RunStoreInner`: a `VecDeque` ring bounded to `max_in_memory`, a
//! `base_seq`-offset index for O(1) lookup by id, and an append-only JSONL
//! file that gets pruned (rewritten) when the ring first exceeds its bound.
//! Used for `JobActivity`, `UsageLog`, `ScheduledJobRun`, and the tools
//! layer's `runs` shell-audit table — every table in §3 that is append-only
//! and queried by `id > since_id` or by simple filters.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use warden_domain::error::{Error, Result};

/// Implemented by every row type an `AppendLog` stores.
pub trait HasId {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

pub struct AppendLog<T> {
    inner: RwLock<VecDeque<T>>,
    next_id: AtomicI64,
    log_path: PathBuf,
    max_in_memory: usize,
}

impl<T> AppendLog<T>
where
    T: Clone + Serialize + DeserializeOwned + HasId,
{
    pub fn load(dir: &Path, file_name: &str, max_in_memory: usize) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let log_path = dir.join(file_name);

        let (rows, total_on_disk) = Self::load_recent(&log_path, max_in_memory);
        let next_id = rows.back().map(|r: &T| r.id() + 1).unwrap_or(1);

        if total_on_disk > rows.len() {
            Self::rewrite(&log_path, &rows);
        }

        Ok(Self {
            inner: RwLock::new(rows),
            next_id: AtomicI64::new(next_id),
            log_path,
            max_in_memory,
        })
    }

    fn load_recent(path: &Path, max_in_memory: usize) -> (VecDeque<T>, usize) {
        let mut rows = VecDeque::new();
        let mut total = 0;
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            total = lines.len();
            for line in lines.iter().rev().take(max_in_memory) {
                if let Ok(row) = serde_json::from_str::<T>(line) {
                    rows.push_front(row);
                }
            }
        }
        (rows, total)
    }

    fn rewrite(path: &Path, rows: &VecDeque<T>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for row in rows {
                match serde_json::to_string(row) {
                    Ok(json) if writeln!(f, "{json}").is_ok() => {}
                    _ => {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    /// Assign the next id, append to the in-memory ring, persist, and
    /// evict the oldest row if the ring is now over bound.
    pub fn append(&self, mut row: T) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        row.set_id(id);

        self.persist(&row)?;

        let mut inner = self.inner.write();
        inner.push_back(row);
        if inner.len() > self.max_in_memory {
            inner.pop_front();
        }
        Ok(id)
    }

    fn persist(&self, row: &T) -> Result<()> {
        let json = serde_json::to_string(row)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)?;
        Ok(())
    }

    /// Rows with `id > since_id`, in insertion order.
    pub fn since(&self, since_id: i64) -> Vec<T> {
        self.inner
            .read()
            .iter()
            .filter(|r| r.id() > since_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<T> {
        self.inner.read().iter().cloned().collect()
    }

    pub fn filter<F>(&self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.inner
            .read()
            .iter()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Row {
        id: i64,
        value: String,
    }

    impl HasId for Row {
        fn id(&self) -> i64 {
            self.id
        }
        fn set_id(&mut self, id: i64) {
            self.id = id;
        }
    }

    #[test]
    fn ids_assigned_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log: AppendLog<Row> = AppendLog::load(dir.path(), "rows.jsonl", 100).unwrap();
        let a = log
            .append(Row {
                id: 0,
                value: "a".into(),
            })
            .unwrap();
        let b = log
            .append(Row {
                id: 0,
                value: "b".into(),
            })
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn since_filters_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let log: AppendLog<Row> = AppendLog::load(dir.path(), "rows.jsonl", 100).unwrap();
        for v in ["a", "b", "c"] {
            log.append(Row {
                id: 0,
                value: v.into(),
            })
            .unwrap();
        }
        let tail = log.since(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].value, "b");
    }

    #[test]
    fn bounded_ring_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log: AppendLog<Row> = AppendLog::load(dir.path(), "rows.jsonl", 3).unwrap();
        for i in 0..5 {
            log.append(Row {
                id: 0,
                value: format!("v{i}"),
            })
            .unwrap();
        }
        assert_eq!(log.all().len(), 3);
        assert_eq!(log.all()[0].value, "v2");
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log: AppendLog<Row> = AppendLog::load(dir.path(), "rows.jsonl", 100).unwrap();
            log.append(Row {
                id: 0,
                value: "a".into(),
            })
            .unwrap();
        }
        let log2: AppendLog<Row> = AppendLog::load(dir.path(), "rows.jsonl", 100).unwrap();
        assert_eq!(log2.all().len(), 1);
        assert_eq!(log2.all()[0].value, "a");
    }
}
