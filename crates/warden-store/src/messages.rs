//! Message storage: one ordered `Vec<Message>` per conversation, mirrored to
//! a single JSON file. Message ids are a global monotonic counter — within
//! any one conversation that is trivially strictly increasing, which is all
//! spec §8's invariant requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;

use warden_domain::error::{Error, Result};
use warden_domain::model::Message;

pub struct MessageTable {
    path: PathBuf,
    by_conversation: RwLock<HashMap<String, Vec<Message>>>,
    next_id: AtomicI64,
}

impl MessageTable {
    pub fn load(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let path = dir.join("messages.json");
        let by_conversation: HashMap<String, Vec<Message>> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        let next_id = by_conversation
            .values()
            .flat_map(|v| v.iter().map(|m| m.id))
            .max()
            .map(|m| m + 1)
            .unwrap_or(1);
        Ok(Self {
            path,
            by_conversation: RwLock::new(by_conversation),
            next_id: AtomicI64::new(next_id),
        })
    }

    /// Append a message, assigning it the next global id. Returns the
    /// stored row.
    pub fn append(&self, conversation_id: &str, mut message: Message) -> Result<Message> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        message.id = id;
        message.conversation_id = conversation_id.to_string();
        {
            let mut map = self.by_conversation.write();
            map.entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
        }
        self.flush()?;
        Ok(message)
    }

    pub fn list(&self, conversation_id: &str) -> Vec<Message> {
        self.by_conversation
            .read()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Count of non-internal messages (used by the summarizer's "total"
    /// message count, spec §4.F).
    pub fn count(&self, conversation_id: &str) -> usize {
        self.by_conversation
            .read()
            .get(conversation_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Copy every message with `id <= up_to_message_id` into a new
    /// conversation id (used by `fork_conversation`).
    pub fn copy_up_to(&self, source: &str, target: &str, up_to_message_id: i64) -> Result<()> {
        let copied: Vec<Message> = {
            let map = self.by_conversation.read();
            map.get(source)
                .map(|rows| {
                    rows.iter()
                        .filter(|m| m.id <= up_to_message_id)
                        .map(|m| {
                            let mut copy = m.clone();
                            copy.conversation_id = target.to_string();
                            copy
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        {
            let mut map = self.by_conversation.write();
            map.insert(target.to_string(), copied);
        }
        self.flush()
    }

    /// Delete the target message and every later message in the same
    /// conversation (by `created_at`), per spec §4.A.
    pub fn delete_from(&self, conversation_id: &str, message_id: i64) -> Result<usize> {
        let removed = {
            let mut map = self.by_conversation.write();
            match map.get_mut(conversation_id) {
                Some(rows) => {
                    let cutoff = rows
                        .iter()
                        .find(|m| m.id == message_id)
                        .map(|m| m.created_at);
                    match cutoff {
                        Some(cutoff) => {
                            let before = rows.len();
                            rows.retain(|m| m.created_at < cutoff);
                            before - rows.len()
                        }
                        None => 0,
                    }
                }
                None => 0,
            }
        };
        if removed > 0 {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.by_conversation.write().remove(conversation_id);
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let map = self.by_conversation.read();
        let json = serde_json::to_string_pretty(&*map)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::model::Role;

    fn msg(content: &str) -> Message {
        Message {
            id: 0,
            conversation_id: String::new(),
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn ids_strictly_increasing_within_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let table = MessageTable::load(dir.path()).unwrap();
        let a = table.append("c1", msg("a")).unwrap();
        let b = table.append("c1", msg("b")).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn fork_copies_up_to_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let table = MessageTable::load(dir.path()).unwrap();
        let a = table.append("c1", msg("a")).unwrap();
        table.append("c1", msg("b")).unwrap();
        table.append("c1", msg("c")).unwrap();

        table.copy_up_to("c1", "fork1", a.id).unwrap();
        let forked = table.list("fork1");
        assert_eq!(forked.len(), 1);
        assert_eq!(forked[0].content.as_deref(), Some("a"));
        assert_eq!(forked[0].conversation_id, "fork1");
    }

    #[test]
    fn delete_from_removes_target_and_later() {
        let dir = tempfile::tempdir().unwrap();
        let table = MessageTable::load(dir.path()).unwrap();
        table.append("c1", msg("a")).unwrap();
        let b = table.append("c1", msg("b")).unwrap();
        table.append("c1", msg("c")).unwrap();

        let removed = table.delete_from("c1", b.id).unwrap();
        assert_eq!(removed, 2);
        let remaining = table.list("c1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content.as_deref(), Some("a"));
    }

    #[test]
    fn fork_then_delete_leaves_source_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let table = MessageTable::load(dir.path()).unwrap();
        table.append("c1", msg("a")).unwrap();
        let b = table.append("c1", msg("b")).unwrap();

        table.copy_up_to("c1", "fork1", b.id).unwrap();
        table.delete_conversation("fork1").unwrap();

        let source = table.list("c1");
        assert_eq!(source.len(), 2);
    }
}
