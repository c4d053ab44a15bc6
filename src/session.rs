//! Conversation checkpoints keyed by thread id.
//!
//! A thread's entire state (the message history and the pending interrupt,
//! if any) is one checkpoint unit, so a suspended approval survives a
//! restart and the next inbound message resumes it instead of starting a
//! fresh turn.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::models::message::Message;

/// A question awaiting a human yes/no answer. At most one exists per
/// conversation; the tool call it refers to is the most recent requested
/// call in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub question: String,
}

/// Everything persisted for one conversation thread
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,
}

/// Checkpoint-style persistence for conversation threads
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>>;
    async fn put(&self, thread_id: &str, state: &ConversationState) -> Result<()>;
    async fn delete(&self, thread_id: &str) -> Result<()>;
}

/// In-process store, the default for tests and single-node deployments
#[derive(Default)]
pub struct MemoryStore {
    threads: Mutex<HashMap<String, ConversationState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let threads = self.threads.lock().unwrap();
        Ok(threads.get(thread_id).cloned())
    }

    async fn put(&self, thread_id: &str, state: &ConversationState) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        threads.insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        threads.remove(thread_id);
        Ok(())
    }
}

/// One JSON checkpoint file per thread under a sessions directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    /// ~/.config/teller/sessions
    pub fn default_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home_dir.join(".config").join("teller").join("sessions"))
    }

    fn thread_file(&self, thread_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", thread_id))
    }
}

#[async_trait]
impl ThreadStore for FileStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let path = self.thread_file(thread_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn put(&self, thread_id: &str, state: &ConversationState) -> Result<()> {
        let file = fs::File::create(self.thread_file(thread_id))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, state)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        let path = self.thread_file(thread_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_interrupt() -> ConversationState {
        ConversationState {
            messages: vec![
                Message::user().with_text("create a task"),
                Message::assistant().with_text("which customer?"),
            ],
            pending_interrupt: Some(PendingInterrupt {
                question: "Please confirm the following task: create_rm_task(customerId=5)".into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.get("rm_1").await?.is_none());

        let state = state_with_interrupt();
        store.put("rm_1", &state).await?;
        assert_eq!(store.get("rm_1").await?, Some(state));

        store.delete("rm_1").await?;
        assert!(store.get("rm_1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_round_trip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = FileStore::new(temp_dir.path().join("sessions"))?;

        let state = state_with_interrupt();
        store.put("rm_7", &state).await?;

        let loaded = store.get("rm_7").await?.expect("state should exist");
        assert_eq!(loaded, state);
        assert!(loaded.pending_interrupt.is_some());

        store.delete("rm_7").await?;
        assert!(store.get("rm_7").await?.is_none());
        // Deleting a missing thread is a no-op
        store.delete("rm_7").await?;
        Ok(())
    }
}
