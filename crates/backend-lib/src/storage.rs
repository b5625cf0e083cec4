// ============================
// pairchat-backend-lib/src/storage.rs
// ============================
//! Record store abstraction with flat-file and in-memory implementations.
//!
//! The store keeps two things: which room an identity is assigned to, and a
//! best-effort transcript per room. Both survive reconnects and process
//! restarts; neither is consulted on the hot relay path.
use std::collections::HashMap;
use std::{
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};

use pairchat_common::{CipherPayload, Identity};

use crate::error::ChatError;

/// One saved room message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub from: Identity,
    pub time: DateTime<Utc>,
    pub message: CipherPayload,
}

/// Trait for record store backends
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// The room this identity was last assigned to, if any.
    async fn assigned_room(&self, identity: &str) -> Result<Option<String>, ChatError>;

    /// Record (or clear, with `None`) an identity's room assignment.
    async fn set_assigned_room(
        &self,
        identity: &str,
        room: Option<&str>,
    ) -> Result<(), ChatError>;

    /// Append one entry to a room transcript.
    async fn append_to_transcript(
        &self,
        room: &str,
        entry: &TranscriptEntry,
    ) -> Result<(), ChatError>;

    /// Read a room transcript, oldest first.
    async fn room_transcript(&self, room: &str) -> Result<Vec<TranscriptEntry>, ChatError>;

    /// Delete a room record and its transcript.
    async fn delete_room(&self, room: &str) -> Result<(), ChatError>;
}

/// Flat-file implementation of the RecordStore trait
#[derive(Clone)]
pub struct FlatFileStore {
    root: PathBuf,
}

impl FlatFileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, ChatError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("identities"))?;
        fs::create_dir_all(root.join("rooms"))?;
        Ok(Self { root })
    }

    fn assignment_path(&self, identity: &str) -> PathBuf {
        // identities are base64 fingerprints or user ids; '/' is the only
        // character that would escape the directory
        let safe = identity.replace('/', "_");
        self.root.join("identities").join(safe)
    }

    fn transcript_path(&self, room: &str) -> PathBuf {
        self.root.join("rooms").join(room).join("transcript.log")
    }
}

#[async_trait]
impl RecordStore for FlatFileStore {
    async fn assigned_room(&self, identity: &str) -> Result<Option<String>, ChatError> {
        let path = self.assignment_path(identity);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio_fs::read_to_string(&path)
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        let room = content.trim();
        if room.is_empty() {
            return Ok(None);
        }
        Ok(Some(room.to_string()))
    }

    async fn set_assigned_room(
        &self,
        identity: &str,
        room: Option<&str>,
    ) -> Result<(), ChatError> {
        let path = self.assignment_path(identity);
        match room {
            Some(room) => tokio_fs::write(&path, room)
                .await
                .map_err(|e| ChatError::Persistence(e.to_string())),
            None => match tokio_fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ChatError::Persistence(e.to_string())),
            },
        }
    }

    /// Append a JSON line to `transcript.log`.
    async fn append_to_transcript(
        &self,
        room: &str,
        entry: &TranscriptEntry,
    ) -> Result<(), ChatError> {
        let path = self.transcript_path(room);
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent)
                .await
                .map_err(|e| ChatError::Persistence(e.to_string()))?;
        }

        let json_line =
            serde_json::to_string(entry).map_err(|e| ChatError::Persistence(e.to_string()))?;

        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;

        file.write_all(json_line.as_bytes())
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn room_transcript(&self, room: &str) -> Result<Vec<TranscriptEntry>, ChatError> {
        let path = self.transcript_path(room);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio_fs::read_to_string(&path)
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;

        let mut entries = Vec::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            let entry = serde_json::from_str(line)
                .map_err(|e| ChatError::Persistence(format!("corrupt transcript line: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn delete_room(&self, room: &str) -> Result<(), ChatError> {
        let dir = self.root.join("rooms").join(room);
        match tokio_fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatError::Persistence(e.to_string())),
        }
    }
}

/// In-memory store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    fail_appends: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct MemoryStoreInner {
    assignments: HashMap<Identity, String>,
    transcripts: HashMap<String, Vec<TranscriptEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append_to_transcript` fail, to exercise the
    /// delivered-but-not-saved path.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    /// True if the store still holds any record of this room.
    pub fn has_room(&self, room: &str) -> bool {
        self.inner.lock().transcripts.contains_key(room)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn assigned_room(&self, identity: &str) -> Result<Option<String>, ChatError> {
        Ok(self.inner.lock().assignments.get(identity).cloned())
    }

    async fn set_assigned_room(
        &self,
        identity: &str,
        room: Option<&str>,
    ) -> Result<(), ChatError> {
        let mut inner = self.inner.lock();
        match room {
            Some(room) => {
                inner.assignments.insert(identity.to_string(), room.to_string());
            }
            None => {
                inner.assignments.remove(identity);
            }
        }
        Ok(())
    }

    async fn append_to_transcript(
        &self,
        room: &str,
        entry: &TranscriptEntry,
    ) -> Result<(), ChatError> {
        if self.fail_appends.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ChatError::Persistence("append disabled".to_string()));
        }
        self.inner
            .lock()
            .transcripts
            .entry(room.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn room_transcript(&self, room: &str) -> Result<Vec<TranscriptEntry>, ChatError> {
        Ok(self
            .inner
            .lock()
            .transcripts
            .get(room)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_room(&self, room: &str) -> Result<(), ChatError> {
        self.inner.lock().transcripts.remove(room);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(from: &str, data: &str) -> TranscriptEntry {
        TranscriptEntry {
            from: from.to_string(),
            time: Utc::now(),
            message: CipherPayload {
                data: data.to_string(),
                salt: "s".to_string(),
                iv: "i".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_assignment_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        assert_eq!(store.assigned_room("u1").await.unwrap(), None);

        store.set_assigned_room("u1", Some("r1")).await.unwrap();
        assert_eq!(
            store.assigned_room("u1").await.unwrap(),
            Some("r1".to_string())
        );

        store.set_assigned_room("u1", None).await.unwrap();
        assert_eq!(store.assigned_room("u1").await.unwrap(), None);

        // clearing an identity that was never assigned is a no-op
        store.set_assigned_room("u2", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_transcript_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        let first = entry("u1", "m1");
        let second = entry("u2", "m2");
        store.append_to_transcript("r1", &first).await.unwrap();
        store.append_to_transcript("r1", &second).await.unwrap();

        let transcript = store.room_transcript("r1").await.unwrap();
        assert_eq!(transcript, vec![first, second]);

        assert!(store.room_transcript("r9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_room_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        store.append_to_transcript("r1", &entry("u1", "m1")).await.unwrap();
        store.delete_room("r1").await.unwrap();
        assert!(store.room_transcript("r1").await.unwrap().is_empty());

        // second delete of the same room is a no-op
        store.delete_room("r1").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_fail_appends() {
        let store = MemoryStore::new();
        store.fail_appends(true);
        let err = store
            .append_to_transcript("r1", &entry("u1", "m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Persistence(_)));

        store.fail_appends(false);
        store.append_to_transcript("r1", &entry("u1", "m1")).await.unwrap();
        assert_eq!(store.room_transcript("r1").await.unwrap().len(), 1);
    }
}
