//! Session history store
//!
//! Persists connected sessions and their heart-rate records as a single
//! JSON document, rewritten on every mutation. Sessions get increasing ids;
//! records reference their session and are deleted with it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History persistence error: {0}")]
    Persistence(String),

    #[error("Session {0} not found")]
    SessionNotFound(i64),
}

/// One contiguous connected period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub device_name: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the session is still open.
    pub end_time: Option<DateTime<Utc>>,
}

/// One heart-rate reading within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub bpm: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryData {
    next_session_id: i64,
    sessions: Vec<Session>,
    records: Vec<Record>,
}

impl Default for HistoryData {
    fn default() -> Self {
        Self {
            next_session_id: 1,
            sessions: Vec::new(),
            records: Vec::new(),
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    data: Mutex<HistoryData>,
}

impl HistoryStore {
    /// Open (or create) the history file under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| HistoryError::Persistence(format!("Failed to create directory: {}", e)))?;
        }
        let path = dir.join("history.json");
        let data = if path.exists() {
            let text = fs::read_to_string(&path)
                .map_err(|e| HistoryError::Persistence(format!("Failed to read history: {}", e)))?;
            serde_json::from_str(&text)
                .map_err(|e| HistoryError::Persistence(format!("Failed to parse history: {}", e)))?
        } else {
            HistoryData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Open a new session, closing any session left open (e.g. by a crash)
    /// first so at most one session is ever open.
    pub fn insert_session(
        &self,
        device_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, HistoryError> {
        let mut data = self.data.lock().unwrap();
        for session in data.sessions.iter_mut() {
            if session.end_time.is_none() {
                session.end_time = Some(start_time);
            }
        }
        let id = data.next_session_id;
        data.next_session_id += 1;
        data.sessions.push(Session {
            id,
            device_name: device_name.to_string(),
            start_time,
            end_time: None,
        });
        self.persist(&data)?;
        Ok(id)
    }

    /// Close a session. An end time, once set, never changes.
    pub fn end_session(&self, id: i64, end_time: DateTime<Utc>) -> Result<(), HistoryError> {
        let mut data = self.data.lock().unwrap();
        let session = data
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(HistoryError::SessionNotFound(id))?;
        if session.end_time.is_none() {
            session.end_time = Some(end_time);
            self.persist(&data)?;
        }
        Ok(())
    }

    /// Append a record. Fails with `SessionNotFound` when the session was
    /// deleted concurrently; callers disable recording for that session.
    pub fn insert_record(
        &self,
        session_id: i64,
        timestamp: DateTime<Utc>,
        bpm: u16,
    ) -> Result<(), HistoryError> {
        let mut data = self.data.lock().unwrap();
        if !data.sessions.iter().any(|s| s.id == session_id) {
            return Err(HistoryError::SessionNotFound(session_id));
        }
        data.records.push(Record {
            session_id,
            timestamp,
            bpm,
        });
        self.persist(&data)
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let data = self.data.lock().unwrap();
        let mut sessions = data.sessions.clone();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions
    }

    /// A session's records in time order.
    pub fn records_for_session(&self, id: i64) -> Vec<Record> {
        let data = self.data.lock().unwrap();
        let mut records: Vec<Record> = data
            .records
            .iter()
            .filter(|r| r.session_id == id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records
    }

    /// Delete a session and, cascading, its records.
    pub fn delete_session(&self, id: i64) -> Result<(), HistoryError> {
        let mut data = self.data.lock().unwrap();
        data.sessions.retain(|s| s.id != id);
        data.records.retain(|r| r.session_id != id);
        self.persist(&data)
    }

    fn persist(&self, data: &HistoryData) -> Result<(), HistoryError> {
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| HistoryError::Persistence(format!("Failed to serialize history: {}", e)))?;
        fs::write(&self.path, bytes)
            .map_err(|e| HistoryError::Persistence(format!("Failed to write history: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_session_lifecycle() {
        let (_dir, store) = store();

        let id = store.insert_session("Polar H10", t(0)).unwrap();
        assert_eq!(id, 1);
        store.insert_record(id, t(1), 72).unwrap();
        store.insert_record(id, t(2), 75).unwrap();
        store.end_session(id, t(10)).unwrap();

        let sessions = store.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].device_name, "Polar H10");
        assert_eq!(sessions[0].end_time, Some(t(10)));

        let records = store.records_for_session(id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bpm, 72);
        assert_eq!(records[1].bpm, 75);
    }

    #[test]
    fn test_end_time_never_changes() {
        let (_dir, store) = store();
        let id = store.insert_session("Strap", t(0)).unwrap();
        store.end_session(id, t(5)).unwrap();
        store.end_session(id, t(50)).unwrap();
        assert_eq!(store.list_sessions()[0].end_time, Some(t(5)));
    }

    #[test]
    fn test_at_most_one_open_session() {
        let (_dir, store) = store();
        let first = store.insert_session("Strap", t(0)).unwrap();
        let second = store.insert_session("Strap", t(100)).unwrap();

        let sessions = store.list_sessions();
        let open: Vec<_> = sessions.iter().filter(|s| s.end_time.is_none()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second);

        let recovered = sessions.iter().find(|s| s.id == first).unwrap();
        assert_eq!(recovered.end_time, Some(t(100)));
    }

    #[test]
    fn test_insert_record_into_deleted_session() {
        let (_dir, store) = store();
        let id = store.insert_session("Strap", t(0)).unwrap();
        store.delete_session(id).unwrap();

        let result = store.insert_record(id, t(1), 72);
        assert!(matches!(result, Err(HistoryError::SessionNotFound(_))));
    }

    #[test]
    fn test_delete_cascades_records() {
        let (_dir, store) = store();
        let keep = store.insert_session("Strap", t(0)).unwrap();
        store.insert_record(keep, t(1), 70).unwrap();
        let gone = store.insert_session("Strap", t(10)).unwrap();
        store.insert_record(gone, t(11), 80).unwrap();

        store.delete_session(gone).unwrap();
        assert!(store.records_for_session(gone).is_empty());
        assert_eq!(store.records_for_session(keep).len(), 1);
    }

    #[test]
    fn test_sessions_listed_newest_first() {
        let (_dir, store) = store();
        let a = store.insert_session("Strap", t(0)).unwrap();
        let b = store.insert_session("Strap", t(100)).unwrap();

        let sessions = store.list_sessions();
        assert_eq!(sessions[0].id, b);
        assert_eq!(sessions[1].id, a);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = HistoryStore::open(dir.path()).unwrap();
            let id = store.insert_session("Strap", t(0)).unwrap();
            store.insert_record(id, t(1), 72).unwrap();
            id
        };

        let store = HistoryStore::open(dir.path()).unwrap();
        assert_eq!(store.list_sessions().len(), 1);
        assert_eq!(store.records_for_session(id).len(), 1);

        // Ids keep increasing after reload.
        let next = store.insert_session("Strap", t(10)).unwrap();
        assert!(next > id);
    }
}
