//! Durable-log records and the adapter the directory appends through.
//!
//! Every externally observable directory mutation writes a typed record to
//! a replicated log before its in-memory effects become authoritative, so
//! a restarted coordinator can replay the `complete` phase of whatever it
//! finds. Records supersede one another through the `invalidates` list on
//! append.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::ServerId;

/// Id of an appended record; 0 is the "no record" sentinel.
pub type LogEntryId = u64;

/// Typed payloads written by the directory's operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry_type")]
pub enum LogRecord {
    /// An id has been issued but the server is not yet in the list.
    ServerEnlisting {
        server_id: ServerId,
        services: u32,
        read_mbps: u32,
        locator: String,
    },
    /// The enlistment took effect; supersedes the `ServerEnlisting` record.
    ServerEnlisted {
        server_id: ServerId,
        services: u32,
        read_mbps: u32,
        locator: String,
    },
    ForceServerDown { server_id: ServerId },
    /// Latest master recovery blob for a server; each write supersedes the
    /// previous `ServerUpdate` for that id.
    ServerUpdate {
        server_id: ServerId,
        master_recovery_info: Vec<u8>,
    },
}

/// The three primitives the directory consumes from the replicated log.
/// Appends are atomic together with their supersession list.
pub trait DurableLog: Send + Sync {
    fn append(&self, record: &LogRecord, invalidates: &[LogEntryId]) -> Result<LogEntryId>;
    fn read(&self, id: LogEntryId) -> Result<LogRecord>;
    fn invalidate(&self, ids: &[LogEntryId]) -> Result<()>;
}

/// In-process log keeping encoded records in a map. Backs single-process
/// deployments and every test; the production adapter wraps the replicated
/// log service with the same surface.
#[derive(Default)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

#[derive(Default)]
struct MemoryLogInner {
    records: HashMap<LogEntryId, Vec<u8>>,
    next_id: LogEntryId,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the records still live, in ascending order.
    pub fn live_entry_ids(&self) -> Vec<LogEntryId> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<LogEntryId> = inner.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, record: &LogRecord, invalidates: &[LogEntryId]) -> Result<LogEntryId> {
        let encoded =
            serde_json::to_vec(record).map_err(|err| Error::DurableLog(err.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        for id in invalidates {
            inner.records.remove(id);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.insert(id, encoded);
        Ok(id)
    }

    fn read(&self, id: LogEntryId) -> Result<LogRecord> {
        let inner = self.inner.lock().unwrap();
        let encoded = inner
            .records
            .get(&id)
            .ok_or_else(|| Error::DurableLog(format!("no live record with id {id}")))?;
        serde_json::from_slice(encoded).map_err(|err| Error::DurableLog(err.to_string()))
    }

    fn invalidate(&self, ids: &[LogEntryId]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            inner.records.remove(id);
        }
        Ok(())
    }
}
