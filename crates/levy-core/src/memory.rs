//! In-process backing store.
//!
//! Every connection opened by one [`MemoryConnectionManager`] sees the same
//! map. Used by tests and by `levy run --in-memory`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::error::AppError;
use crate::traits::{ConnectionManager, RecordStore};

type Records = Arc<Mutex<HashMap<String, Value>>>;

#[derive(Debug, Default)]
struct Switches {
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    invalid: AtomicBool,
}

/// Opens connections onto a shared in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionManager {
    records: Records,
    switches: Arc<Switches>,
    connects: Arc<AtomicU64>,
}

impl MemoryConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections opened so far.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make `connect` fail, as if the store were unreachable.
    pub fn set_fail_connect(&self, fail: bool) {
        self.switches.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every write on every connection fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.switches.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the health probe report existing connections as broken.
    pub fn set_valid(&self, valid: bool) {
        self.switches.invalid.store(!valid, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(records: &Records) -> MutexGuard<'_, HashMap<String, Value>> {
    crate::util::lock(records, "memory records")
}

/// One "connection" to the in-memory store.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    records: Records,
    switches: Arc<Switches>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_writable(&self) -> Result<(), AppError> {
        if self.switches.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(format!(
                "memory connection {} rejected write",
                self.id
            )));
        }
        Ok(())
    }
}

impl ConnectionManager for MemoryConnectionManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, AppError> {
        if self.switches.fail_connect.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError("memory store unreachable".into()));
        }
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryConnection {
            id,
            records: Arc::clone(&self.records),
            switches: Arc::clone(&self.switches),
        })
    }

    async fn is_valid(&self, conn: &mut MemoryConnection) -> Result<(), AppError> {
        if self.switches.invalid.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(format!(
                "memory connection {} failed probe",
                conn.id
            )));
        }
        Ok(())
    }
}

impl RecordStore for MemoryConnection {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, AppError> {
        Ok(lock(&self.records).get(key).cloned())
    }

    async fn put(&mut self, key: &str, record: &Value) -> Result<(), AppError> {
        self.check_writable()?;
        lock(&self.records).insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn upsert(&mut self, records: &[(String, Value)]) -> Result<u64, AppError> {
        self.check_writable()?;
        let mut map = lock(&self.records);
        for (key, record) in records {
            map.insert(key.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }
}
