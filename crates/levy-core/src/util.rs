use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(lock = %what, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!(lock = %what, "Recovered from poisoned rwlock");
        poisoned.into_inner()
    })
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!(lock = %what, "Recovered from poisoned rwlock");
        poisoned.into_inner()
    })
}

/// Store key for a job record.
pub fn job_key(job_id: &uuid::Uuid) -> String {
    format!("job:{job_id}")
}

/// Store key for one item outcome within a job.
pub fn outcome_key(job_id: &uuid::Uuid, item_id: &str) -> String {
    format!("outcome:{job_id}:{item_id}")
}
