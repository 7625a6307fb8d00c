//! In-process configuration record
//!
//! Versions are a monotonically increasing counter. Subscribers are fed
//! through a `tokio::sync::watch` channel, so a slow reader only ever sees
//! the latest document.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

use super::{ConfigStore, StoredDocument};
use crate::error::{Result, TimeshardError};

/// Versioned in-memory record
pub struct MemoryStore {
    name: String,
    current: Mutex<Option<StoredDocument>>,
    next_version: AtomicU64,
    /// Successful writes
    writes: AtomicU64,
    /// Pending injected transient failures
    failures: AtomicU32,
    notify: watch::Sender<Option<StoredDocument>>,
}

impl MemoryStore {
    /// Create an empty record
    pub fn new(name: impl Into<String>) -> Self {
        let (notify, _) = watch::channel(None);
        Self {
            name: name.into(),
            current: Mutex::new(None),
            next_version: AtomicU64::new(1),
            writes: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            notify,
        }
    }

    /// Receive every committed document
    pub fn subscribe(&self) -> watch::Receiver<Option<StoredDocument>> {
        self.notify.subscribe()
    }

    /// Unconditionally replace the document, as a competing writer would
    pub fn force_put(&self, body: impl Into<String>) -> String {
        let mut current = self.current.lock();
        self.commit(&mut current, body.into())
    }

    /// Fail the next `count` operations with a transient error
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of committed writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored document
    pub fn snapshot(&self) -> Option<StoredDocument> {
        self.current.lock().clone()
    }

    fn take_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TimeshardError::transient(format!("{} unavailable", self.name)));
        }
        Ok(())
    }

    fn commit(&self, current: &mut Option<StoredDocument>, body: String) -> String {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst).to_string();
        let stored = StoredDocument {
            body,
            version: version.clone(),
        };
        *current = Some(stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify.send_replace(Some(stored));
        debug!("{} committed version {}", self.name, version);
        version
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<StoredDocument>> {
        self.take_failure()?;
        Ok(self.current.lock().clone())
    }

    async fn put_if_version(&self, body: String, expected: Option<&str>) -> Result<String> {
        self.take_failure()?;
        let mut current = self.current.lock();
        let actual = current.as_ref().map(|doc| doc.version.as_str());
        if actual != expected {
            return Err(TimeshardError::WriteConflict {
                name: self.name.clone(),
                expected: expected.map(str::to_string),
                actual: actual.map(str::to_string),
            });
        }
        Ok(self.commit(&mut current, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_cas() {
        let store = MemoryStore::new("shards");
        assert!(store.get().await.unwrap().is_none());

        let v1 = store.put_if_version("a".into(), None).await.unwrap();
        let v2 = store.put_if_version("b".into(), Some(&v1)).await.unwrap();
        assert_ne!(v1, v2);

        let doc = store.get().await.unwrap().unwrap();
        assert_eq!(doc.body, "b");
        assert_eq!(doc.version, v2);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_token_conflicts_without_corruption() {
        let store = MemoryStore::new("shards");
        let v1 = store.put_if_version("mine".into(), None).await.unwrap();
        store.force_put("theirs");

        let err = store.put_if_version("mine-v2".into(), Some(&v1)).await.unwrap_err();
        assert!(matches!(err, TimeshardError::WriteConflict { .. }));
        assert_eq!(store.snapshot().unwrap().body, "theirs");

        let err = store.put_if_version("again".into(), None).await.unwrap_err();
        assert!(matches!(err, TimeshardError::WriteConflict { .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new("shards");
        store.inject_failures(1);
        assert!(store.get().await.unwrap_err().is_retryable());
        assert!(store.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_see_latest() {
        let store = MemoryStore::new("shards");
        let mut rx = store.subscribe();
        store.put_if_version("one".into(), None).await.unwrap();
        store.force_put("two");

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().body, "two");
    }
}
