//! Progress persistence.
//!
//! Layout (shared by every backend):
//!
//! ```text
//! {subject}:{correlation_id} -> JSON RefreshProgress   (TTL = refresh expiry)
//! {subject}:active           -> correlation id         (TTL = refresh expiry)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use refsync_core::{CorrelationId, SharedClock, Subject, SystemClock};

use crate::error::StoreError;
use crate::progress::RefreshProgress;

pub fn progress_key(subject: &Subject, correlation_id: &CorrelationId) -> String {
    format!("{subject}:{correlation_id}")
}

pub fn active_key(subject: &Subject) -> String {
    format!("{subject}:active")
}

/// Key-value store for progress records.
///
/// Writes are last-writer-wins; there is no cross-process locking.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
    ) -> Result<Option<RefreshProgress>, StoreError>;

    /// Persist the full record, replacing any previous version.
    async fn put(&self, progress: &RefreshProgress, ttl: Duration) -> Result<(), StoreError>;

    /// Correlation id of the run currently holding `subject`.
    async fn active(&self, subject: &Subject) -> Result<Option<CorrelationId>, StoreError>;

    async fn set_active(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn clear_active(&self, subject: &Subject) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> ProgressStore for Arc<S>
where
    S: ProgressStore + ?Sized,
{
    async fn get(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
    ) -> Result<Option<RefreshProgress>, StoreError> {
        (**self).get(subject, correlation_id).await
    }

    async fn put(&self, progress: &RefreshProgress, ttl: Duration) -> Result<(), StoreError> {
        (**self).put(progress, ttl).await
    }

    async fn active(&self, subject: &Subject) -> Result<Option<CorrelationId>, StoreError> {
        (**self).active(subject).await
    }

    async fn set_active(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        (**self).set_active(subject, correlation_id, ttl).await
    }

    async fn clear_active(&self, subject: &Subject) -> Result<(), StoreError> {
        (**self).clear_active(subject).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory progress store for tests/dev.
///
/// Values are kept JSON-encoded under the same keys a remote store uses.
/// Expiry follows the injected clock and is applied lazily on read.
pub struct InMemoryProgressStore {
    entries: RwLock<HashMap<String, Entry>>,
    clock: SharedClock,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of keys that have not expired.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.read()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    fn load(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        {
            let entries = self.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.write().remove(key);
        None
    }

    fn store(&self, key: String, value: String, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.write().insert(key, Entry { value, expires_at });
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for InMemoryProgressStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryProgressStore")
            .field("keys", &self.read().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
    ) -> Result<Option<RefreshProgress>, StoreError> {
        self.load(&progress_key(subject, correlation_id))
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    async fn put(&self, progress: &RefreshProgress, ttl: Duration) -> Result<(), StoreError> {
        let value = serde_json::to_string(progress)?;
        self.store(
            progress_key(progress.subject(), progress.correlation_id()),
            value,
            ttl,
        );
        Ok(())
    }

    async fn active(&self, subject: &Subject) -> Result<Option<CorrelationId>, StoreError> {
        self.load(&active_key(subject))
            .map(|raw| {
                CorrelationId::parse(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn set_active(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store(active_key(subject), correlation_id.to_string(), ttl);
        Ok(())
    }

    async fn clear_active(&self, subject: &Subject) -> Result<(), StoreError> {
        self.write().remove(&active_key(subject));
        Ok(())
    }
}
