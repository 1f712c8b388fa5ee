//! Redis-backed progress store.
//!
//! Keys follow the shared layout (`{subject}:{correlation_id}`,
//! `{subject}:active`); every value is written with `PX` set to the refresh
//! expiry so abandoned runs age out on their own.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Cmd, ErrorKind, FromRedisValue, RedisError};

use refsync_core::{CorrelationId, Subject};
use refsync_refresh::{ProgressStore, RefreshProgress, StoreError, active_key, progress_key};

use crate::config::StoreSettings;
use crate::jobs::RetryPolicy;

pub struct RedisProgressStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
    timeout: Duration,
    retry: RetryPolicy,
}

fn map_error(e: RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else if e.is_connection_dropped()
        || e.is_connection_refusal()
        || e.is_io_error()
        || matches!(e.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain)
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisProgressStore {
    /// Create a store; the connection is opened on first use.
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        let client = Client::open(settings.url())
            .map_err(|e| StoreError::Backend(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout: settings.timeout,
            retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(50),
                Duration::from_secs(1),
            ),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let connect = ConnectionManager::new(self.client.clone());
                match tokio::time::timeout(self.timeout, connect).await {
                    Ok(result) => result.map_err(map_error),
                    Err(_) => Err(StoreError::Timeout("connecting to redis".to_string())),
                }
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run `cmd`, retrying transient failures with backoff.
    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let mut conn = self.connection().await?;
                match tokio::time::timeout(self.timeout, cmd.query_async::<_, T>(&mut conn)).await
                {
                    Ok(result) => result.map_err(map_error),
                    Err(_) => Err(StoreError::Timeout("redis command".to_string())),
                }
            }
            .await;

            match result {
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "redis call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cmd = ::redis::cmd("GET");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
        self.query(&cmd).await
    }
}

impl core::fmt::Debug for RedisProgressStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisProgressStore")
            .field("connected", &self.conn.initialized())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    #[instrument(skip(self), fields(%subject, %correlation_id), err)]
    async fn get(
        &self,
        subject: &Subject,
        correlation_id: &CorrelationId,
    ) -> Result<Option<RefreshProgress>, StoreError> {
        self.get_string(&progress_key(subject, correlation_id))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    #[instrument(
        skip(self, progress),
        fields(correlation_id = %progress.correlation_id(), status = %progress.status()),
        err
    )]
    async fn put(&self, progress: &RefreshProgress, ttl: Duration) -> Result<(), StoreError> {
        let value = serde_json::to_string(progress)?;
        self.set_string(
            &progress_key(progress.subject(), progress.correlation_id()),
            &value,
            ttl,
        )
        .await?;
        debug!("progress persisted");
        Ok(())
    }

    async fn active(&self, subject: &Subject) -> Result<Option<CorrelationId>, StoreError> {
        self.get_string(&active_key(subject))
            .await?
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
        self.set_string(&active_key(subject), correlation_id.as_str(), ttl)
            .await
    }

    async fn clear_active(&self, subject: &Subject) -> Result<(), StoreError> {
        let mut cmd = ::redis::cmd("DEL");
        cmd.arg(active_key(subject));
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_sent_in_whole_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_secs(900)), 900_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[test]
    fn connection_errors_are_transient() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(map_error(io).is_transient());

        let typed = RedisError::from((ErrorKind::TypeError, "wrong type"));
        assert!(!map_error(typed).is_transient());
    }
}
