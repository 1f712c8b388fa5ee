//! Securities persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use refsync_securities::Security;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

/// Upsert-only store of securities keyed by `sec_id`.
#[async_trait]
pub trait SecurityRepository: Send + Sync {
    /// Insert or replace every record; returns the number of rows written.
    async fn upsert(&self, batch: &[Security]) -> Result<u64, RepositoryError>;
}

#[async_trait]
impl<T> SecurityRepository for Arc<T>
where
    T: SecurityRepository + ?Sized,
{
    async fn upsert(&self, batch: &[Security]) -> Result<u64, RepositoryError> {
        (**self).upsert(batch).await
    }
}

#[derive(Debug, Default)]
pub struct InMemorySecurityRepository {
    rows: Mutex<HashMap<String, Security>>,
}

impl InMemorySecurityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn get(&self, sec_id: &str) -> Option<Security> {
        self.rows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(sec_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SecurityRepository for InMemorySecurityRepository {
    async fn upsert(&self, batch: &[Security]) -> Result<u64, RepositoryError> {
        let mut rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        for security in batch {
            rows.insert(security.sec_id.clone(), security.clone());
        }
        Ok(batch.len() as u64)
    }
}

pub use self::postgres::PostgresSecurityRepository;

mod postgres {
    use async_trait::async_trait;
    use sqlx::PgPool;
    use sqlx::postgres::PgPoolOptions;
    use tracing::{debug, instrument};

    use refsync_securities::Security;

    use super::{RepositoryError, SecurityRepository};

    const UPSERT: &str = r#"
        INSERT INTO securities (
            sec_id, provider_id, short_name, reg_number, name, isin, is_traded,
            emitent_id, emitent_title, emitent_inn, emitent_okpo, gos_reg,
            security_type, security_group, primary_board_id, market_price_board_id,
            updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, now())
        ON CONFLICT (sec_id) DO UPDATE SET
            provider_id = EXCLUDED.provider_id,
            short_name = EXCLUDED.short_name,
            reg_number = EXCLUDED.reg_number,
            name = EXCLUDED.name,
            isin = EXCLUDED.isin,
            is_traded = EXCLUDED.is_traded,
            emitent_id = EXCLUDED.emitent_id,
            emitent_title = EXCLUDED.emitent_title,
            emitent_inn = EXCLUDED.emitent_inn,
            emitent_okpo = EXCLUDED.emitent_okpo,
            gos_reg = EXCLUDED.gos_reg,
            security_type = EXCLUDED.security_type,
            security_group = EXCLUDED.security_group,
            primary_board_id = EXCLUDED.primary_board_id,
            market_price_board_id = EXCLUDED.market_price_board_id,
            updated_at = EXCLUDED.updated_at
    "#;

    fn map_error(e: sqlx::Error) -> RepositoryError {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => RepositoryError::Unavailable(e.to_string()),
            other => RepositoryError::Storage(other.to_string()),
        }
    }

    /// Postgres-backed repository writing to the `securities` table
    /// (`sec_id` primary key). Each batch is one transaction.
    #[derive(Debug, Clone)]
    pub struct PostgresSecurityRepository {
        pool: PgPool,
    }

    impl PostgresSecurityRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn connect(url: &str) -> Result<Self, RepositoryError> {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .map_err(map_error)?;
            Ok(Self::new(pool))
        }
    }

    #[async_trait]
    impl SecurityRepository for PostgresSecurityRepository {
        #[instrument(skip(self, batch), fields(batch = batch.len()), err)]
        async fn upsert(&self, batch: &[Security]) -> Result<u64, RepositoryError> {
            let mut tx = self.pool.begin().await.map_err(map_error)?;
            let mut affected = 0;
            for s in batch {
                let result = sqlx::query(UPSERT)
                    .bind(&s.sec_id)
                    .bind(s.provider_id)
                    .bind(&s.short_name)
                    .bind(&s.reg_number)
                    .bind(&s.name)
                    .bind(&s.isin)
                    .bind(s.is_traded)
                    .bind(s.emitent_id)
                    .bind(&s.emitent_title)
                    .bind(&s.emitent_inn)
                    .bind(&s.emitent_okpo)
                    .bind(&s.gos_reg)
                    .bind(&s.security_type)
                    .bind(&s.security_group)
                    .bind(&s.primary_board_id)
                    .bind(&s.market_price_board_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_error)?;
                affected += result.rows_affected();
            }
            tx.commit().await.map_err(map_error)?;
            debug!(affected, "securities upserted");
            Ok(affected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security(sec_id: &str, name: &str) -> Security {
        Security {
            sec_id: sec_id.to_string(),
            name: name.to_string(),
            ..Security::default()
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_sec_id() {
        let repo = InMemorySecurityRepository::new();
        let written = repo
            .upsert(&[security("SBER", "Sberbank"), security("GAZP", "Gazprom")])
            .await
            .unwrap();
        assert_eq!(written, 2);

        repo.upsert(&[security("SBER", "Sberbank PAO")]).await.unwrap();
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.get("SBER").unwrap().name, "Sberbank PAO");
    }
}
