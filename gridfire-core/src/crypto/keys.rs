use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use gridfire_model::UserId;

use super::CipherKey;
use crate::error::{PipelineError, Result};

/// Resolves the content key of a rights holder, creating one on first use.
#[async_trait]
pub trait KeyStore: Send + Sync + fmt::Debug {
    async fn key_for(&self, user: UserId) -> Result<CipherKey>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: DashMap<UserId, CipherKey>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `key` for `user`; used to simulate key rotation in tests.
    pub fn insert(&self, user: UserId, key: CipherKey) {
        self.keys.insert(user, key);
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn key_for(&self, user: UserId) -> Result<CipherKey> {
        Ok(self
            .keys
            .entry(user)
            .or_insert_with(CipherKey::generate)
            .clone())
    }
}

#[cfg(feature = "database")]
pub use postgres::PostgresKeyStore;

#[cfg(feature = "database")]
mod postgres {
    use sqlx::{PgPool, Row};

    use super::*;
    use crate::tracks::RepositoryError;

    /// Keys persisted base64-encoded in `user_keys`. Rows are only ever
    /// inserted, so concurrent first uses converge on whichever won.
    #[derive(Debug, Clone)]
    pub struct PostgresKeyStore {
        pool: PgPool,
    }

    impl PostgresKeyStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl KeyStore for PostgresKeyStore {
        async fn key_for(&self, user: UserId) -> Result<CipherKey> {
            let candidate = CipherKey::generate();
            sqlx::query(
                r#"
                INSERT INTO user_keys (user_id, key_material)
                VALUES ($1, $2)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(user.to_uuid())
            .bind(candidate.to_base64())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

            let row = sqlx::query("SELECT key_material FROM user_keys WHERE user_id = $1")
                .bind(user.to_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
            let encoded: String = row.try_get("key_material").map_err(RepositoryError::from)?;
            CipherKey::from_base64(&encoded).map_err(PipelineError::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_returns_a_stable_key_per_user() {
        let store = MemoryKeyStore::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let first = store.key_for(alice).await.unwrap();
        let again = store.key_for(alice).await.unwrap();
        let other = store.key_for(bob).await.unwrap();

        assert_eq!(first.to_base64(), again.to_base64());
        assert_ne!(first.to_base64(), other.to_base64());
    }
}
