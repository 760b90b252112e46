//! Key/value settings table

use async_trait::async_trait;

use nsi_common::db_retry::retry_on_lock;
use nsi_common::Result;

use super::SqliteStore;
use crate::repository::SettingsRepository;

/// Settings key holding the API key of a provider
pub fn provider_api_key_setting(provider: &str) -> String {
    format!("provider.{}.api_key", provider.to_lowercase())
}

#[async_trait]
impl SettingsRepository for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        retry_on_lock("set_setting", self.max_lock_wait_ms, || async {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;

    #[test]
    fn test_provider_key_name() {
        assert_eq!(provider_api_key_setting("OpenRouter"), "provider.openrouter.api_key");
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = SqliteStore::new(init_memory_pool().await.unwrap());
        assert!(store.get_setting("k").await.unwrap().is_none());
        store.set_setting("k", "one").await.unwrap();
        store.set_setting("k", "two").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("two"));
    }
}
