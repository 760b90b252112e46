//! Provider API key resolution
//!
//! Keys are looked up Database → ENV → TOML. All keys are resolved before any
//! component is built, so a running service never re-reads them.

use std::collections::HashMap;

use nsi_common::config::ProviderSettings;
use nsi_common::Result;
use tracing::{info, warn};

use crate::db::settings::provider_api_key_setting;
use crate::repository::SettingsRepository;

/// Environment variable holding a provider's key: `NSI_<NAME>_API_KEY`
///
/// Characters other than ASCII letters and digits become `_`.
pub fn provider_api_key_env_var(provider: &str) -> String {
    let name: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("NSI_{}_API_KEY", name)
}

/// Resolve one provider's API key
///
/// **Priority:** Database → ENV → TOML. A provider without any key is still built;
/// endpoints that need no authentication (local gateways) work without one.
pub async fn resolve_provider_api_key(
    settings: &dyn SettingsRepository,
    provider: &ProviderSettings,
) -> Result<Option<String>> {
    let env_var = provider_api_key_env_var(&provider.name);

    let db_key = settings
        .get_setting(&provider_api_key_setting(&provider.name))
        .await?
        .filter(|k| is_valid_key(k));
    let env_key = std::env::var(&env_var).ok().filter(|k| is_valid_key(k));
    let toml_key = provider.api_key.clone().filter(|k| is_valid_key(k));

    let sources: Vec<&str> = [
        db_key.as_ref().map(|_| "database"),
        env_key.as_ref().map(|_| "environment"),
        toml_key.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            provider = %provider.name,
            "API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    let resolved = db_key.or(env_key).or(toml_key);
    match sources.first() {
        Some(source) => info!(provider = %provider.name, "API key loaded from {}", source),
        None => warn!(
            provider = %provider.name,
            "No API key configured (set {} or providers[].api_key)",
            env_var
        ),
    }
    Ok(resolved)
}

/// Resolve keys for every enabled provider, keyed by provider name
pub async fn resolve_all_api_keys(
    settings: &dyn SettingsRepository,
    providers: &[ProviderSettings],
) -> Result<HashMap<String, Option<String>>> {
    let mut keys = HashMap::with_capacity(providers.len());
    for provider in providers.iter().filter(|p| p.enabled) {
        let key = resolve_provider_api_key(settings, provider).await?;
        keys.insert(provider.name.clone(), key);
    }
    Ok(keys)
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_pool, SqliteStore};
    use serial_test::serial;

    fn provider(name: &str, api_key: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            api_key: api_key.map(str::to_string),
            ..Default::default()
        }
    }

    async fn store() -> SqliteStore {
        SqliteStore::new(init_memory_pool().await.unwrap())
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(provider_api_key_env_var("OpenRouter"), "NSI_OPENROUTER_API_KEY");
        assert_eq!(provider_api_key_env_var("eden-ai v2"), "NSI_EDEN_AI_V2_API_KEY");
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("sk-123"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("   "));
    }

    #[tokio::test]
    #[serial]
    async fn test_database_wins_over_env_and_toml() {
        let store = store().await;
        store
            .set_setting(&provider_api_key_setting("Alpha"), "db-key")
            .await
            .unwrap();
        std::env::set_var("NSI_ALPHA_API_KEY", "env-key");

        let key = resolve_provider_api_key(&store, &provider("Alpha", Some("toml-key")))
            .await
            .unwrap();
        std::env::remove_var("NSI_ALPHA_API_KEY");
        assert_eq!(key.as_deref(), Some("db-key"));
    }

    #[tokio::test]
    #[serial]
    async fn test_env_wins_over_toml() {
        let store = store().await;
        std::env::set_var("NSI_BETA_API_KEY", "env-key");

        let key = resolve_provider_api_key(&store, &provider("Beta", Some("toml-key")))
            .await
            .unwrap();
        std::env::remove_var("NSI_BETA_API_KEY");
        assert_eq!(key.as_deref(), Some("env-key"));
    }

    #[tokio::test]
    #[serial]
    async fn test_blank_values_are_skipped() {
        let store = store().await;
        store
            .set_setting(&provider_api_key_setting("Gamma"), "  ")
            .await
            .unwrap();

        let key = resolve_provider_api_key(&store, &provider("Gamma", Some("toml-key")))
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("toml-key"));

        let none = resolve_provider_api_key(&store, &provider("Delta", None))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_disabled_providers_are_not_resolved() {
        let store = store().await;
        let mut disabled = provider("Off", Some("k"));
        disabled.enabled = false;

        let keys = resolve_all_api_keys(&store, &[provider("On", Some("k")), disabled])
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys["On"].as_deref(), Some("k"));
    }
}
