//! Integration tests for TOML configuration loading and root folder resolution

use nsi_common::config::{
    load_toml_config, resolve_root_folder, write_toml_config, ProviderSettings, TomlConfig,
};
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_missing_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
fn test_write_then_load_preserves_providers() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nsi-ai.toml");

    let mut config = TomlConfig::default();
    config.pipeline.workers = 3;
    config.providers.push(ProviderSettings {
        name: "OpenRouter".to_string(),
        base_url: "https://openrouter.ai/api/v1".to_string(),
        model: "z.ai/glm-4.5".to_string(),
        priority: 1,
        ..Default::default()
    });

    write_toml_config(&config, &path).unwrap();
    assert!(!temp_dir.path().join("nsi-ai.toml.tmp").exists());

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded.pipeline.workers, 3);
    assert_eq!(loaded.providers.len(), 1);
    assert_eq!(loaded.providers[0].model, "z.ai/glm-4.5");
    assert!(loaded.providers[0].enabled);
}

#[cfg(unix)]
#[test]
fn test_written_file_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nsi-ai.toml");
    write_toml_config(&TomlConfig::default(), &path).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_invalid_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nsi-ai.toml");
    std::fs::write(&path, "[pipeline]\nworkers = 0\n").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("pipeline.workers"));
}

#[test]
#[serial]
fn test_env_var_used_without_cli_arg() {
    std::env::set_var("NSI_ROOT_FOLDER_TEST", "/srv/nsi-env");
    let resolved = resolve_root_folder(None, "NSI_ROOT_FOLDER_TEST");
    std::env::remove_var("NSI_ROOT_FOLDER_TEST");
    assert_eq!(resolved, PathBuf::from("/srv/nsi-env"));
}

#[test]
#[serial]
fn test_cli_arg_beats_env_var() {
    std::env::set_var("NSI_ROOT_FOLDER_TEST", "/srv/nsi-env");
    let resolved = resolve_root_folder(Some(std::path::Path::new("/srv/cli")), "NSI_ROOT_FOLDER_TEST");
    std::env::remove_var("NSI_ROOT_FOLDER_TEST");
    assert_eq!(resolved, PathBuf::from("/srv/cli"));
}
