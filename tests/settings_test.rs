//! Settings loading from files and the environment

use serial_test::serial;
use signin_broker::error::ConfigError;
use signin_broker::settings::{BrokerSettings, SECRETS_DIR_ENV};
use std::fs;
use tempfile::TempDir;

const OVERRIDE_VARS: &[&str] = &[
    SECRETS_DIR_ENV,
    "SESSION_SECRET",
    "PORT",
    "ACCESS_TOKEN_TTL_SECONDS",
    "COOKIE_SECURE",
];

fn clean_env() {
    for var in OVERRIDE_VARS {
        std::env::remove_var(var);
    }
}

fn secrets_dir_with(settings_toml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("Settings.toml"), settings_toml).unwrap();
    std::env::set_var(SECRETS_DIR_ENV, dir.path());
    dir
}

const SETTINGS_TOML: &str = r#"
[application]
app_name = "Broker Under Test"
port = 4100

[session]
secret = "file_secret_value_that_is_long_enough"
access_token_ttl_seconds = 900

[[providers]]
id = "google"
client_id = "google-client"
client_secret_env = "GOOGLE_CLIENT_SECRET"
"#;

#[test]
#[serial]
fn test_load_reads_settings_from_secrets_dir() {
    clean_env();
    let _dir = secrets_dir_with(SETTINGS_TOML);

    let settings = BrokerSettings::load().unwrap();

    assert_eq!(settings.application.app_name, "Broker Under Test");
    assert_eq!(settings.application.port, 4100);
    assert_eq!(settings.session.secret, "file_secret_value_that_is_long_enough");
    assert_eq!(settings.session.access_token_ttl_seconds, 900);
    assert_eq!(settings.providers.len(), 1);
    assert_eq!(settings.providers[0].id, "google");
    // Untouched sections keep their defaults
    assert_eq!(settings.session.refresh_token_ttl_hours, 720);
    assert_eq!(settings.cookies.access_cookie_name, "sAccessToken");

    clean_env();
}

#[test]
#[serial]
fn test_environment_overrides_file_values() {
    clean_env();
    let _dir = secrets_dir_with(SETTINGS_TOML);
    std::env::set_var("PORT", "5200");
    std::env::set_var("SESSION_SECRET", "env_secret_value_that_is_long_enough");
    std::env::set_var("ACCESS_TOKEN_TTL_SECONDS", "120");
    std::env::set_var("COOKIE_SECURE", "false");

    let settings = BrokerSettings::load().unwrap();

    assert_eq!(settings.application.port, 5200);
    assert_eq!(settings.session.secret, "env_secret_value_that_is_long_enough");
    assert_eq!(settings.session.access_token_ttl_seconds, 120);
    assert!(!settings.cookies.secure);
    assert_eq!(settings.get_bind_address(), format!("{}:5200", settings.application.host));

    clean_env();
}

#[test]
#[serial]
fn test_non_numeric_override_is_ignored() {
    clean_env();
    let _dir = secrets_dir_with(SETTINGS_TOML);
    std::env::set_var("ACCESS_TOKEN_TTL_SECONDS", "soon");

    let settings = BrokerSettings::load().unwrap();
    assert_eq!(settings.session.access_token_ttl_seconds, 900);

    clean_env();
}

#[test]
#[serial]
fn test_empty_secret_is_generated() {
    clean_env();
    let _dir = secrets_dir_with("[application]\napp_name = \"No Secret\"\n");

    let first = BrokerSettings::load().unwrap();
    let second = BrokerSettings::load().unwrap();

    assert!(!first.session.secret.is_empty());
    assert!(first.session.secret.len() >= 32);
    assert_ne!(first.session.secret, second.session.secret);

    clean_env();
}

#[test]
#[serial]
fn test_malformed_settings_file_fails_to_load() {
    clean_env();
    let _dir = secrets_dir_with("[session\nsecret = ");

    let err = BrokerSettings::load().unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    clean_env();
}

#[test]
#[serial]
fn test_unbounded_lifetime_fails_to_load() {
    clean_env();
    let _dir = secrets_dir_with(SETTINGS_TOML);
    std::env::set_var("ACCESS_TOKEN_TTL_SECONDS", u64::MAX.to_string());

    let err = BrokerSettings::load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSetting { .. }));

    clean_env();
}
