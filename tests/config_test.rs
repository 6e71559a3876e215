//! Config file round trip and validation

use std::time::Duration;

use tempfile::TempDir;

use swh_deposit::config::Config;
use swh_deposit::{DepositError, RetryPolicy};

#[test]
fn save_then_load_keeps_settings_but_not_password() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = Config::default();
    config.storage.data_dir = dir.path().join("data");
    config.archive.collection_iri = "https://deposit.example/1/zenodo/".into();
    config.archive.username = "zenodo".into();
    config.archive.password = Some("secret".into());
    config.policy.accepted_extensions.insert("tgz".into());
    config.polling.max_attempts = 8;
    config.save(&path).unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(!written.contains("secret"));

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.storage.data_dir, dir.path().join("data"));
    assert_eq!(loaded.archive.username, "zenodo");
    assert_eq!(loaded.archive.password, None);
    assert!(loaded.policy.accepted_extensions.contains("tgz"));
    assert_eq!(loaded.polling.max_attempts, 8);
    assert!(loaded.validate().is_ok());
}

#[test]
fn malformed_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[policy]\nmax_file_size = \"big\"\n").unwrap();

    assert!(matches!(Config::load(&path), Err(DepositError::Config(_))));
}

#[test]
fn missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        Config::load(dir.path().join("nope.toml")),
        Err(DepositError::Io(_))
    ));
}

#[test]
fn zero_limits_are_rejected() {
    let mut config = Config::default();
    config.policy.max_file_size = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.polling.max_attempts = 0;
    assert!(config.validate().is_err());
}

#[test]
fn polling_section_drives_backoff() {
    let config: Config = toml::from_str(
        "[polling]\nbackoff_base_secs = 5\nbackoff_max_secs = 30\nmax_attempts = 4\n",
    )
    .unwrap();

    let policy = RetryPolicy::polling(&config.polling);
    let delays: Vec<_> = (0..policy.max_attempts).map(|a| policy.delay_for(a)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(30),
        ]
    );
}
