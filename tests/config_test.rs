use flockconf::config::*;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_default_config() {
    let config = NodeConfig::default();
    assert_eq!(config.listen_addr(), "0.0.0.0:9410");
    assert_eq!(config.applicator.locked_settings, vec!["cluster-name".to_string()]);
    assert!(config.ledger_dir().ends_with("ledger"));
}

#[test]
fn test_save_and_load_roundtrip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("flockconf.toml");

    let mut config = NodeConfig::default();
    config.node_name = Some("node-7".to_string());
    config.data_dir = temp.path().join("data");
    config.applicator.max_settings = 12;
    config.coordinator.request_timeout_ms = 2500;
    config.save(&path).unwrap();

    let loaded = NodeConfig::load(&path).unwrap();
    assert_eq!(loaded.effective_node_name(), "node-7");
    assert_eq!(loaded.data_dir, temp.path().join("data"));
    assert_eq!(loaded.applicator.to_policy().max_settings, 12);
    assert_eq!(loaded.coordinator.request_timeout_ms, 2500);
}

#[test]
fn test_load_rejects_invalid_toml() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.toml");
    std::fs::write(&path, "bind_port = \"not a number\"").unwrap();
    assert!(NodeConfig::load(&path).is_err());
}

#[test]
fn test_coordinator_options_from_settings() {
    let mut config = NodeConfig::default();
    config.hostname = Some("ops-1".to_string());
    config.coordinator.user = Some("carol".to_string());
    config.coordinator.request_timeout_ms = 750;
    config.coordinator.max_concurrency = 0;

    let options = config.to_coordinator_options();
    assert_eq!(options.host, "ops-1");
    assert_eq!(options.user, "carol");
    assert_eq!(options.request_timeout, Duration::from_millis(750));
    assert_eq!(options.max_concurrency, 1);
}

#[test]
fn test_effective_hostname_falls_back() {
    let config = NodeConfig::default();
    assert!(!config.effective_hostname().is_empty());
    assert_eq!(config.effective_node_name(), config.effective_hostname());
}

#[test]
fn test_init_writes_defaults_once() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("flockconf.toml");

    let config = NodeConfig::init(&path).unwrap();
    assert_eq!(NodeConfig::load(&path).unwrap().bind_port, config.bind_port);

    std::fs::write(&path, "bind_port = 1").unwrap();
    assert!(NodeConfig::init(&path).is_err());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "bind_port = 1");
}
