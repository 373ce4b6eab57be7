//! Integration tests for loading chain-state configuration from disk

use chainstate_proof::*;
use std::io::Write;

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{ "script_workers": 2, "concurrent_script_validation": false, "max_rollback_depth": 10 }}"#
    )
    .unwrap();

    let config = ChainStateConfig::load(file.path()).unwrap();
    assert_eq!(config.script_workers, 2);
    assert!(!config.concurrent_script_validation);
    assert_eq!(config.max_rollback_depth, 10);
    assert_eq!(config.flush_interval, DEFAULT_FLUSH_INTERVAL);
    assert_eq!(config.script_queue_capacity, DEFAULT_SCRIPT_QUEUE_CAPACITY);
}

#[test]
fn test_load_reports_path_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chainstate.json");

    let err = ChainStateConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("chainstate.json"));

    std::fs::write(&path, r#"{ "script_queue_capacity": 0 }"#).unwrap();
    let err = ChainStateConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("script_queue_capacity"));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = ChainStateConfig {
        script_workers: 3,
        concurrent_script_validation: true,
        script_queue_capacity: 64,
        flush_interval: 7,
        max_rollback_depth: 0,
    };
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(ChainStateConfig::from_json_str(&json).unwrap(), config);
}
