use std::fs;

use tempfile::tempdir;

use crate::{generate_default_config, load_config};

#[test]
fn missing_file_yields_defaults() {
    let dir = tempdir().unwrap();

    let cfg = load_config(&dir.path().join("nope.toml")).unwrap();
    assert_eq!(cfg.server.port, 33334);
    assert_eq!(cfg.server.timeout_secs, 5);
    assert!(!cfg.server.allow_public);
    assert_eq!(cfg.server.max_connections, 1000);
    assert_eq!(cfg.database.path, "./data");
    assert_eq!(cfg.logging.level, "info");
    assert!(cfg.logging.file.is_none());
}

#[test]
fn file_overrides_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let toml = r#"
        [server]
        port = 9000
        allow_public = true

        [database]
        path = "/tmp/moustique-test"

        [security]
        admin_password = "hunter2"
    "#;
    fs::write(&path, toml).unwrap();

    let cfg = load_config(&path).unwrap();
    assert_eq!(cfg.server.port, 9000);
    assert!(cfg.server.allow_public);
    assert_eq!(cfg.database.path, "/tmp/moustique-test");
    assert_eq!(cfg.security.admin_password, "hunter2");

    // Untouched values keep their defaults.
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.timeout_secs, 5);
    assert_eq!(cfg.logging.level, "info");
}

#[test]
fn generated_config_loads_back_as_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");

    generate_default_config(&path).unwrap();

    let cfg = load_config(&path).unwrap();
    assert_eq!(cfg.server.port, 33334);
    assert!(!cfg.server.allow_public);
    assert_eq!(
        cfg.security.allowed_peers,
        ["172.16.0.0/12", "192.168.0.0/16"]
    );
    assert_eq!(cfg.security.admin_password, "admin123");
}
