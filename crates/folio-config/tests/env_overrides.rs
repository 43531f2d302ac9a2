// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment override tests for `folio-config`.

use folio_config::{ConfigError, FolioConfig, apply_env_overrides, load_config};
use serial_test::serial;

/// Sets FOLIO_* variables for the duration of a test and removes them on drop.
struct EnvGuard {
    keys: Vec<&'static str>,
}

impl EnvGuard {
    fn new(pairs: &[(&'static str, &str)]) -> Self {
        let keys: Vec<&'static str> = pairs.iter().map(|(k, _)| *k).collect();
        for (k, v) in pairs {
            // SAFETY: tests touching the environment are #[serial].
            unsafe { std::env::set_var(k, v) };
        }
        Self { keys }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for k in &self.keys {
            // SAFETY: restoring env on drop, still inside a #[serial] test.
            unsafe { std::env::remove_var(k) };
        }
    }
}

#[test]
#[serial]
fn uri_and_bind_overrides() {
    let _g = EnvGuard::new(&[
        ("FOLIO_DATABASE_URI", "mongodb://env-host:27017/folio"),
        ("FOLIO_BIND", "0.0.0.0:9000"),
        ("FOLIO_LOG_LEVEL", "trace"),
    ]);
    let cfg = load_config(None).unwrap();
    assert_eq!(cfg.database.uri, "mongodb://env-host:27017/folio");
    assert_eq!(cfg.server.bind, "0.0.0.0:9000");
    assert_eq!(cfg.log_level.as_deref(), Some("trace"));
}

#[test]
#[serial]
fn debug_errors_accepts_common_booleans() {
    for (raw, expected) in [("1", true), ("true", true), ("off", false), ("No", false)] {
        let _g = EnvGuard::new(&[("FOLIO_DEBUG_ERRORS", raw)]);
        let mut cfg = FolioConfig::default();
        apply_env_overrides(&mut cfg).unwrap();
        assert_eq!(cfg.server.debug_errors, expected, "{raw}");
    }
}

#[test]
#[serial]
fn bad_numeric_override_is_parse_error() {
    let _g = EnvGuard::new(&[("FOLIO_DB_MAX_RETRIES", "lots")]);
    let mut cfg = FolioConfig::default();
    let err = apply_env_overrides(&mut cfg).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
#[serial]
fn max_retries_override() {
    let _g = EnvGuard::new(&[("FOLIO_DB_MAX_RETRIES", "2")]);
    let cfg = load_config(None).unwrap();
    assert_eq!(cfg.database.max_retries, 2);
}

#[test]
#[serial]
fn env_wins_over_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("folio.toml");
    std::fs::write(&path, "[database]\nuri = \"mongodb://file-host/folio\"\n").unwrap();
    let _g = EnvGuard::new(&[("FOLIO_DATABASE_URI", "mongodb://env-host/folio")]);
    let cfg = load_config(Some(&path)).unwrap();
    assert_eq!(cfg.database.uri, "mongodb://env-host/folio");
}

#[test]
fn schema_exports_database_section() {
    let schema = schemars::schema_for!(FolioConfig);
    let json = serde_json::to_value(&schema).unwrap();
    assert!(json["properties"].get("database").is_some());
}
