//! Shared setup for tests against a real Python interpreter.

use std::fs;
use std::time::Duration;

use pysnip_core::config::{BrokerConfig, RuntimeConfig, SUPPORT_PACKAGES};
use tempfile::TempDir;

/// A runtime config whose lock manifest lives in a temp dir.
///
/// The manifest URLs are placeholders: the tests expect the support
/// packages to be importable already, so nothing gets installed.
pub struct TestRuntime {
    _temp_dir: TempDir,
    pub config: RuntimeConfig,
}

impl TestRuntime {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let packages: serde_json::Map<String, serde_json::Value> = SUPPORT_PACKAGES
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    serde_json::json!({ "file_name": format!("https://invalid.example/{}.whl", name) }),
                )
            })
            .collect();
        let manifest = serde_json::json!({ "packages": packages });

        let lock_file = temp_dir.path().join("pysnip-lock.json");
        fs::write(&lock_file, manifest.to_string()).expect("Failed to write lock manifest");

        let config = RuntimeConfig {
            lock_file,
            scratch_root: Some(temp_dir.path().to_path_buf()),
            ..RuntimeConfig::from_env()
        };

        Self {
            _temp_dir: temp_dir,
            config,
        }
    }
}

/// Generous start budget for a cold interpreter, short settle budget.
pub fn test_broker_config() -> BrokerConfig {
    BrokerConfig {
        start_timeout: Duration::from_secs(60),
        settle_timeout: Duration::from_secs(2),
    }
}
