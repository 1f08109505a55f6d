//! Lock manifest consumed at load time.
//!
//! The manifest is produced ahead of time and lists each installable
//! support package with its resolved download location:
//!
//! ```json
//! { "packages": { "mypy": { "name": "mypy", "file_name": "https://.../mypy.whl", "imports": ["mypy"] } } }
//! ```
//!
//! Unknown fields are ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockManifest {
    #[serde(default)]
    packages: BTreeMap<String, LockedPackage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockedPackage {
    /// Resolved download URL.
    #[serde(alias = "url")]
    pub file_name: String,
    /// Top-level modules the package provides.
    #[serde(default)]
    pub imports: Vec<String>,
}

/// A support package ready to be installed into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSource {
    pub name: String,
    pub url: String,
    /// Module imported to test whether the package is present.
    pub module: String,
}

impl LockManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Look up a package by name, ignoring case and `-`/`_` differences.
    pub fn get(&self, name: &str) -> Option<&LockedPackage> {
        let wanted = normalize(name);
        self.packages
            .iter()
            .find(|(key, _)| normalize(key) == wanted)
            .map(|(_, package)| package)
    }

    /// Resolve every required package, failing on the first one missing.
    pub fn resolve(&self, required: &[String]) -> Result<Vec<PackageSource>> {
        required
            .iter()
            .map(|name| {
                let package = self.get(name).ok_or_else(|| {
                    Error::Manifest(format!("package '{}' is not in the lock manifest", name))
                })?;
                let module = package
                    .imports
                    .first()
                    .cloned()
                    .unwrap_or_else(|| name.replace('-', "_"));
                Ok(PackageSource {
                    name: name.clone(),
                    url: package.file_name.clone(),
                    module,
                })
            })
            .collect()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}
