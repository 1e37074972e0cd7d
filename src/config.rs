// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! Configuration model.
//!
//! A single YAML document configures the engine. The default search order is
//! `/etc/benji.yaml`, `/etc/benji/benji.yaml`, `~/.benji.yaml`,
//! `~/benji.yaml`; a path given with `-c` overrides the search.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::Error;
use crate::Result;

pub const SUPPORTED_CONFIGURATION_VERSION: &str = "1";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub configuration_version: String,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default = "default_block_size")]
    pub block_size: u32,

    #[serde(default = "default_hash_function")]
    pub hash_function: String,

    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Versions younger than this many days are refused for removal unless
    /// forced.
    #[serde(default = "default_disallow_remove_when_younger")]
    pub disallow_remove_when_younger: u32,

    /// Grace window before deletion candidates become eligible for physical
    /// deletion during cleanup.
    #[serde(default = "default_cleanup_grace_minutes")]
    pub cleanup_grace_minutes: u64,

    /// Database connection URL. `sqlite:///path/to.db` or `sqlite://:memory:`.
    pub database_engine: String,

    #[serde(default)]
    pub ios: Vec<ModuleSpec>,

    pub storages: Vec<ModuleSpec>,

    pub default_storage: String,

    #[serde(default)]
    pub transforms: Vec<ModuleSpec>,

    #[serde(default)]
    pub nbd: NbdConfig,
}

fn default_block_size() -> u32 {
    crate::DEFAULT_BLOCK_SIZE
}

fn default_hash_function() -> String {
    crate::DEFAULT_HASH_FUNCTION.to_owned()
}

fn default_process_name() -> String {
    "benji".to_owned()
}

fn default_disallow_remove_when_younger() -> u32 {
    6
}

fn default_cleanup_grace_minutes() -> u64 {
    60
}

/// One entry of `ios`, `storages`, or `transforms`: a name bound to a module
/// with a module-specific configuration block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub configuration: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NbdConfig {
    #[serde(default)]
    pub block_cache: Option<CacheConfig>,
    #[serde(default)]
    pub cow_store: Option<CowStoreConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub maximum_size: u64,
    #[serde(default = "default_cache_shards")]
    pub shards: u32,
}

fn default_cache_shards() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CowStoreConfig {
    pub directory: PathBuf,
}

impl Config {
    /// Load the configuration, either from an explicit path or by searching
    /// the default locations.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let path = match explicit {
            Some(p) => p.to_owned(),
            None => Config::search()?,
        };
        let raw = fs::read_to_string(&path)
            .map_err(|source| Error::io(path.display().to_string(), source))?;
        Config::parse(&raw)
    }

    fn search() -> Result<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("/etc/benji.yaml"),
            PathBuf::from("/etc/benji/benji.yaml"),
        ];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".benji.yaml"));
            candidates.push(home.join("benji.yaml"));
        }
        candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| Error::config("no configuration file found"))
    }

    /// Parse and validate a YAML document.
    pub fn parse(raw: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|err| Error::config(format!("malformed configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.configuration_version != SUPPORTED_CONFIGURATION_VERSION {
            return Err(Error::config(format!(
                "unsupported configuration version {:?}, expected {:?}",
                self.configuration_version, SUPPORTED_CONFIGURATION_VERSION
            )));
        }
        if self.block_size == 0 {
            return Err(Error::config("blockSize must be positive"));
        }
        if !self.block_size.is_power_of_two() {
            tracing::warn!(
                block_size = self.block_size,
                "blockSize is not a power of two"
            );
        }
        if self.storages.is_empty() {
            return Err(Error::config("at least one storage must be configured"));
        }
        if !self.storages.iter().any(|s| s.name == self.default_storage) {
            return Err(Error::config(format!(
                "default storage {:?} is undefined",
                self.default_storage
            )));
        }
        for (section, specs) in [
            ("storages", &self.storages),
            ("ios", &self.ios),
            ("transforms", &self.transforms),
        ] {
            let mut seen = std::collections::HashSet::new();
            for spec in specs {
                if !seen.insert(spec.name.as_str()) {
                    return Err(Error::config(format!(
                        "duplicate name {:?} in {}",
                        spec.name, section
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn io_spec(&self, name: &str) -> Option<&ModuleSpec> {
        self.ios.iter().find(|s| s.name == name)
    }

    pub fn storage_spec(&self, name: &str) -> Option<&ModuleSpec> {
        self.storages.iter().find(|s| s.name == name)
    }
}

/// Deserialize a module-specific configuration block into a typed struct.
pub fn module_configuration<T: serde::de::DeserializeOwned + Default>(
    spec: &ModuleSpec,
) -> Result<T> {
    if spec.configuration.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(spec.configuration.clone()).map_err(|err| {
        Error::config(format!(
            "invalid configuration for module {:?}: {}",
            spec.name, err
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
configurationVersion: '1'
databaseEngine: 'sqlite://:memory:'
defaultStorage: local
storages:
  - name: local
    module: file
    configuration:
      path: /tmp/benji-objects
"#;

    #[test]
    fn parse_minimal() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.block_size, crate::DEFAULT_BLOCK_SIZE);
        assert_eq!(config.hash_function, crate::DEFAULT_HASH_FUNCTION);
        assert_eq!(config.disallow_remove_when_younger, 6);
        assert_eq!(config.cleanup_grace_minutes, 60);
        assert_eq!(config.default_storage, "local");
    }

    #[test]
    fn rejects_wrong_version() {
        let raw = MINIMAL.replace("'1'", "'2'");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn rejects_unknown_default_storage() {
        let raw = MINIMAL.replace("defaultStorage: local", "defaultStorage: other");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn rejects_duplicate_storage_names() {
        let raw = format!(
            "{}  - name: local\n    module: file\n    configuration:\n      path: /tmp/x\n",
            MINIMAL
        );
        assert!(Config::parse(&raw).is_err());
    }
}
