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

//! zstd compression transform.

use serde::Deserialize;

use crate::config::{module_configuration, ModuleSpec};
use crate::errors::Error;
use crate::transform::{Materials, Transform};
use crate::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ZstdConfig {
    #[serde(default = "default_level")]
    level: i32,
    #[serde(default)]
    dict_data_file: Option<std::path::PathBuf>,
}

impl Default for ZstdConfig {
    fn default() -> Self {
        ZstdConfig {
            level: default_level(),
            dict_data_file: None,
        }
    }
}

fn default_level() -> i32 {
    1
}

pub struct ZstdTransform {
    name: String,
    level: i32,
    dictionary: Option<Vec<u8>>,
}

impl ZstdTransform {
    pub fn new(spec: &ModuleSpec) -> Result<ZstdTransform> {
        let config: ZstdConfig = module_configuration(spec)?;
        if !(1..=22).contains(&config.level) {
            return Err(Error::config(format!(
                "zstd level {} is out of range (1..=22)",
                config.level
            )));
        }
        let dictionary = match &config.dict_data_file {
            Some(path) => Some(
                std::fs::read(path)
                    .map_err(|source| Error::io(path.display().to_string(), source))?,
            ),
            None => None,
        };
        Ok(ZstdTransform {
            name: spec.name.clone(),
            level: config.level,
            dictionary,
        })
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let result = match &self.dictionary {
            Some(dict) => {
                let mut compressor = zstd::bulk::Compressor::with_dictionary(self.level, dict)
                    .map_err(|err| self.error(err))?;
                compressor.compress(data)
            }
            None => zstd::bulk::compress(data, self.level),
        };
        result.map_err(|err| self.error(err))
    }

    fn decompress(&self, data: &[u8], capacity: usize) -> Result<Vec<u8>> {
        let result = match &self.dictionary {
            Some(dict) => {
                let mut decompressor = zstd::bulk::Decompressor::with_dictionary(dict)
                    .map_err(|err| self.error(err))?;
                decompressor.decompress(data, capacity)
            }
            None => zstd::bulk::decompress(data, capacity),
        };
        result.map_err(|err| self.error(err))
    }

    fn error(&self, err: std::io::Error) -> Error {
        Error::Transform {
            name: self.name.clone(),
            reason: err.to_string(),
        }
    }
}

impl Transform for ZstdTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        "zstd"
    }

    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>> {
        let compressed = self.compress(data)?;
        // Storing an incompressible block compressed would waste space and
        // CPU on every read; decline instead.
        if compressed.len() >= data.len() {
            return Ok(None);
        }
        let mut materials = Materials::new();
        materials.insert("original_size".to_owned(), data.len().into());
        Ok(Some((compressed, materials)))
    }

    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>> {
        let original_size = materials
            .get("original_size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Transform {
                name: self.name.clone(),
                reason: "materials are missing required key \"original_size\"".to_owned(),
            })?;
        let decompressed = self.decompress(data, original_size as usize)?;
        if decompressed.len() as u64 != original_size {
            return Err(Error::Transform {
                name: self.name.clone(),
                reason: format!(
                    "decompressed to {} bytes, expected {}",
                    decompressed.len(),
                    original_size
                ),
            });
        }
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(level: i32) -> ZstdTransform {
        ZstdTransform {
            name: "zstd".to_owned(),
            level,
            dictionary: None,
        }
    }

    #[test]
    fn round_trip() {
        let t = transform(3);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
        let (compressed, materials) = t.encapsulate(&data).unwrap().unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(t.decapsulate(&compressed, &materials).unwrap(), data);
    }

    #[test]
    fn declines_incompressible() {
        let t = transform(3);
        assert!(t.encapsulate(&[0x42]).unwrap().is_none());
    }

    #[test]
    fn rejects_missing_materials() {
        let t = transform(3);
        assert!(t.decapsulate(&[1, 2, 3], &Materials::new()).is_err());
    }

    #[test]
    fn rejects_bad_level() {
        let spec = ModuleSpec {
            name: "zstd".to_owned(),
            module: "zstd".to_owned(),
            configuration: serde_yaml::from_str("level: 99").unwrap(),
        };
        assert!(ZstdTransform::new(&spec).is_err());
    }
}
