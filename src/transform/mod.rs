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

//! Reversible per-object transforms: compression and encryption.
//!
//! A storage applies its configured transforms in order on write and stores
//! the names of the transforms actually applied in the object's metadata
//! sidecar, together with per-object materials (IVs, wrapped keys). Reads
//! compose the inverses in reverse order from the recorded list, so the
//! configured list may change without breaking old objects.

pub mod aes_256_gcm;
pub mod aes_256_gcm_ecc;
pub mod zstd;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ModuleSpec;
use crate::errors::Error;
use crate::Result;

/// Per-object headers a transform needs to invert itself.
pub type Materials = serde_json::Map<String, serde_json::Value>;

pub trait Transform: Send + Sync {
    /// Configured instance name.
    fn name(&self) -> &str;

    /// Module identifier, recorded in the sidecar next to the name.
    fn module(&self) -> &'static str;

    /// Apply the transform. Returning `None` declines: the data is passed on
    /// unchanged and the transform is not recorded (e.g. incompressible
    /// input).
    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>>;

    /// Invert a previous `encapsulate`.
    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>>;
}

/// Sidecar record of one applied transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRecord {
    pub name: String,
    pub module: String,
    pub materials: Materials,
}

/// All configured transforms, resolved by instance name.
pub struct TransformRegistry {
    by_name: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn from_config(specs: &[ModuleSpec]) -> Result<TransformRegistry> {
        let mut by_name: HashMap<String, Arc<dyn Transform>> = HashMap::new();
        for spec in specs {
            let transform: Arc<dyn Transform> = match spec.module.as_str() {
                "zstd" => Arc::new(zstd::ZstdTransform::new(spec)?),
                "aes_256_gcm" => Arc::new(aes_256_gcm::AesGcmTransform::new(spec)?),
                "aes_256_gcm_ecc" => Arc::new(aes_256_gcm_ecc::AesGcmEccTransform::new(spec)?),
                other => {
                    return Err(Error::config(format!(
                        "unknown transform module {:?}",
                        other
                    )));
                }
            };
            by_name.insert(spec.name.clone(), transform);
        }
        Ok(TransformRegistry { by_name })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Transform>> {
        self.by_name.get(name).ok_or_else(|| Error::NotFound {
            kind: "transform",
            name: name.to_owned(),
        })
    }

    /// Resolve an ordered list of active transform names.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Transform>>> {
        names
            .iter()
            .map(|name| self.get(name).cloned())
            .collect()
    }
}

/// Apply an ordered transform chain. Transforms that decline are skipped and
/// not recorded.
pub fn encapsulate(
    chain: &[Arc<dyn Transform>],
    data: Vec<u8>,
) -> Result<(Vec<u8>, Vec<TransformRecord>)> {
    let mut data = data;
    let mut records = Vec::new();
    for transform in chain {
        if let Some((encapsulated, materials)) = transform.encapsulate(&data)? {
            records.push(TransformRecord {
                name: transform.name().to_owned(),
                module: transform.module().to_owned(),
                materials,
            });
            data = encapsulated;
        }
    }
    Ok((data, records))
}

/// Invert a recorded transform chain, in reverse order of application.
pub fn decapsulate(
    registry: &TransformRegistry,
    records: &[TransformRecord],
    data: Vec<u8>,
) -> Result<Vec<u8>> {
    let mut data = data;
    for record in records.iter().rev() {
        let transform = registry.get(&record.name).map_err(|_| Error::Transform {
            name: record.name.clone(),
            reason: "transform from object metadata is not configured".to_owned(),
        })?;
        if transform.module() != record.module {
            return Err(Error::Transform {
                name: record.name.clone(),
                reason: format!(
                    "configured module {} does not match object module {}",
                    transform.module(),
                    record.module
                ),
            });
        }
        data = transform.decapsulate(&data, &record.materials)?;
    }
    Ok(data)
}

pub(crate) fn material_bytes(materials: &Materials, key: &str, name: &str) -> Result<Vec<u8>> {
    let encoded = materials
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Transform {
            name: name.to_owned(),
            reason: format!("materials are missing required key {:?}", key),
        })?;
    base64::decode(encoded).map_err(|_| Error::Transform {
        name: name.to_owned(),
        reason: format!("materials key {:?} is not valid base64", key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn spec(name: &str, module: &str, yaml: &str) -> ModuleSpec {
        ModuleSpec {
            name: name.to_owned(),
            module: module.to_owned(),
            configuration: serde_yaml::from_str::<Value>(yaml).unwrap(),
        }
    }

    #[test]
    fn chain_records_only_applied_transforms() {
        let registry = TransformRegistry::from_config(&[spec("zstd", "zstd", "level: 1")]).unwrap();
        let chain = registry.resolve(&["zstd".to_owned()]).unwrap();

        // Compressible data is recorded.
        let data = vec![7u8; 64 * 1024];
        let (encapsulated, records) = encapsulate(&chain, data.clone()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(encapsulated.len() < data.len());
        let restored = decapsulate(&registry, &records, encapsulated).unwrap();
        assert_eq!(restored, data);

        // Incompressible (tiny, high-entropy) data is passed through.
        let data = vec![1, 2, 3];
        let (encapsulated, records) = encapsulate(&chain, data.clone()).unwrap();
        assert!(records.is_empty());
        assert_eq!(encapsulated, data);
    }

    #[test]
    fn decapsulate_rejects_unknown_transform() {
        let registry = TransformRegistry::from_config(&[]).unwrap();
        let records = vec![TransformRecord {
            name: "zstd".to_owned(),
            module: "zstd".to_owned(),
            materials: Materials::new(),
        }];
        assert!(decapsulate(&registry, &records, vec![1, 2, 3]).is_err());
    }
}
