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

//! AES-256-GCM with ECIES key encapsulation.
//!
//! The symmetric layer is identical to `aes_256_gcm`; the per-object data
//! key is instead derived via ECDH against a configured NIST-curve key. An
//! ephemeral key pair is generated per object, the shared point is hashed
//! into the data key, and only the ephemeral public key is stored in the
//! materials. Writing therefore needs just the configured public key, which
//! enables write-only backup instances; decryption requires the private key.

use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::nid::Nid;
use openssl::pkey::{Private, Public};
use openssl::sha::Sha256;
use serde::Deserialize;

use crate::config::{module_configuration, ModuleSpec};
use crate::errors::Error;
use crate::transform::aes_256_gcm::{gcm_open, gcm_seal, AES_KEY_LEN};
use crate::transform::{material_bytes, Materials, Transform};
use crate::Result;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EccConfig {
    /// Base64 DER key: SubjectPublicKeyInfo for write-only instances, or a
    /// full EC private key for instances that also restore.
    ecc_key: String,
    #[serde(default = "default_curve")]
    ecc_curve: String,
}

fn default_curve() -> String {
    "NIST P-384".to_owned()
}

fn curve_nid(name: &str) -> Result<Nid> {
    match name {
        "NIST P-256" => Ok(Nid::X9_62_PRIME256V1),
        "NIST P-384" => Ok(Nid::SECP384R1),
        "NIST P-521" => Ok(Nid::SECP521R1),
        other => Err(Error::config(format!("unsupported ECC curve {:?}", other))),
    }
}

enum EccKey {
    Private(EcKey<Private>),
    Public(EcKey<Public>),
}

pub struct AesGcmEccTransform {
    name: String,
    group: EcGroup,
    key: EccKey,
}

impl AesGcmEccTransform {
    pub fn new(spec: &ModuleSpec) -> Result<AesGcmEccTransform> {
        let config: EccConfig = module_configuration(spec)?;
        let group = EcGroup::from_curve_name(curve_nid(&config.ecc_curve)?)?;
        let der = base64::decode(&config.ecc_key)
            .map_err(|_| Error::config(format!("{}: EccKey is not valid base64", spec.name)))?;
        let key = match EcKey::private_key_from_der(&der) {
            Ok(private) => EccKey::Private(private),
            Err(_) => EccKey::Public(EcKey::public_key_from_der(&der).map_err(|_| {
                Error::config(format!(
                    "{}: EccKey is neither an EC private nor public key",
                    spec.name
                ))
            })?),
        };
        let configured_group = match &key {
            EccKey::Private(k) => k.group().curve_name(),
            EccKey::Public(k) => k.group().curve_name(),
        };
        if configured_group != group.curve_name() {
            return Err(Error::config(format!(
                "{}: EccKey does not match the EccCurve setting",
                spec.name
            )));
        }
        Ok(AesGcmEccTransform {
            name: spec.name.clone(),
            group,
            key,
        })
    }

    fn field_bytes(&self) -> usize {
        (self.group.degree() as usize + 7) / 8
    }

    /// Hash the affine coordinates of a shared point into a data key.
    fn point_to_key(&self, point: &EcPoint) -> Result<Vec<u8>> {
        let mut ctx = BigNumContext::new()?;
        let mut x = openssl::bn::BigNum::new()?;
        let mut y = openssl::bn::BigNum::new()?;
        point.affine_coordinates_gfp(&self.group, &mut x, &mut y, &mut ctx)?;
        let size = self.field_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&x.to_vec_padded(size as i32)?);
        hasher.update(&y.to_vec_padded(size as i32)?);
        Ok(hasher.finish().to_vec())
    }

    fn public_point(&self) -> &openssl::ec::EcPointRef {
        match &self.key {
            EccKey::Private(k) => k.public_key(),
            EccKey::Public(k) => k.public_key(),
        }
    }

    /// Fresh data key plus the serialized ephemeral public key.
    fn create_envelope_key(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let ephemeral = EcKey::generate(&self.group)?;
        let mut ctx = BigNumContext::new()?;
        let mut shared = EcPoint::new(&self.group)?;
        shared.mul(
            &self.group,
            self.public_point(),
            ephemeral.private_key(),
            &ctx,
        )?;
        let data_key = self.point_to_key(&shared)?;
        let packed = ephemeral.public_key().to_bytes(
            &self.group,
            PointConversionForm::COMPRESSED,
            &mut ctx,
        )?;
        Ok((data_key, packed))
    }

    /// Recompute the data key from a stored ephemeral public key. Requires
    /// the private half of the configured key.
    fn derive_envelope_key(&self, packed: &[u8]) -> Result<Vec<u8>> {
        let private = match &self.key {
            EccKey::Private(k) => k,
            EccKey::Public(_) => {
                return Err(Error::Transform {
                    name: self.name.clone(),
                    reason: "configured EccKey has no private part, cannot decrypt".to_owned(),
                });
            }
        };
        let mut ctx = BigNumContext::new()?;
        let ephemeral =
            EcPoint::from_bytes(&self.group, packed, &mut ctx).map_err(|_| Error::Transform {
                name: self.name.clone(),
                reason: "stored ephemeral key is not a point on the configured curve".to_owned(),
            })?;
        let mut shared = EcPoint::new(&self.group)?;
        shared.mul(&self.group, &ephemeral, private.private_key(), &ctx)?;
        self.point_to_key(&shared)
    }
}

impl Transform for AesGcmEccTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        "aes_256_gcm_ecc"
    }

    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>> {
        let (data_key, packed) = self.create_envelope_key()?;
        debug_assert_eq!(data_key.len(), AES_KEY_LEN);
        let (ciphertext, iv, tag) = gcm_seal(&data_key, data)?;
        let mut materials = Materials::new();
        materials.insert("envelope_key".to_owned(), base64::encode(&packed).into());
        materials.insert("iv".to_owned(), base64::encode(&iv).into());
        materials.insert("tag".to_owned(), base64::encode(&tag).into());
        Ok(Some((ciphertext, materials)))
    }

    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>> {
        let packed = material_bytes(materials, "envelope_key", &self.name)?;
        let iv = material_bytes(materials, "iv", &self.name)?;
        let tag = material_bytes(materials, "tag", &self.name)?;
        let data_key = self.derive_envelope_key(&packed)?;
        gcm_open(&self.name, &data_key, &iv, &tag, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generated_keys(nid: Nid) -> (String, String) {
        let group = EcGroup::from_curve_name(nid).unwrap();
        let private = EcKey::generate(&group).unwrap();
        let private_der = private.private_key_to_der().unwrap();
        let public = EcKey::from_public_key(&group, private.public_key()).unwrap();
        let public_der = public.public_key_to_der().unwrap();
        (base64::encode(&private_der), base64::encode(&public_der))
    }

    fn spec(key: &str, curve: &str) -> ModuleSpec {
        ModuleSpec {
            name: "ecc".to_owned(),
            module: "aes_256_gcm_ecc".to_owned(),
            configuration: serde_yaml::from_str(&format!(
                "eccKey: {}\neccCurve: {}",
                key, curve
            ))
            .unwrap(),
        }
    }

    #[test]
    fn round_trip_with_private_key() {
        let (private_key, _) = generated_keys(Nid::SECP384R1);
        let t = AesGcmEccTransform::new(&spec(&private_key, "NIST P-384")).unwrap();
        let data = b"block content".to_vec();
        let (ciphertext, materials) = t.encapsulate(&data).unwrap().unwrap();
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), data);
    }

    #[test]
    fn public_key_writes_but_cannot_read() {
        let (private_key, public_key) = generated_keys(Nid::X9_62_PRIME256V1);
        let writer = AesGcmEccTransform::new(&spec(&public_key, "NIST P-256")).unwrap();
        let reader = AesGcmEccTransform::new(&spec(&private_key, "NIST P-256")).unwrap();

        let data = b"write-only instance".to_vec();
        let (ciphertext, materials) = writer.encapsulate(&data).unwrap().unwrap();
        // The write-only instance cannot decrypt its own output.
        assert!(writer.decapsulate(&ciphertext, &materials).is_err());
        // The holder of the private key can.
        assert_eq!(reader.decapsulate(&ciphertext, &materials).unwrap(), data);
    }

    #[test]
    fn curve_mismatch_rejected() {
        let (private_key, _) = generated_keys(Nid::SECP384R1);
        assert!(AesGcmEccTransform::new(&spec(&private_key, "NIST P-256")).is_err());
    }
}
