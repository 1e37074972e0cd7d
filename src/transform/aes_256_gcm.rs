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

//! AES-256-GCM envelope encryption.
//!
//! A fresh 256-bit data key is generated for every object and used to
//! encrypt it with AES-256-GCM (96-bit random IV, 128-bit tag). The data key
//! itself is wrapped with the master key using RFC 3394 key wrap and stored
//! in the object's materials. The master key is either configured directly
//! or derived from a password with PBKDF2-HMAC-SHA-512.
//!
//! Changing `kdfSalt` or `kdfIterations` after objects exist makes them
//! unrecoverable; the first decapsulation fails loudly.

use openssl::aes::{unwrap_key, wrap_key, AesKey};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use serde::Deserialize;

use crate::config::{module_configuration, ModuleSpec};
use crate::errors::Error;
use crate::transform::{material_bytes, Materials, Transform};
use crate::Result;

pub(crate) const AES_KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AesGcmConfig {
    #[serde(default)]
    master_key: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    kdf_salt: Option<String>,
    #[serde(default)]
    kdf_iterations: Option<u32>,
}

/// Derive a key from a password, PBKDF2-HMAC-SHA-512.
pub(crate) fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
    key_length: usize,
) -> Result<Vec<u8>> {
    let mut key = vec![0u8; key_length];
    pbkdf2_hmac(
        password.as_bytes(),
        salt,
        iterations as usize,
        MessageDigest::sha512(),
        &mut key,
    )?;
    Ok(key)
}

/// Resolve key material from a module configuration: either a base64 raw key
/// of the expected length or password + KDF parameters.
pub(crate) fn key_from_config(
    name: &str,
    raw_key: Option<&str>,
    password: Option<&str>,
    kdf_salt: Option<&str>,
    kdf_iterations: Option<u32>,
    key_length: usize,
) -> Result<Vec<u8>> {
    if let Some(encoded) = raw_key {
        let key = base64::decode(encoded)
            .map_err(|_| Error::config(format!("{}: key is not valid base64", name)))?;
        if key.len() != key_length {
            return Err(Error::config(format!(
                "{}: key must be {} bytes long",
                name, key_length
            )));
        }
        return Ok(key);
    }
    let password = password
        .ok_or_else(|| Error::config(format!("{}: neither key nor password configured", name)))?;
    let salt = kdf_salt
        .ok_or_else(|| Error::config(format!("{}: kdfSalt is required with password", name)))?;
    let salt = base64::decode(salt)
        .map_err(|_| Error::config(format!("{}: kdfSalt is not valid base64", name)))?;
    let iterations = kdf_iterations
        .ok_or_else(|| Error::config(format!("{}: kdfIterations is required with password", name)))?;
    derive_key(password, &salt, iterations, key_length)
}

/// Seal plaintext under a fresh data key. Returns the ciphertext and the
/// materials (IV, tag) shared by both AES transforms.
pub(crate) fn gcm_seal(data_key: &[u8], data: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut iv = [0u8; IV_LEN];
    rand_bytes(&mut iv)?;
    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(
        Cipher::aes_256_gcm(),
        data_key,
        Some(&iv),
        b"",
        data,
        &mut tag,
    )?;
    Ok((ciphertext, iv.to_vec(), tag.to_vec()))
}

pub(crate) fn gcm_open(
    name: &str,
    data_key: &[u8],
    iv: &[u8],
    tag: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    if iv.len() != IV_LEN {
        return Err(Error::Transform {
            name: name.to_owned(),
            reason: format!("IV has wrong length {}, expected {}", iv.len(), IV_LEN),
        });
    }
    decrypt_aead(Cipher::aes_256_gcm(), data_key, Some(iv), b"", data, tag).map_err(|_| {
        Error::Transform {
            name: name.to_owned(),
            reason: "decryption failed, wrong key material or corrupt object".to_owned(),
        }
    })
}

pub struct AesGcmTransform {
    name: String,
    master_key: Vec<u8>,
}

impl AesGcmTransform {
    pub fn new(spec: &ModuleSpec) -> Result<AesGcmTransform> {
        let config: AesGcmConfig = module_configuration(spec)?;
        let master_key = key_from_config(
            &spec.name,
            config.master_key.as_deref(),
            config.password.as_deref(),
            config.kdf_salt.as_deref(),
            config.kdf_iterations,
            AES_KEY_LEN,
        )?;
        Ok(AesGcmTransform {
            name: spec.name.clone(),
            master_key,
        })
    }

    fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>> {
        let key = AesKey::new_encrypt(&self.master_key)
            .map_err(|_| self.key_error("master key rejected by AES"))?;
        let mut wrapped = vec![0u8; data_key.len() + 8];
        wrap_key(&key, None, &mut wrapped, data_key)
            .map_err(|_| self.key_error("key wrap failed"))?;
        Ok(wrapped)
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        if wrapped.len() != AES_KEY_LEN + 8 {
            return Err(self.key_error("wrapped key has the wrong length"));
        }
        let key = AesKey::new_decrypt(&self.master_key)
            .map_err(|_| self.key_error("master key rejected by AES"))?;
        let mut data_key = vec![0u8; AES_KEY_LEN];
        unwrap_key(&key, None, &mut data_key, wrapped)
            .map_err(|_| self.key_error("key unwrap failed, wrong master key material"))?;
        Ok(data_key)
    }

    fn key_error(&self, reason: &str) -> Error {
        Error::Transform {
            name: self.name.clone(),
            reason: reason.to_owned(),
        }
    }
}

impl Transform for AesGcmTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        "aes_256_gcm"
    }

    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>> {
        let mut data_key = [0u8; AES_KEY_LEN];
        rand_bytes(&mut data_key)?;
        let wrapped = self.wrap(&data_key)?;
        let (ciphertext, iv, tag) = gcm_seal(&data_key, data)?;
        let mut materials = Materials::new();
        materials.insert("envelope_key".to_owned(), base64::encode(&wrapped).into());
        materials.insert("iv".to_owned(), base64::encode(&iv).into());
        materials.insert("tag".to_owned(), base64::encode(&tag).into());
        Ok(Some((ciphertext, materials)))
    }

    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>> {
        let wrapped = material_bytes(materials, "envelope_key", &self.name)?;
        let iv = material_bytes(materials, "iv", &self.name)?;
        let tag = material_bytes(materials, "tag", &self.name)?;
        let data_key = self.unwrap(&wrapped)?;
        gcm_open(&self.name, &data_key, &iv, &tag, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ModuleSpec {
        ModuleSpec {
            name: "encrypt".to_owned(),
            module: "aes_256_gcm".to_owned(),
            configuration: serde_yaml::from_str(yaml).unwrap(),
        }
    }

    fn password_spec() -> ModuleSpec {
        spec("password: secret\nkdfSalt: AAAAAAAAAAAAAAAA\nkdfIterations: 100")
    }

    #[test]
    fn round_trip() {
        let t = AesGcmTransform::new(&password_spec()).unwrap();
        let data = b"block content".to_vec();
        let (ciphertext, materials) = t.encapsulate(&data).unwrap().unwrap();
        assert_ne!(ciphertext, data);
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), data);
    }

    #[test]
    fn ciphertexts_differ_per_write() {
        let t = AesGcmTransform::new(&password_spec()).unwrap();
        let data = b"same plaintext".to_vec();
        let (c1, _) = t.encapsulate(&data).unwrap().unwrap();
        let (c2, _) = t.encapsulate(&data).unwrap().unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn wrong_kdf_parameters_fail_loudly() {
        let t1 = AesGcmTransform::new(&password_spec()).unwrap();
        let t2 = AesGcmTransform::new(&spec(
            "password: secret\nkdfSalt: AAAAAAAAAAAAAAAA\nkdfIterations: 101",
        ))
        .unwrap();
        let (ciphertext, materials) = t1.encapsulate(b"data").unwrap().unwrap();
        assert!(t2.decapsulate(&ciphertext, &materials).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let t = AesGcmTransform::new(&password_spec()).unwrap();
        let (mut ciphertext, materials) = t.encapsulate(b"data").unwrap().unwrap();
        ciphertext[0] ^= 0x01;
        assert!(t.decapsulate(&ciphertext, &materials).is_err());
    }

    #[test]
    fn raw_master_key_accepted() {
        let t = AesGcmTransform::new(&spec(&format!(
            "masterKey: {}",
            base64::encode([0x11u8; 32])
        )))
        .unwrap();
        let (ciphertext, materials) = t.encapsulate(b"data").unwrap().unwrap();
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), b"data");
    }

    #[test]
    fn short_master_key_rejected() {
        assert!(AesGcmTransform::new(&spec(&format!(
            "masterKey: {}",
            base64::encode([0x11u8; 16])
        )))
        .is_err());
    }
}
