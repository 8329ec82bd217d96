// # Record Codec
//
// Encodes entities into record bytes: a 1-byte flags prefix followed by a
// self-describing MessagePack map of `id`, user fields and `__version`.
// Flag bit 0 marks gzip compression, bit 1 AES-GCM encryption (tag and
// 12-byte nonce appended to the ciphertext), bit 2 is reserved.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use aes_gcm::{Aes256Gcm, AesGcm};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;

use crate::error::{DbError, Result};
use crate::value::{Entity, Value, ID_FIELD, VERSION_FIELD};

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Payloads below this size are never compressed.
const MIN_COMPRESS_SIZE: usize = 64;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

type Aes128Gcm = AesGcm<Aes128, aes_gcm::aead::consts::U12>;
type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;

enum CipherKind {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// AES-GCM record encryption with a 128/192/256-bit key.
pub struct EncryptionService {
    cipher: CipherKind,
}

impl EncryptionService {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = match key.len() {
            16 => CipherKind::Aes128(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| DbError::Encryption(e.to_string()))?,
            ),
            24 => CipherKind::Aes192(
                Aes192Gcm::new_from_slice(key)
                    .map_err(|e| DbError::Encryption(e.to_string()))?,
            ),
            32 => CipherKind::Aes256(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| DbError::Encryption(e.to_string()))?,
            ),
            other => {
                return Err(DbError::Encryption(format!(
                    "key must be 16, 24 or 32 bytes, got {other}"
                )))
            }
        };
        Ok(Self { cipher })
    }

    /// Encrypt `plain`; output layout is `ciphertext || tag || nonce`.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let mut out = match &self.cipher {
            CipherKind::Aes128(c) => c.encrypt(nonce, plain),
            CipherKind::Aes192(c) => c.encrypt(nonce, plain),
            CipherKind::Aes256(c) => c.encrypt(nonce, plain),
        }
        .map_err(|_| DbError::Encryption("encryption failed".to_string()))?;
        out.extend_from_slice(&nonce_bytes);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(DbError::Encryption("ciphertext too short".to_string()));
        }
        let (body, nonce_bytes) = data.split_at(data.len() - NONCE_LEN);
        let nonce = GenericArray::from_slice(nonce_bytes);

        match &self.cipher {
            CipherKind::Aes128(c) => c.decrypt(nonce, body),
            CipherKind::Aes192(c) => c.decrypt(nonce, body),
            CipherKind::Aes256(c) => c.decrypt(nonce, body),
        }
        .map_err(|_| DbError::Encryption("decryption failed: bad key or corrupt data".to_string()))
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self.cipher {
            CipherKind::Aes128(_) => 128,
            CipherKind::Aes192(_) => 192,
            CipherKind::Aes256(_) => 256,
        };
        write!(f, "EncryptionService(aes-{bits}-gcm)")
    }
}

/// Entity <-> record bytes translation for one collection.
#[derive(Clone)]
pub struct RecordCodec {
    compression_level: Option<u32>,
    encryption: Option<Arc<EncryptionService>>,
    max_entity_size: usize,
}

impl RecordCodec {
    pub fn new(
        compression_level: Option<u32>,
        encryption: Option<Arc<EncryptionService>>,
        max_entity_size: usize,
    ) -> Self {
        Self {
            compression_level,
            encryption,
            max_entity_size,
        }
    }

    pub fn encode(&self, entity: &Entity) -> Result<Vec<u8>> {
        let mut map = BTreeMap::new();
        map.insert(ID_FIELD.to_string(), Value::String(entity.id.clone()));
        for (k, v) in &entity.fields {
            map.insert(k.clone(), v.clone());
        }
        map.insert(
            VERSION_FIELD.to_string(),
            Value::Int(entity.version as i64),
        );

        let mut body = rmp_serde::to_vec(&Value::Map(map))?;
        let mut flags = 0u8;

        if let Some(level) = self.compression_level {
            if body.len() >= MIN_COMPRESS_SIZE {
                let mut enc = GzEncoder::new(Vec::new(), Compression::new(level));
                enc.write_all(&body)?;
                body = enc.finish()?;
                flags |= FLAG_COMPRESSED;
            }
        }

        if let Some(service) = &self.encryption {
            body = service.encrypt(&body)?;
            flags |= FLAG_ENCRYPTED;
        }

        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(flags);
        out.extend_from_slice(&body);

        if out.len() > self.max_entity_size {
            return Err(DbError::EntityTooLarge {
                size: out.len(),
                limit: self.max_entity_size,
            });
        }
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Entity> {
        let (&flags, mut body) = bytes
            .split_first()
            .ok_or_else(|| DbError::Corruption("empty record".to_string()))?;

        let decrypted;
        if flags & FLAG_ENCRYPTED != 0 {
            let service = self.encryption.as_ref().ok_or_else(|| {
                DbError::Encryption("record is encrypted but no key is configured".to_string())
            })?;
            decrypted = service.decrypt(body)?;
            body = &decrypted;
        }

        let decompressed;
        if flags & FLAG_COMPRESSED != 0 {
            let mut dec = GzDecoder::new(body);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            decompressed = out;
            body = &decompressed;
        }

        let value: Value = rmp_serde::from_slice(body)?;
        let mut map = match value {
            Value::Map(m) => m,
            other => {
                return Err(DbError::Corruption(format!(
                    "record is not a map: {other:?}"
                )))
            }
        };

        let id = match map.remove(ID_FIELD) {
            Some(Value::String(s)) => s,
            _ => return Err(DbError::Corruption("record has no id".to_string())),
        };
        let version = match map.remove(VERSION_FIELD) {
            Some(Value::Int(v)) if v >= 0 => v as u64,
            _ => return Err(DbError::Corruption("record has no version".to_string())),
        };

        Ok(Entity {
            id,
            version,
            fields: map,
        })
    }
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("compression_level", &self.compression_level)
            .field("encrypted", &self.encryption.is_some())
            .field("max_entity_size", &self.max_entity_size)
            .finish()
    }
}
