// DocDB - Embedded document database engine
// Core library module

pub mod buffer;
pub mod cache;
pub mod codec;
pub mod collection;
pub mod db;
pub mod error;
pub mod index;
pub mod storage;
pub mod transaction;
pub mod value;
pub mod wal;

use std::sync::Arc;

pub use codec::EncryptionService;
pub use collection::query::{Query, QueryOptions, SortOrder};
pub use collection::Collection;
pub use db::Database;
pub use error::{DbError, Result};
pub use index::IndexKind;
pub use transaction::IsolationLevel;
pub use value::{CustomType, Entity, TypeRegistry, Value};

use cache::CacheConfig;
use storage::pager::validate_page_size;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Pages cached per collection; at least 16.
    pub buffer_pool_size: usize,
    /// Power of two, 4096..=65536.
    pub page_size: usize,
    /// When false every operation auto-commits; the WAL is still used for
    /// durability.
    pub enable_transactions: bool,
    /// Verify page checksums on read. Recovery always verifies.
    pub verify_checksums: bool,
    /// Hard cap on encoded record bytes.
    pub max_entity_size: usize,
    /// Optional AES-GCM provider for record encryption.
    pub encryption: Option<Arc<EncryptionService>>,
    /// Flush dirty state during `close`.
    pub auto_flush_on_close: bool,
    /// gzip level 1..=9, or None for no compression.
    pub compression_level: Option<u32>,
    /// Default isolation for transactions begun without an explicit level.
    pub default_isolation: IsolationLevel,
    pub plan_cache: CacheConfig,
    pub result_cache: CacheConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            buffer_pool_size: 1000,
            page_size: 4096,
            enable_transactions: true,
            verify_checksums: true,
            max_entity_size: 1024 * 1024,
            encryption: None,
            auto_flush_on_close: true,
            compression_level: None,
            default_isolation: IsolationLevel::ReadCommitted,
            plan_cache: CacheConfig::default(),
            result_cache: CacheConfig::default(),
        }
    }
}

impl DbConfig {
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.buffer_pool_size < 16 {
            return Err(DbError::InvalidConfig(format!(
                "buffer_pool_size {} is below the minimum of 16",
                self.buffer_pool_size
            )));
        }
        if let Some(level) = self.compression_level {
            if !(1..=9).contains(&level) {
                return Err(DbError::InvalidConfig(format!(
                    "compression_level {level} is outside 1..=9"
                )));
            }
        }
        if self.max_entity_size == 0 {
            return Err(DbError::InvalidConfig(
                "max_entity_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DbConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let mut config = DbConfig {
            buffer_pool_size: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DbError::InvalidConfig(_))
        ));

        config.buffer_pool_size = 64;
        config.page_size = 3000;
        assert!(matches!(
            config.validate(),
            Err(DbError::InvalidPageSize(3000))
        ));

        config.page_size = 4096;
        config.compression_level = Some(12);
        assert!(matches!(
            config.validate(),
            Err(DbError::InvalidConfig(_))
        ));
    }
}
