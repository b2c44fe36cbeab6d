//! # ComplyFlow Store
//!
//! Checkpoint backends for [`StateStore`]:
//! - [`SqliteStateStore`] — durable, transactional, WAL mode
//! - [`MemoryStateStore`] — non-durable, for tests and dry runs

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use complyflow_core::config::{StoreConfig, expand_path};
use complyflow_core::error::{ComplyError, Result};
use complyflow_core::store::StateStore;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

/// Create a checkpoint store from config.
pub fn create_state_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend.as_str() {
        "sqlite" => {
            let path = expand_path(&config.path);
            tracing::info!("🗄️ Checkpoint store: sqlite ({})", path.display());
            Ok(Arc::new(SqliteStateStore::open(&path)?))
        }
        "memory" => {
            tracing::warn!("⚠️ Checkpoint store: memory (state is lost on exit)");
            Ok(Arc::new(MemoryStateStore::new()))
        }
        other => Err(ComplyError::Config(format!("unknown store backend '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_backends() {
        let config = StoreConfig {
            backend: "memory".into(),
            ..StoreConfig::default()
        };
        assert_eq!(create_state_store(&config).unwrap().name(), "memory");

        let bad = StoreConfig {
            backend: "redis".into(),
            ..StoreConfig::default()
        };
        assert!(create_state_store(&bad).is_err());
    }
}
