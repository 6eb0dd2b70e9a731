//! Shared test utilities for archive integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};

use ::common::anchoring::{AliasStore, AnchoringStrategy, MemoryAliasStore, StrategyContext};
use ::common::brick::HashLink;
use ::common::config::ArchiveConfig;
use ::common::controller::BrickMapController;
use ::common::storage::{BrickStorageService, LocalFsAdapter, MemoryBrickStore};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` picks the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Stores shared by every controller of one test
#[derive(Clone)]
pub struct TestEnv {
    pub bricks: MemoryBrickStore,
    pub aliases: MemoryAliasStore,
    pub config: Arc<ArchiveConfig>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ArchiveConfig::default())
    }

    pub fn with_config(config: ArchiveConfig) -> Self {
        init_tracing();
        Self {
            bricks: MemoryBrickStore::new(),
            aliases: MemoryAliasStore::new(),
            config: Arc::new(config),
        }
    }

    pub fn storage(&self) -> BrickStorageService {
        BrickStorageService::new(
            Arc::new(self.bricks.clone()),
            Arc::new(LocalFsAdapter),
            self.config.clone(),
        )
    }

    pub fn context(&self) -> StrategyContext {
        StrategyContext::new(self.storage(), Arc::new(self.aliases.clone()))
    }

    /// A fresh controller over the shared stores
    pub fn controller(&self, alias: &str, strategy: AnchoringStrategy) -> BrickMapController {
        BrickMapController::new(alias, self.context(), strategy)
    }

    pub async fn versions(&self, alias: &str) -> Vec<String> {
        self.aliases.get_all_versions(alias).await.unwrap()
    }
}

/// A hash link to a brick that was never stored
pub fn link(hash: &str) -> HashLink {
    HashLink::new(hash, format!("sum-{}", hash), None)
}
