//! Tenant manager.
//!
//! One broker per authenticated identity, created lazily on first use and
//! never destroyed at runtime. Each broker gets its own data directory,
//! last-value store, log file and maintenance task; no lock, pointer or map
//! entry is shared between tenants, so a misbehaving tenant name cannot
//! touch another tenant's broker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use moustique_persistence::{KvStore, StoreError};
use moustique_utils::logging::UserLog;

use crate::engine::{Broker, BrokerOptions};

/// Filename of each tenant's last-value store.
const STORE_FILENAME: &str = "moustique.db";
/// Filename of each tenant's log.
const LOG_FILENAME: &str = "user.log";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("broker manager not initialized")]
    NotInitialized,

    #[error("failed to create tenant directory: {0}")]
    CreateDir(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct ManagerState {
    brokers: HashMap<String, Arc<Broker>>,
    default_broker: Option<Arc<Broker>>,
    /// Captured at initialization and handed to every maintenance task
    /// spawned afterwards.
    shutdown: Option<watch::Receiver<bool>>,
}

pub struct BrokerManager {
    state: RwLock<ManagerState>,
    data_dir: PathBuf,
    options: BrokerOptions,
}

impl BrokerManager {
    pub fn new(data_dir: impl Into<PathBuf>, options: BrokerOptions) -> Self {
        Self {
            state: RwLock::new(ManagerState::default()),
            data_dir: data_dir.into(),
            options,
        }
    }

    /// Capture the shutdown signal and, when public access is enabled,
    /// bring up the shared anonymous broker under `<datadir>/public`.
    pub fn initialize_default(
        &self,
        shutdown: watch::Receiver<bool>,
        allow_public: bool,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.write();
        state.shutdown = Some(shutdown.clone());

        if allow_public {
            let dir = self.data_dir.join("public");
            let broker = self.build_broker(&dir, "public", shutdown)?;
            broker.log_user("Public broker initialized");
            state.default_broker = Some(broker);
            info!("created public broker for unauthenticated access");
        }

        Ok(())
    }

    /// Fetch the broker for `name`, creating its directory, store, log and
    /// maintenance task on first use. Idempotent.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Broker>, ManagerError> {
        let mut state = self.state.write();

        if let Some(broker) = state.brokers.get(name) {
            return Ok(Arc::clone(broker));
        }

        let shutdown = state.shutdown.clone().ok_or(ManagerError::NotInitialized)?;
        let dir = self.data_dir.join("users").join(name);
        let broker = self.build_broker(&dir, name, shutdown)?;
        state.brokers.insert(name.to_string(), Arc::clone(&broker));
        info!(tenant = name, "created broker instance");
        Ok(broker)
    }

    /// Fetch the broker for `name` without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<Broker>> {
        self.state.read().brokers.get(name).map(Arc::clone)
    }

    /// The shared anonymous broker, when public access is enabled.
    pub fn default_broker(&self) -> Option<Arc<Broker>> {
        self.state.read().default_broker.as_ref().map(Arc::clone)
    }

    /// Names of tenants with a live broker.
    pub fn tenant_names(&self) -> Vec<String> {
        self.state.read().brokers.keys().cloned().collect()
    }

    /// Snapshot the default broker's store and every tenant store. The
    /// first failure aborts the pass; a failed snapshot is fatal to the
    /// caller.
    pub fn save_all(&self) -> Result<(), ManagerError> {
        let state = self.state.read();

        if let Some(broker) = &state.default_broker {
            let saved = broker.store().save_all()?;
            info!(tenant = "public", keys = saved, "saved store snapshot");
        }

        for (name, broker) in &state.brokers {
            let saved = broker.store().save_all()?;
            info!(tenant = %name, keys = saved, "saved store snapshot");
        }

        Ok(())
    }

    fn build_broker(
        &self,
        dir: &Path,
        label: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Broker>, ManagerError> {
        fs::create_dir_all(dir).map_err(ManagerError::CreateDir)?;

        let db = KvStore::open(dir.join(STORE_FILENAME))?;
        match db.load_all() {
            Ok(count) => info!(tenant = label, keys = count, "loaded store snapshot"),
            Err(err) => warn!(tenant = label, error = %err, "could not load store snapshot"),
        }

        let user_log = match UserLog::open(dir.join(LOG_FILENAME), label) {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(tenant = label, error = %err, "could not open tenant log");
                None
            }
        };

        let broker = Arc::new(Broker::new(db, user_log, self.options.clone()));
        broker.log_user("Broker initialized");
        tokio::spawn(Arc::clone(&broker).run_maintenance(shutdown));
        Ok(broker)
    }
}
