//! Application context
//!
//! Owns the catalog, the supervisor, the settings and one managed listener
//! per API surface. Built once at startup and handed to every front end.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use crate::api::{self, ApiState};
use crate::catalog::ModelCatalog;
use crate::lifecycle::ManagedListener;
use crate::storage::settings::{save_settings, AppSettings};
use crate::storage::StorageError;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::types::config::ListenerKind;

/// State of one listener as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub kind: ListenerKind,
    pub enabled: bool,
    pub port: u16,
    pub running: bool,
}

pub struct AppContext {
    settings: RwLock<AppSettings>,
    /// Write settings back to disk on change
    persist: bool,
    catalog: Arc<ModelCatalog>,
    supervisor: Arc<ProcessSupervisor>,
    native: Arc<ManagedListener>,
    ollama: Arc<ManagedListener>,
    lmstudio: Arc<ManagedListener>,
    shutdown: Notify,
}

impl AppContext {
    /// Context whose settings changes are saved to the data directory
    pub fn new(settings: AppSettings) -> Arc<Self> {
        Self::build(settings, true)
    }

    /// Context that never touches the settings file
    pub fn ephemeral(settings: AppSettings) -> Arc<Self> {
        Self::build(settings, false)
    }

    fn build(mut settings: AppSettings, persist: bool) -> Arc<Self> {
        settings.validate();

        let catalog = Arc::new(ModelCatalog::new(
            settings.model_paths.clone(),
            settings.aliases.clone(),
            settings.rescan_interval(),
        ));
        let supervisor = ProcessSupervisor::new(
            Arc::clone(&catalog),
            SupervisorConfig::from_settings(&settings),
            None,
        );

        Arc::new_cyclic(|context| {
            let listener = |kind| ManagedListener::new(kind, api::router(kind, ApiState::new(context.clone())));
            Self {
                settings: RwLock::new(settings),
                persist,
                catalog,
                supervisor,
                native: listener(ListenerKind::Native),
                ollama: listener(ListenerKind::Ollama),
                lmstudio: listener(ListenerKind::LmStudio),
                shutdown: Notify::new(),
            }
        })
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn settings(&self) -> AppSettings {
        self.settings.read().clone()
    }

    pub fn listener(&self, kind: ListenerKind) -> &Arc<ManagedListener> {
        match kind {
            ListenerKind::Native => &self.native,
            ListenerKind::Ollama => &self.ollama,
            ListenerKind::LmStudio => &self.lmstudio,
        }
    }

    /// Start the native listener and every enabled compatibility listener.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let settings = self.settings();
        let mut wanted = vec![(ListenerKind::Native, settings.port)];
        for kind in [ListenerKind::Ollama, ListenerKind::LmStudio] {
            if let Some(compat) = settings.compat(kind).filter(|c| c.enabled) {
                wanted.push((kind, compat.port));
            }
        }

        for (kind, port) in wanted {
            match listen_addr(&settings.host, port) {
                Some(addr) => self.listener(kind).start(addr),
                None => tracing::error!("Cannot resolve {}:{} for the {} listener", settings.host, port, kind),
            }
        }
    }

    /// Stop every listener, then every model
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        for kind in [ListenerKind::Native, ListenerKind::Ollama, ListenerKind::LmStudio] {
            self.listener(kind).stop();
        }
        self.supervisor.shutdown_all().await;
    }

    /// Ask the binary to exit; see [`Self::shutdown_requested`]
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    pub fn listener_status(&self, kind: ListenerKind) -> ListenerStatus {
        let settings = self.settings.read();
        let (enabled, port) = match settings.compat(kind) {
            Some(compat) => (compat.enabled, compat.port),
            None => (true, settings.port),
        };
        ListenerStatus {
            kind,
            enabled,
            port,
            running: self.listener(kind).is_running(),
        }
    }

    /// Enable or disable a compatibility listener and persist the choice.
    /// The native listener is not affected.
    pub fn set_compat(&self, kind: ListenerKind, enabled: bool, port: Option<u16>) -> Result<ListenerStatus, StorageError> {
        let addr = {
            let mut settings = self.settings.write();
            let host = settings.host.clone();
            let Some(compat) = settings.compat_mut(kind) else {
                return Ok(self.listener_status_locked(&settings, kind));
            };
            compat.enabled = enabled;
            if let Some(port) = port.filter(|p| *p != 0) {
                compat.port = port;
            }
            listen_addr(&host, compat.port)
        };

        let listener = self.listener(kind);
        match (enabled, addr) {
            (true, Some(addr)) => listener.start(addr),
            (true, None) => tracing::error!("Cannot resolve a bind address for the {} listener", kind),
            (false, _) => listener.stop(),
        }

        self.persist()?;
        Ok(self.listener_status(kind))
    }

    /// Replace the scan directories; the next catalog listing rescans
    pub fn set_model_paths(&self, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, StorageError> {
        let paths = {
            let mut settings = self.settings.write();
            settings.model_paths = paths;
            settings.validate();
            settings.model_paths.clone()
        };
        self.catalog.set_model_paths(paths.clone());
        self.persist()?;
        Ok(paths)
    }

    /// Set or clear an alias and persist the alias table.
    /// Returns false when the model is not in the catalog.
    pub fn set_alias(&self, model_id: &str, alias: &str) -> Result<bool, StorageError> {
        if !self.catalog.set_alias(model_id, alias) {
            return Ok(false);
        }
        self.settings.write().aliases = self.catalog.aliases();
        self.persist()?;
        Ok(true)
    }

    fn listener_status_locked(&self, settings: &AppSettings, kind: ListenerKind) -> ListenerStatus {
        ListenerStatus {
            kind,
            enabled: true,
            port: settings.port,
            running: self.listener(kind).is_running(),
        }
    }

    fn persist(&self) -> Result<(), StorageError> {
        if !self.persist {
            return Ok(());
        }
        save_settings(&self.settings.read())
    }
}

fn listen_addr(host: &str, port: u16) -> Option<SocketAddr> {
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            tracing::warn!("Invalid listen host {}: {}", host, e);
            None
        }
    }
}
