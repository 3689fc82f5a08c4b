//! Model catalog
//!
//! Scans the configured directories for GGUF files and keeps the result as
//! an immutable snapshot. A rescan builds a complete new snapshot and swaps
//! it in, so readers never observe a half-populated catalog.

mod scan;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::types::model::ModelEntry;
use scan::ScannedModel;

struct Snapshot {
    models: Arc<Vec<ModelEntry>>,
    scanned_at: Option<Instant>,
    /// `paths_version` the snapshot was built from
    paths_version: u64,
}

struct ScanRoots {
    paths: Vec<PathBuf>,
    version: u64,
}

pub struct ModelCatalog {
    roots: RwLock<ScanRoots>,
    aliases: RwLock<HashMap<String, String>>,
    rescan_interval: Option<Duration>,
    snapshot: RwLock<Snapshot>,
    /// Held for the duration of a scan and while aliases are rewritten
    scan_lock: Mutex<()>,
}

impl ModelCatalog {
    /// `rescan_interval` of `None` keeps a snapshot until it is invalidated
    pub fn new(paths: Vec<PathBuf>, aliases: HashMap<String, String>, rescan_interval: Option<Duration>) -> Self {
        Self {
            roots: RwLock::new(ScanRoots { paths, version: 1 }),
            aliases: RwLock::new(aliases),
            rescan_interval,
            snapshot: RwLock::new(Snapshot {
                models: Arc::new(Vec::new()),
                scanned_at: None,
                paths_version: 0,
            }),
            scan_lock: Mutex::new(()),
        }
    }

    /// Current catalog, rescanning first when it is empty, stale,
    /// invalidated or `force_rescan` is set.
    ///
    /// Blocks on file I/O; call from `spawn_blocking` in async code.
    pub fn list_models(&self, force_rescan: bool) -> Arc<Vec<ModelEntry>> {
        if !force_rescan && !self.needs_scan() {
            return self.snapshot();
        }

        let _scan = self.scan_lock.lock();
        // Another caller may have finished a scan while we waited
        if !force_rescan && !self.needs_scan() {
            return self.snapshot();
        }
        self.rescan_locked()
    }

    /// Exact id lookup
    pub fn find_model_by_id(&self, model_id: &str) -> Option<ModelEntry> {
        self.list_models(false)
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
    }

    /// Lookup by id, falling back to alias
    pub fn find_model(&self, name: &str) -> Option<ModelEntry> {
        let models = self.list_models(false);
        models
            .iter()
            .find(|m| m.model_id == name)
            .or_else(|| models.iter().find(|m| !m.alias.is_empty() && m.alias == name))
            .cloned()
    }

    /// Set or clear (empty string) the alias of a listed model.
    ///
    /// Returns false when the id is not in the catalog. Persisting the
    /// change is up to the caller, see [`Self::aliases`].
    pub fn set_alias(&self, model_id: &str, alias: &str) -> bool {
        let alias = alias.trim();
        if self.find_model_by_id(model_id).is_none() {
            return false;
        }

        let _scan = self.scan_lock.lock();
        {
            let mut aliases = self.aliases.write();
            if alias.is_empty() {
                aliases.remove(model_id);
            } else {
                aliases.insert(model_id.to_string(), alias.to_string());
            }
        }

        let mut snapshot = self.snapshot.write();
        let mut models = snapshot.models.as_ref().clone();
        for model in models.iter_mut().filter(|m| m.model_id == model_id) {
            model.alias = alias.to_string();
        }
        snapshot.models = Arc::new(models);

        tracing::info!("Alias of {} set to '{}'", model_id, alias);
        true
    }

    /// Replace the scan roots; the next listing rescans
    pub fn set_model_paths(&self, paths: Vec<PathBuf>) {
        let mut roots = self.roots.write();
        roots.paths = paths;
        roots.version += 1;
        tracing::info!("Model paths updated ({} directories)", roots.paths.len());
    }

    pub fn model_paths(&self) -> Vec<PathBuf> {
        self.roots.read().paths.clone()
    }

    /// Model id -> alias, for persistence
    pub fn aliases(&self) -> HashMap<String, String> {
        self.aliases.read().clone()
    }

    fn snapshot(&self) -> Arc<Vec<ModelEntry>> {
        Arc::clone(&self.snapshot.read().models)
    }

    fn needs_scan(&self) -> bool {
        let paths_version = self.roots.read().version;
        let snapshot = self.snapshot.read();

        let Some(scanned_at) = snapshot.scanned_at else {
            return true;
        };
        snapshot.models.is_empty()
            || snapshot.paths_version != paths_version
            || self.rescan_interval.is_some_and(|interval| scanned_at.elapsed() >= interval)
    }

    fn rescan_locked(&self) -> Arc<Vec<ModelEntry>> {
        let (paths, paths_version) = {
            let roots = self.roots.read();
            (roots.paths.clone(), roots.version)
        };

        let started = Instant::now();
        let files = scan::collect_files(&paths);
        let scanned = scan::group_models(&files);

        let models = {
            let aliases = self.aliases.read();
            let mut models: Vec<ModelEntry> = scanned.into_iter().map(|s| to_entry(s, &aliases)).collect();
            models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
            Arc::new(models)
        };

        tracing::info!(
            "Scanned {} directories: {} models from {} files in {:?}",
            paths.len(),
            models.len(),
            files.len(),
            started.elapsed()
        );

        *self.snapshot.write() = Snapshot {
            models: Arc::clone(&models),
            scanned_at: Some(Instant::now()),
            paths_version,
        };
        models
    }
}

/// Stable id for a primary file: stem plus a short hash of its canonical path
pub fn model_id_for(name: &str, canonical_path: &Path) -> String {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical_path.to_string_lossy().as_bytes());
    let hex = uuid.simple().to_string();
    format!("{}-{}", name, &hex[..8])
}

fn to_entry(scanned: ScannedModel, aliases: &HashMap<String, String>) -> ModelEntry {
    let path = scanned.primary.file_path.clone();
    let model_id = model_id_for(&scanned.name, &path);
    let alias = aliases.get(&model_id).cloned().unwrap_or_default();
    ModelEntry {
        model_id,
        name: scanned.name,
        alias,
        primary: scanned.primary,
        mmproj: scanned.mmproj,
        size: scanned.size,
        path,
    }
}
