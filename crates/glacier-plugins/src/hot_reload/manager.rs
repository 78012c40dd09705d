//! Hot-reload manager
//!
//! Coordinates watching, loading, scanning, container building and module
//! registration. Rescans are single-flight: the pipeline runs under one lock,
//! and any number of triggers arriving while it runs collapse into exactly
//! one follow-up rescan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use glacier_kernel::config::PluginHostConfig;
use glacier_kernel::{
    CapabilitySet, DuplicatePolicy, ServiceKey, ServiceResolver, SubsystemKind,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::container::{ContainerBuilder, HostServices, ServiceContainer};
use super::loader::{BinaryLoader, LoadFailure, LoadOutcome, PluginLoadError, PluginLoader, PluginPattern};
use super::native::NativeBinaryLoader;
use super::registrar::{ModuleRegistrar, RegistrarError, RegistrySnapshot, RemovalOutcome};
use super::scanner::{CapabilityScanner, ScanError};
use super::watcher::{PluginWatcher, WatchConfig, WatcherError};

/// Hot-reload configuration
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// Watched plugin directory
    pub plugin_dir: PathBuf,
    /// Watch configuration
    pub watch_config: WatchConfig,
    /// Recognized service markers
    pub markers: CapabilitySet,
    /// Handling of duplicate contract bindings
    pub duplicate_policy: DuplicatePolicy,
    /// Capacity of the plugin-set update channel
    pub update_channel_capacity: usize,
    /// Capacity of the reload event broadcast
    pub event_channel_capacity: usize,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            watch_config: WatchConfig::default(),
            markers: CapabilitySet::default(),
            duplicate_policy: DuplicatePolicy::FirstWins,
            update_channel_capacity: 16,
            event_channel_capacity: 256,
        }
    }
}

impl HotReloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive from the host configuration
    pub fn from_host(host: &PluginHostConfig) -> Self {
        let mut pattern = PluginPattern::new(&host.extension);
        pattern.ignore_patterns = host.ignore_patterns.clone();

        Self {
            plugin_dir: host.plugin_dir.clone(),
            watch_config: WatchConfig::new(pattern).with_debounce(host.debounce()),
            duplicate_policy: host.duplicate_policy,
            update_channel_capacity: host.update_channel_capacity.max(1),
            ..Self::default()
        }
    }

    pub fn with_plugin_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.plugin_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_watch_config(mut self, watch_config: WatchConfig) -> Self {
        self.watch_config = watch_config;
        self
    }

    pub fn with_markers(mut self, markers: CapabilitySet) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_update_channel_capacity(mut self, capacity: usize) -> Self {
        self.update_channel_capacity = capacity.max(1);
        self
    }
}

/// Reload lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    RescanStarted {
        generation: u64,
    },
    BinaryLoaded {
        assembly: String,
        path: PathBuf,
        epoch: u64,
    },
    BinaryFailed {
        path: PathBuf,
        error: String,
    },
    BinaryRemoved {
        assembly: String,
        path: PathBuf,
    },
    ModuleRemovalFailed {
        assembly: String,
        kind: SubsystemKind,
        module: String,
        error: Option<String>,
    },
    RescanCompleted {
        generation: u64,
        modules: usize,
    },
    RescanAborted {
        generation: u64,
        error: String,
    },
}

/// Summary of one current plugin binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinarySummary {
    pub assembly: String,
    pub version: String,
    pub path: PathBuf,
    pub epoch: u64,
    pub hash: String,
}

/// Published after every successful rescan
#[derive(Debug, Clone)]
pub struct PluginSetUpdated {
    pub generation: u64,
    /// Container the registered modules were built against
    pub container: Arc<ServiceContainer>,
    pub registry: RegistrySnapshot,
    /// Plugin service contracts bound in the container
    pub services: Vec<ServiceKey>,
    pub binaries: Vec<BinarySummary>,
    pub failures: Vec<LoadFailure>,
    pub completed_at: DateTime<Utc>,
}

/// What one rescan did
#[derive(Debug, Clone, Default)]
pub struct RescanReport {
    pub generation: u64,
    pub loaded: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub failures: Vec<LoadFailure>,
    /// Assemblies whose binary disappeared
    pub removed: Vec<String>,
    pub modules_registered: usize,
    pub removal_failures: Vec<RemovalOutcome>,
    pub registration_errors: Vec<RegistrarError>,
}

/// Reload error types
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("Rescan aborted: {0}")]
    Scan(#[from] ScanError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Load error: {0}")]
    Load(#[from] PluginLoadError),

    #[error("Directory scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Hot reload manager already started")]
    AlreadyStarted,

    #[error("Hot reload manager has been stopped")]
    Shutdown,
}

struct PipelineState {
    loader: PluginLoader,
    scanner: CapabilityScanner,
    registrar: ModuleRegistrar,
    host: HostServices,
    generation: u64,
    stopped: bool,
}

struct Pipeline {
    plugin_dir: PathBuf,
    state: Mutex<PipelineState>,
    update_tx: mpsc::Sender<PluginSetUpdated>,
    event_tx: broadcast::Sender<ReloadEvent>,
    latest: RwLock<Option<PluginSetUpdated>>,
}

impl Pipeline {
    fn emit(&self, event: ReloadEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    async fn rescan(&self) -> Result<RescanReport, ReloadError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.stopped {
            return Err(ReloadError::Shutdown);
        }

        let generation = state.generation + 1;
        info!("Rescanning {:?} (generation {})", self.plugin_dir, generation);
        self.emit(ReloadEvent::RescanStarted { generation });

        // Hashing and dlopen block; keep them off the async workers.
        let mut loader = state.loader.take();
        let dir = self.plugin_dir.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            let outcome = loader.scan(&dir);
            (loader, outcome)
        })
        .await;
        let outcome = match scanned {
            Ok((loader, outcome)) => {
                state.loader = loader;
                outcome
            }
            Err(e) => {
                // The scanned binaries went down with the task; the next rescan reloads them.
                error!("Rescan {} lost its directory scan: {}", generation, e);
                self.emit(ReloadEvent::RescanAborted {
                    generation,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let table = match state.scanner.scan(state.loader.binaries()) {
            Ok(table) => table,
            Err(e) => {
                error!("Rescan {} aborted, keeping previous plugin set: {}", generation, e);
                state.loader.rollback(outcome);
                self.emit(ReloadEvent::RescanAborted {
                    generation,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        for failure in &outcome.failures {
            self.emit(ReloadEvent::BinaryFailed {
                path: failure.path.clone(),
                error: failure.error.clone(),
            });
        }
        for path in &outcome.loaded {
            if let Some(binary) = state.loader.get(path) {
                self.emit(ReloadEvent::BinaryLoaded {
                    assembly: binary.assembly_name().to_string(),
                    path: path.clone(),
                    epoch: binary.epoch(),
                });
            }
        }

        let container = Arc::new(
            ContainerBuilder::new(state.host.clone())
                .with_generation(generation)
                .build(&table),
        );
        let services: Arc<dyn ServiceResolver> = container.clone();

        let mut report = RescanReport {
            generation,
            ..RescanReport::default()
        };

        // Re-register every current binary against the new container.
        let loader = &state.loader;
        let registrar = &mut state.registrar;
        for binary in loader.binaries() {
            let sync = registrar.sync_binary(binary, services.clone()).await;
            report.modules_registered += sync.added.len();
            report
                .removal_failures
                .extend(sync.removals.into_iter().filter(RemovalOutcome::is_failure));
            report.registration_errors.extend(sync.errors);
        }

        let live: HashSet<String> = loader
            .binaries()
            .map(|b| b.assembly_name().to_string())
            .collect();
        report.removal_failures.extend(
            registrar
                .retain_assemblies(&live)
                .await
                .into_iter()
                .filter(RemovalOutcome::is_failure),
        );

        for failed in &report.removal_failures {
            self.emit(ReloadEvent::ModuleRemovalFailed {
                assembly: failed.handle.assembly.clone(),
                kind: failed.handle.kind,
                module: failed.handle.name.clone(),
                error: failed.error.as_ref().map(|e| e.to_string()),
            });
        }

        // Modules are gone from the subsystems; the old contexts can go too.
        let LoadOutcome {
            loaded,
            unchanged,
            failures,
            superseded,
            removed,
            displaced,
        } = outcome;
        for binary in removed {
            self.emit(ReloadEvent::BinaryRemoved {
                assembly: binary.assembly_name().to_string(),
                path: binary.path().to_path_buf(),
            });
            report.removed.push(binary.assembly_name().to_string());
            binary.unload();
        }
        for binary in superseded.into_iter().chain(displaced) {
            binary.unload();
        }

        report.loaded = loaded;
        report.unchanged = unchanged;
        report.failures = failures;
        state.generation = generation;

        let update = PluginSetUpdated {
            generation,
            container,
            registry: state.registrar.snapshot(),
            services: table.contracts(),
            binaries: state
                .loader
                .binaries()
                .map(|b| BinarySummary {
                    assembly: b.assembly_name().to_string(),
                    version: b.version().to_string(),
                    path: b.path().to_path_buf(),
                    epoch: b.epoch(),
                    hash: b.hash().to_string(),
                })
                .collect(),
            failures: report.failures.clone(),
            completed_at: Utc::now(),
        };

        *self.latest.write() = Some(update.clone());
        match self.update_tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Plugin-set update {} dropped, consumer is lagging", generation)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("No plugin-set update consumer")
            }
        }

        info!(
            "Rescan {} complete: {} loaded, {} unchanged, {} failed, {} removed, {} modules",
            generation,
            report.loaded.len(),
            report.unchanged.len(),
            report.failures.len(),
            report.removed.len(),
            report.modules_registered
        );
        self.emit(ReloadEvent::RescanCompleted {
            generation,
            modules: report.modules_registered,
        });

        Ok(report)
    }

    async fn teardown(&self) -> Vec<RemovalOutcome> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Vec::new();
        }
        state.stopped = true;

        let outcomes = state.registrar.unregister_all().await;
        for failed in outcomes.iter().filter(|o| o.is_failure()) {
            self.emit(ReloadEvent::ModuleRemovalFailed {
                assembly: failed.handle.assembly.clone(),
                kind: failed.handle.kind,
                module: failed.handle.name.clone(),
                error: failed.error.as_ref().map(|e| e.to_string()),
            });
        }

        let binaries = state.loader.drain();
        let count = binaries.len();
        for binary in binaries {
            binary.unload();
        }
        info!("Plugin host torn down, {} binaries unloaded", count);
        outcomes
    }
}

/// Hot-reload manager
pub struct HotReloadManager {
    config: HotReloadConfig,
    pipeline: Arc<Pipeline>,
    trigger: Arc<Notify>,
    watcher: Mutex<Option<PluginWatcher>>,
    update_rx: parking_lot::Mutex<Option<mpsc::Receiver<PluginSetUpdated>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HotReloadManager {
    /// Create a manager loading binaries through `backend`
    pub fn new(
        config: HotReloadConfig,
        backend: Arc<dyn BinaryLoader>,
        host: HostServices,
        registrar: ModuleRegistrar,
    ) -> Self {
        let (update_tx, update_rx) = mpsc::channel(config.update_channel_capacity.max(1));
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let state = PipelineState {
            loader: PluginLoader::new(backend, config.watch_config.pattern.clone()),
            scanner: CapabilityScanner::new(config.markers.clone(), config.duplicate_policy),
            registrar,
            host,
            generation: 0,
            stopped: false,
        };

        Self {
            pipeline: Arc::new(Pipeline {
                plugin_dir: config.plugin_dir.clone(),
                state: Mutex::new(state),
                update_tx,
                event_tx,
                latest: RwLock::new(None),
            }),
            config,
            trigger: Arc::new(Notify::new()),
            watcher: Mutex::new(None),
            update_rx: parking_lot::Mutex::new(Some(update_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Create a manager loading native shared libraries
    pub fn with_native_loader(
        config: HotReloadConfig,
        host: HostServices,
        registrar: ModuleRegistrar,
    ) -> Result<Self, ReloadError> {
        let backend = Arc::new(NativeBinaryLoader::new()?);
        Ok(Self::new(config, backend, host, registrar))
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    /// Take the update receiver (can only be called once)
    pub fn take_update_receiver(&self) -> Option<mpsc::Receiver<PluginSetUpdated>> {
        self.update_rx.lock().take()
    }

    /// Subscribe to reload events
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.pipeline.event_tx.subscribe()
    }

    /// Most recent published plugin set
    pub fn latest(&self) -> Option<PluginSetUpdated> {
        self.pipeline.latest.read().clone()
    }

    /// Generation of the most recent published plugin set, 0 before the first
    pub fn generation(&self) -> u64 {
        self.pipeline
            .latest
            .read()
            .as_ref()
            .map(|u| u.generation)
            .unwrap_or(0)
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Start watching and run the initial rescan in the background
    pub async fn start(&self) -> Result<(), ReloadError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(ReloadError::AlreadyStarted);
        }
        if *self.shutdown_tx.borrow() {
            return Err(ReloadError::Shutdown);
        }

        info!("Starting hot reload manager for {:?}", self.config.plugin_dir);

        let mut watcher = PluginWatcher::new(
            &self.config.plugin_dir,
            self.config.watch_config.clone(),
            self.trigger.clone(),
        );
        watcher.start().await?;
        *self.watcher.lock().await = Some(watcher);

        let pipeline = self.pipeline.clone();
        let trigger = self.trigger.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = trigger.notified() => {
                        match pipeline.rescan().await {
                            Ok(report) => debug!("Rescan {} finished", report.generation),
                            Err(ReloadError::Shutdown) => break,
                            Err(e) => warn!("Rescan failed: {}", e),
                        }
                    }
                }
            }
            debug!("Reload loop exited");
        }));

        // Initial load
        self.trigger.notify_one();
        Ok(())
    }

    /// Request a rescan; coalesces with any pending request
    pub fn trigger_rescan(&self) {
        self.trigger.notify_one();
    }

    /// Run one rescan now and wait for it
    ///
    /// Waits for an in-flight rescan first.
    pub async fn reload_once(&self) -> Result<RescanReport, ReloadError> {
        self.pipeline.rescan().await
    }

    /// Stop watching, wait for an in-flight rescan, then unregister every
    /// module and unload every binary
    pub async fn stop(&self) -> Vec<RemovalOutcome> {
        info!("Stopping hot reload manager");

        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }

        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Reload loop ended abnormally: {}", e);
            }
        }

        self.pipeline.teardown().await
    }
}

impl Drop for HotReloadManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
