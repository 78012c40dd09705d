//! File system watcher for the plugin directory
//!
//! Collapses bursts of filesystem events into a single rescan request. Every
//! relevant event pushes the deadline back; the rescan is requested once the
//! directory has been quiet for the debounce period.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RemoveKind},
};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::loader::PluginPattern;

/// Watcher errors
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Watcher fault: {0}")]
    Notify(#[from] notify::Error),

    #[error("Cannot prepare plugin directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period before a rescan is requested
    pub debounce_duration: Duration,
    /// Which files count as plugin binaries
    pub pattern: PluginPattern,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(500),
            pattern: PluginPattern::default(),
        }
    }
}

impl WatchConfig {
    pub fn new(pattern: PluginPattern) -> Self {
        Self {
            pattern,
            ..Self::default()
        }
    }

    /// Set debounce duration
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce_duration = duration;
        self
    }

    /// Check whether an event should lead to a rescan
    ///
    /// Any event on a plugin binary counts, as do directory creations,
    /// removals and renames (a subtree may have appeared or vanished).
    pub fn is_relevant(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Access(_) | EventKind::Other => false,
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => true,
            EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                event
                    .paths
                    .iter()
                    .any(|p| self.pattern.matches(p) || looks_like_directory(p))
            }
            _ => event.paths.iter().any(|p| self.pattern.matches(p)),
        }
    }
}

fn looks_like_directory(path: &Path) -> bool {
    path.is_dir() || (!path.exists() && path.extension().is_none())
}

/// Hand a notification to the debounce task, returning whether it was queued
///
/// Only relevant events are queued, so a full queue already holds one that
/// will request the rescan.
fn forward_event(
    config: &WatchConfig,
    tx: &mpsc::Sender<Event>,
    result: Result<Event, notify::Error>,
) -> bool {
    let event = match result {
        Ok(event) => event,
        Err(e) => {
            warn!("Plugin watcher fault: {}", e);
            return false;
        }
    };
    if !config.is_relevant(&event) {
        return false;
    }

    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            debug!("Watch queue full, dropping {:?} on {:?}", event.kind, event.paths);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Plugin directory watcher
pub struct PluginWatcher {
    /// Watched root
    plugin_dir: PathBuf,
    /// Configuration
    config: WatchConfig,
    /// Rescan request signal
    trigger: Arc<Notify>,
    /// Internal watcher handle
    watcher: Option<RecommendedWatcher>,
    /// Shutdown signal for the debounce task
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PluginWatcher {
    /// Create a watcher that signals `trigger` when `plugin_dir` changes
    pub fn new(plugin_dir: impl Into<PathBuf>, config: WatchConfig, trigger: Arc<Notify>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            config,
            trigger,
            watcher: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching for changes
    pub async fn start(&mut self) -> Result<(), WatcherError> {
        if self.is_running() {
            debug!("Plugin watcher already running");
            return Ok(());
        }

        if !self.plugin_dir.exists() {
            info!("Creating plugin directory {:?}", self.plugin_dir);
            std::fs::create_dir_all(&self.plugin_dir).map_err(|source| WatcherError::Directory {
                path: self.plugin_dir.clone(),
                source,
            })?;
        }

        info!("Starting plugin watcher on {:?}", self.plugin_dir);

        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        let watcher_config = Config::default().with_poll_interval(Duration::from_millis(100));

        let filter = self.config.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                forward_event(&filter, &tx, result);
            },
            watcher_config,
        )?;
        watcher.watch(&self.plugin_dir, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let config = self.config.clone();
        let trigger = self.trigger.clone();

        self.task = Some(tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;

            loop {
                let quiet = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Plugin watcher shutting down");
                        return;
                    }
                    received = rx.recv() => match received {
                        Some(event) => {
                            debug!("Watch event {:?} on {:?}", event.kind, event.paths);
                            deadline = Some(Instant::now() + config.debounce_duration);
                        }
                        None => return,
                    },
                    _ = quiet => {
                        deadline = None;
                        info!("Plugin directory changed, requesting rescan");
                        trigger.notify_one();
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop watching; no rescan is requested afterwards
    pub async fn stop(&mut self) {
        if self.watcher.is_none() && self.task.is_none() {
            return;
        }

        info!("Stopping plugin watcher");

        // Drop the watcher first so its callback stops feeding the queue.
        self.watcher = None;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Plugin watcher task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
