//! Plugin loader
//!
//! Enumerates plugin binaries, loads each into its own context and tracks
//! the current context per canonical path. A reload never leaves two current
//! contexts for one path: the previous one is handed back as superseded so
//! the pipeline can retire it after its modules are unregistered.

use glacier_kernel::{
    CapabilityId, ExportedType, ModuleInstance, ModuleType, PluginExports, ServiceError,
    ServiceInstance, ServiceResolver, SubsystemKind, TypeActivator,
};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Plugin load error types
#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Assembly {assembly} is already provided by {existing:?}")]
    DuplicateAssembly { assembly: String, existing: PathBuf },
}

/// Exports produced by a backend, plus whatever keeps their code mapped
pub struct LoadedImage {
    exports: PluginExports,
    backing: Option<Box<dyn Any + Send + Sync>>,
}

impl LoadedImage {
    /// Image whose code lives in the host process
    pub fn in_process(exports: PluginExports) -> Self {
        Self {
            exports,
            backing: None,
        }
    }

    /// Image backed by a resource that must outlive every export (e.g. a shared library)
    pub fn with_backing(exports: PluginExports, backing: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            exports,
            backing: Some(backing),
        }
    }

    pub fn exports(&self) -> &PluginExports {
        &self.exports
    }
}

/// Turns a file into a loaded image
pub trait BinaryLoader: Send + Sync {
    /// Load one binary into a fresh, isolated image
    fn load(&self, path: &Path) -> Result<LoadedImage, PluginLoadError>;
}

/// Isolated loading context owning every export of one binary
pub struct LoadContext {
    id: Uuid,
    path: PathBuf,
    assembly: String,
    epoch: u64,
    retired: AtomicBool,
    // Field order matters: exports must drop before the backing library.
    exports: Vec<ExportedType>,
    backing: Option<Box<dyn Any + Send + Sync>>,
}

impl LoadContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            info!(
                "Unloaded plugin {} (epoch {}) from {:?}",
                self.assembly, self.epoch, self.path
            );
        }
    }
}

impl Drop for LoadContext {
    fn drop(&mut self) {
        debug!(
            "Releasing load context {} for {:?} (native: {})",
            self.id,
            self.path,
            self.backing.is_some()
        );
    }
}

/// Non-owning reference to one exported type
#[derive(Clone)]
pub struct TypeRef {
    context: Weak<LoadContext>,
    index: usize,
    name: String,
    contract: String,
    capabilities: Vec<CapabilityId>,
    assembly: String,
    epoch: u64,
}

impl TypeRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn capabilities(&self) -> &[CapabilityId] {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &CapabilityId) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the export declares a factory
    pub fn has_factory(&self) -> bool {
        self.live_context()
            .map(|ctx| ctx.exports[self.index].factory().is_some())
            .unwrap_or(false)
    }

    fn live_context(&self) -> Option<Arc<LoadContext>> {
        self.context.upgrade().filter(|ctx| !ctx.is_retired())
    }

    /// Instantiate and return a guard keeping the owning context mapped
    ///
    /// The instance's code lives in the plugin binary, so whoever caches it
    /// must keep the guard alive at least as long as the instance.
    pub fn activate_guarded(
        &self,
        resolver: &dyn ServiceResolver,
    ) -> Result<(ServiceInstance, Arc<LoadContext>), ServiceError> {
        let context = self
            .live_context()
            .ok_or_else(|| ServiceError::ContextUnloaded(self.name.clone()))?;
        let factory = context.exports[self.index]
            .factory()
            .ok_or_else(|| ServiceError::NoFactory(self.name.clone()))?
            .clone();
        let instance = factory(resolver)?;
        Ok((instance, context))
    }
}

impl TypeActivator for TypeRef {
    fn activate(&self, resolver: &dyn ServiceResolver) -> Result<ModuleInstance, ServiceError> {
        let (instance, context) = self.activate_guarded(resolver)?;
        Ok(ModuleInstance::guarded(instance, context))
    }

    fn is_live(&self) -> bool {
        self.live_context().is_some()
    }
}

impl std::fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRef")
            .field("name", &self.name)
            .field("contract", &self.contract)
            .field("assembly", &self.assembly)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A loaded plugin binary
///
/// Dropping or [`unload`](PluginBinary::unload)ing it retires the context:
/// every [`TypeRef`] derived from it stops resolving. The backing library is
/// released once the last instance guard is gone.
pub struct PluginBinary {
    context: Arc<LoadContext>,
    version: String,
    hash: String,
}

impl PluginBinary {
    fn new(path: PathBuf, epoch: u64, hash: String, image: LoadedImage) -> Self {
        let LoadedImage { exports, backing } = image;
        let assembly = exports.assembly_name().to_string();
        let version = exports.version().to_string();

        Self {
            context: Arc::new(LoadContext {
                id: Uuid::now_v7(),
                path,
                assembly,
                epoch,
                retired: AtomicBool::new(false),
                exports: exports.into_types(),
                backing,
            }),
            version,
            hash,
        }
    }

    /// Canonical path of the binary
    pub fn path(&self) -> &Path {
        self.context.path()
    }

    pub fn assembly_name(&self) -> &str {
        self.context.assembly()
    }

    pub fn epoch(&self) -> u64 {
        self.context.epoch()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// SHA-256 of the file at load time
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn context_id(&self) -> Uuid {
        self.context.id()
    }

    /// Weak handle on the context, for liveness checks
    pub fn context(&self) -> Weak<LoadContext> {
        Arc::downgrade(&self.context)
    }

    /// References to every exported type
    pub fn types(&self) -> Vec<TypeRef> {
        let weak = Arc::downgrade(&self.context);
        self.context
            .exports
            .iter()
            .enumerate()
            .map(|(index, exported)| TypeRef {
                context: weak.clone(),
                index,
                name: exported.name().to_string(),
                contract: exported.contract().to_string(),
                // Copy into host-owned strings; borrowed markers may point into the library.
                capabilities: exported
                    .capabilities()
                    .iter()
                    .map(|c| CapabilityId::new(c.as_str()))
                    .collect(),
                assembly: self.context.assembly.clone(),
                epoch: self.context.epoch,
            })
            .collect()
    }

    /// Exported module types for one subsystem
    pub fn module_types(&self, kind: SubsystemKind) -> Vec<ModuleType> {
        let marker = kind.marker();
        self.types()
            .into_iter()
            .filter(|t| t.has_capability(&marker))
            .map(|t| {
                let name = t.name.clone();
                let assembly = t.assembly.clone();
                let epoch = t.epoch;
                ModuleType::new(name, assembly, epoch, kind, Arc::new(t))
            })
            .collect()
    }

    /// Retire the context. Dependent module registrations must already be removed.
    pub fn unload(self) {
        // Drop does the work.
    }
}

impl Drop for PluginBinary {
    fn drop(&mut self) {
        self.context.retire();
    }
}

impl std::fmt::Debug for PluginBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginBinary")
            .field("path", &self.path())
            .field("assembly", &self.assembly_name())
            .field("epoch", &self.epoch())
            .field("version", &self.version)
            .finish()
    }
}

/// File name filter for plugin binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPattern {
    /// Extension without the dot
    pub extension: String,
    /// Ignore patterns (`*suffix`, `prefix*` or exact file names)
    pub ignore_patterns: Vec<String>,
}

impl Default for PluginPattern {
    fn default() -> Self {
        Self {
            extension: std::env::consts::DLL_EXTENSION.to_string(),
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
        }
    }
}

impl PluginPattern {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            ..Self::default()
        }
    }

    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    /// Check whether a path names a plugin binary
    pub fn matches(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !ext.eq_ignore_ascii_case(&self.extension) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }
}

/// A binary that failed to load during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of one directory scan
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Paths loaded fresh in this scan
    pub loaded: Vec<PathBuf>,
    /// Paths whose content did not change; their context stays current
    pub unchanged: Vec<PathBuf>,
    /// Binaries that failed; a previously loaded version stays current
    pub failures: Vec<LoadFailure>,
    /// Previous contexts replaced by a fresh load of the same path
    pub superseded: Vec<PluginBinary>,
    /// Binaries whose file is gone
    pub removed: Vec<PluginBinary>,
    /// Previous contexts whose assembly name another file claimed in this scan
    pub displaced: Vec<PluginBinary>,
}

/// Plugin loader for managing dynamic plugin loading
pub struct PluginLoader {
    backend: Arc<dyn BinaryLoader>,
    pattern: PluginPattern,
    current: BTreeMap<PathBuf, PluginBinary>,
    epochs: HashMap<PathBuf, u64>,
}

impl PluginLoader {
    pub fn new(backend: Arc<dyn BinaryLoader>, pattern: PluginPattern) -> Self {
        Self {
            backend,
            pattern,
            current: BTreeMap::new(),
            epochs: HashMap::new(),
        }
    }

    pub fn pattern(&self) -> &PluginPattern {
        &self.pattern
    }

    /// Calculate file hash
    fn calculate_hash(path: &Path) -> Result<String, PluginLoadError> {
        let contents = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Recursively list plugin binaries under `dir`, sorted by canonical path
    pub fn enumerate(&self, dir: &Path) -> Vec<PathBuf> {
        if !dir.is_dir() {
            warn!("Plugin directory does not exist: {:?}", dir);
            return Vec::new();
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry under {:?}: {}", dir, e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && self.pattern.matches(entry.path()))
            .filter_map(|entry| match entry.path().canonicalize() {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Cannot canonicalize {:?}: {}", entry.path(), e);
                    None
                }
            })
            .collect();

        paths.sort();
        paths.dedup();
        paths
    }

    /// Load one file into a fresh context
    fn load_one(&self, path: &Path) -> Result<LoadedImage, PluginLoadError> {
        let image = self.backend.load(path)?;

        if image.exports().assembly_name().trim().is_empty() {
            return Err(PluginLoadError::InvalidPlugin(format!(
                "{:?} exports no assembly name",
                path
            )));
        }

        Ok(image)
    }

    /// Rescan `dir`, loading every plugin binary into a fresh context
    pub fn scan(&mut self, dir: &Path) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        let paths = self.enumerate(dir);
        let present: HashSet<&PathBuf> = paths.iter().collect();

        // Files that disappeared
        let gone: Vec<PathBuf> = self
            .current
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(binary) = self.current.remove(&path) {
                info!("Plugin binary removed: {:?} ({})", path, binary.assembly_name());
                outcome.removed.push(binary);
            }
        }

        let mut claimed: HashMap<String, PathBuf> = HashMap::new();

        for path in paths {
            let hash = match Self::calculate_hash(&path) {
                Ok(hash) => hash,
                Err(error) => {
                    warn!("Failed to read plugin {:?}: {}", path, error);
                    outcome.failures.push(LoadFailure {
                        path: path.clone(),
                        error: error.to_string(),
                    });
                    self.keep_previous(&path, &mut claimed, &mut outcome);
                    continue;
                }
            };

            if let Some(current) = self.current.get(&path) {
                if current.hash() == hash && !claimed.contains_key(current.assembly_name()) {
                    debug!("Plugin {:?} unchanged, keeping epoch {}", path, current.epoch());
                    claimed.insert(current.assembly_name().to_string(), path.clone());
                    outcome.unchanged.push(path);
                    continue;
                }
            }

            match self.load_one(&path) {
                Ok(image) => {
                    let assembly = image.exports().assembly_name().to_string();
                    if let Some(existing) = claimed.get(&assembly) {
                        let error = PluginLoadError::DuplicateAssembly {
                            assembly,
                            existing: existing.clone(),
                        };
                        warn!("Failed to load plugin {:?}: {}", path, error);
                        outcome.failures.push(LoadFailure {
                            path: path.clone(),
                            error: error.to_string(),
                        });
                        self.keep_previous(&path, &mut claimed, &mut outcome);
                        continue;
                    }

                    let epoch = {
                        let epoch = self.epochs.entry(path.clone()).or_insert(0);
                        *epoch += 1;
                        *epoch
                    };

                    let binary = PluginBinary::new(path.clone(), epoch, hash, image);
                    info!(
                        "Loaded plugin: {} v{} (epoch {}) from {:?}",
                        binary.assembly_name(),
                        binary.version(),
                        epoch,
                        path
                    );

                    claimed.insert(assembly, path.clone());
                    if let Some(previous) = self.current.insert(path.clone(), binary) {
                        debug!(
                            "Superseding {} epoch {}",
                            previous.assembly_name(),
                            previous.epoch()
                        );
                        outcome.superseded.push(previous);
                    }
                    outcome.loaded.push(path);
                }
                Err(error) => {
                    warn!("Failed to load plugin {:?}: {}", path, error);
                    outcome.failures.push(LoadFailure {
                        path: path.clone(),
                        error: error.to_string(),
                    });
                    self.keep_previous(&path, &mut claimed, &mut outcome);
                }
            }
        }

        outcome
    }

    /// A failed reload keeps the previous version current, unless its assembly name is taken
    ///
    /// A displaced binary is handed back in the outcome; its modules may
    /// still be registered, so it must outlive their removal.
    fn keep_previous(
        &mut self,
        path: &Path,
        claimed: &mut HashMap<String, PathBuf>,
        outcome: &mut LoadOutcome,
    ) {
        let Some(previous) = self.current.get(path) else {
            return;
        };
        let assembly = previous.assembly_name().to_string();
        if claimed.contains_key(&assembly) {
            if let Some(previous) = self.current.remove(path) {
                debug!(
                    "Displacing {} epoch {} from {:?}",
                    assembly,
                    previous.epoch(),
                    path
                );
                outcome.displaced.push(previous);
            }
            return;
        }
        debug!("Keeping {} epoch {} after failed reload", assembly, previous.epoch());
        claimed.insert(assembly, path.to_path_buf());
    }

    /// Undo a scan whose results were rejected
    ///
    /// Fresh loads are retired and the superseded, removed and displaced
    /// binaries become current again.
    pub fn rollback(&mut self, outcome: LoadOutcome) {
        for path in &outcome.loaded {
            if let Some(fresh) = self.current.remove(path) {
                debug!("Rolling back {} epoch {}", fresh.assembly_name(), fresh.epoch());
                fresh.unload();
            }
        }
        for binary in outcome
            .superseded
            .into_iter()
            .chain(outcome.removed)
            .chain(outcome.displaced)
        {
            self.current.insert(binary.path().to_path_buf(), binary);
        }
    }

    /// Move the loaded state out, leaving an empty loader on the same backend
    pub fn take(&mut self) -> PluginLoader {
        let empty = PluginLoader::new(self.backend.clone(), self.pattern.clone());
        std::mem::replace(self, empty)
    }

    /// Current binaries in enumeration order
    pub fn binaries(&self) -> impl Iterator<Item = &PluginBinary> {
        self.current.values()
    }

    pub fn get(&self, path: &Path) -> Option<&PluginBinary> {
        self.current.get(path)
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Detach every current binary, for teardown
    pub fn drain(&mut self) -> Vec<PluginBinary> {
        std::mem::take(&mut self.current).into_values().collect()
    }
}
