//! Shared-library backend
//!
//! Each load maps a private shadow copy of the binary, so the original file
//! stays free to be overwritten or deleted while the old version is still
//! mapped, and two versions of the same path can coexist during a rescan.

use std::path::{Path, PathBuf};

use glacier_kernel::{API_VERSION_SYMBOL, EXPORTS_SYMBOL, PLUGIN_API_VERSION, PluginExports};
use libloading::{Library, Symbol};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use super::loader::{BinaryLoader, LoadedImage, PluginLoadError};

type ApiVersionFn = unsafe extern "C" fn() -> u32;
type ExportsFn = unsafe extern "C" fn() -> *mut PluginExports;

/// A mapped shadow copy, released when the owning load context goes away
struct NativeImage {
    library: Option<Library>,
    shadow_path: PathBuf,
}

impl Drop for NativeImage {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                warn!("Failed to close plugin library {:?}: {}", self.shadow_path, e);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.shadow_path) {
            debug!("Shadow copy {:?} not removed: {}", self.shadow_path, e);
        }
    }
}

/// Loads plugin binaries as native shared libraries
pub struct NativeBinaryLoader {
    shadow_dir: TempDir,
    /// Accept binaries built against another ABI version
    unsafe_mode: bool,
}

impl NativeBinaryLoader {
    pub fn new() -> Result<Self, PluginLoadError> {
        Ok(Self {
            shadow_dir: tempfile::Builder::new().prefix("glacier-shadow-").tempdir()?,
            unsafe_mode: false,
        })
    }

    /// Skip the ABI version check
    pub fn with_unsafe_mode(mut self, enabled: bool) -> Self {
        self.unsafe_mode = enabled;
        self
    }

    pub fn shadow_dir(&self) -> &Path {
        self.shadow_dir.path()
    }

    fn shadow_copy(&self, path: &Path) -> Result<PathBuf, PluginLoadError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PluginLoadError::InvalidPlugin(format!("{:?} has no file name", path)))?;
        let shadow = self
            .shadow_dir
            .path()
            .join(format!("{}-{}", Uuid::now_v7(), file_name));
        std::fs::copy(path, &shadow)?;
        Ok(shadow)
    }

    /// # Safety
    ///
    /// Runs the library's initializers and calls its exported functions. The
    /// binary must have been built with `declare_plugin!` against this
    /// version of `glacier-kernel` and the same Rust toolchain.
    unsafe fn open(&self, shadow: &Path) -> Result<(Library, PluginExports), PluginLoadError> {
        let library = unsafe { Library::new(shadow) }
            .map_err(|e| PluginLoadError::LibraryLoad(e.to_string()))?;

        // Missing version symbol means a pre-versioning plugin.
        let api_version = unsafe {
            library
                .get::<ApiVersionFn>(API_VERSION_SYMBOL)
                .map(|f| f())
                .unwrap_or(1)
        };

        if !self.unsafe_mode && api_version != PLUGIN_API_VERSION {
            return Err(PluginLoadError::VersionMismatch {
                expected: PLUGIN_API_VERSION,
                actual: api_version,
            });
        }

        let exports = unsafe {
            let exports_fn: Symbol<ExportsFn> = library
                .get(EXPORTS_SYMBOL)
                .map_err(|e| PluginLoadError::SymbolNotFound(e.to_string()))?;
            let raw = exports_fn();
            if raw.is_null() {
                return Err(PluginLoadError::InvalidPlugin(
                    "export table is null".to_string(),
                ));
            }
            *Box::from_raw(raw)
        };

        Ok((library, exports))
    }
}

impl BinaryLoader for NativeBinaryLoader {
    fn load(&self, path: &Path) -> Result<LoadedImage, PluginLoadError> {
        let shadow = self.shadow_copy(path)?;
        debug!("Mapping {:?} from shadow copy {:?}", path, shadow);

        match unsafe { self.open(&shadow) } {
            Ok((library, exports)) => Ok(LoadedImage::with_backing(
                exports,
                Box::new(NativeImage {
                    library: Some(library),
                    shadow_path: shadow,
                }),
            )),
            Err(e) => {
                let _ = std::fs::remove_file(&shadow);
                Err(e)
            }
        }
    }
}
