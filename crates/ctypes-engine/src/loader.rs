//! Library resolution for native bindings
//!
//! Maps bare names like `m` to `libm.so`, `libm.dylib` or `m.dll`, walks the
//! configured search paths before the system ones, and falls back to the OS
//! loader. Opened libraries are cached by name.

use crate::error::{FfiError, FfiResult};
use crate::pointer::TypedPointer;
use crate::types::TypeDescriptor;
use ctypes_config::EngineConfig;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Name reported for symbols of the running process
pub const PROCESS_LIBRARY: &str = "<process>";

/// A loaded native library
#[derive(Clone)]
pub struct NativeLibrary {
    name: String,
    handle: Arc<Library>,
}

impl NativeLibrary {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve an exported symbol
    pub fn symbol(&self, name: &str) -> FfiResult<Symbol> {
        let not_found = || FfiError::SymbolNotFound {
            library: self.name.clone(),
            symbol: name.to_string(),
        };

        // Safety: the symbol is only read as an address, never called here
        let address = unsafe {
            self.handle
                .get::<*mut c_void>(name.as_bytes())
                .map(|sym| *sym as usize)
                .map_err(|_| not_found())?
        };
        if address == 0 {
            return Err(not_found());
        }

        debug!(library = %self.name, symbol = name, address, "symbol resolved");
        Ok(Symbol {
            library: self.name.clone(),
            name: name.to_string(),
            address,
            handle: Arc::clone(&self.handle),
        })
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary").field("name", &self.name).finish()
    }
}

/// A resolved symbol; keeps its library loaded
#[derive(Clone)]
pub struct Symbol {
    library: String,
    name: String,
    address: usize,
    handle: Arc<Library>,
}

impl Symbol {
    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub(crate) fn handle(&self) -> Arc<Library> {
        Arc::clone(&self.handle)
    }

    /// A data symbol viewed as a pointer to `target` (e.g. `errno`-style globals)
    ///
    /// The pointer is foreign: dereferencing it requires
    /// [`TypedPointer::grant_foreign_access`].
    pub fn as_pointer(&self, target: &TypeDescriptor) -> TypedPointer {
        TypedPointer::wrap_foreign_pointer(self.address, target)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("library", &self.library)
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

/// Resolves and caches native libraries by name
///
/// # Safety
///
/// Loading a dynamic library runs its initialization code inside this
/// process; only load trusted libraries.
pub struct LibraryLoader {
    /// Loaded libraries by resolved path (or OS-loader name)
    loaded: HashMap<PathBuf, NativeLibrary>,
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    /// A loader with the platform default search paths
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// A loader whose configured search paths come before the defaults
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut loader = Self::new();
        for path in config.search_paths().iter().rev() {
            loader.add_search_path(path.clone());
        }
        loader
    }

    /// Platform default library directories, current directory first
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(system_root).join("System32"));
            }
            paths.push(PathBuf::from("C:\\Windows\\System32"));
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Candidate file names for `name`: `lib{name}.so`, `lib{name}.dylib`, `{name}.dll`
    fn candidate_names(name: &str) -> Vec<String> {
        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        let mut names = Vec::new();
        for prefix in prefixes {
            for ext in extensions {
                names.push(format!("{}{}.{}", prefix, name, ext));
            }
        }
        names
    }

    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        for dir in &self.search_paths {
            let direct = dir.join(name);
            if direct.is_file() {
                return Some(direct);
            }
            for candidate in Self::candidate_names(name) {
                let full = dir.join(&candidate);
                if full.exists() {
                    return Some(full);
                }
            }
        }
        None
    }

    /// Load a library by short name (`"m"`), file name or path
    ///
    /// Names not found in the search paths are handed to the OS loader,
    /// which applies its own rules (`LD_LIBRARY_PATH`, the dyld cache).
    pub fn load(&mut self, name: &str) -> FfiResult<NativeLibrary> {
        match self.resolve_library_path(name) {
            Some(path) => {
                if let Some(lib) = self.loaded.get(&path) {
                    return Ok(lib.clone());
                }
                // Safety: the caller chose to trust this library
                let library = unsafe { Library::new(&path) }.map_err(|e| FfiError::LibraryLoad {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
                debug!(library = name, path = %path.display(), "library loaded");
                Ok(self.cache(path, name, library))
            }
            None => self.load_from_os(name),
        }
    }

    fn load_from_os(&mut self, name: &str) -> FfiResult<NativeLibrary> {
        let key = PathBuf::from(format!("os:{}", name));
        if let Some(lib) = self.loaded.get(&key) {
            return Ok(lib.clone());
        }

        let attempts = [
            PathBuf::from(name),
            PathBuf::from(libloading::library_filename(name)),
        ];
        for attempt in &attempts {
            // Safety: the caller chose to trust this library
            if let Ok(library) = unsafe { Library::new(attempt) } {
                debug!(library = name, file = %attempt.display(), "library loaded by the OS loader");
                return Ok(self.cache(key, name, library));
            }
        }

        debug!(library = name, "library not found");
        Err(FfiError::LibraryNotFound {
            name: name.to_string(),
        })
    }

    fn cache(&mut self, key: PathBuf, name: &str, library: Library) -> NativeLibrary {
        let lib = NativeLibrary {
            name: name.to_string(),
            handle: Arc::new(library),
        };
        self.loaded.insert(key, lib.clone());
        lib
    }

    /// The running process itself (the executable and everything it links)
    pub fn open_self() -> FfiResult<NativeLibrary> {
        #[cfg(unix)]
        let library: Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let library: Library = libloading::os::windows::Library::this()
            .map_err(|e| FfiError::LibraryLoad {
                name: PROCESS_LIBRARY.to_string(),
                reason: e.to_string(),
            })?
            .into();

        Ok(NativeLibrary {
            name: PROCESS_LIBRARY.to_string(),
            handle: Arc::new(library),
        })
    }

    /// Prepend a search directory
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_search_paths_start_with_cwd() {
        let paths = LibraryLoader::default_search_paths();
        assert!(!paths.is_empty());
        if let Ok(cwd) = std::env::current_dir() {
            assert_eq!(paths[0], cwd);
        }
    }

    #[test]
    fn test_candidate_names() {
        let names = LibraryLoader::candidate_names("m");
        #[cfg(target_os = "linux")]
        assert_eq!(names, vec!["libm.so", "m.so"]);
        #[cfg(target_os = "windows")]
        assert_eq!(names, vec!["m.dll", "libm.dll"]);
        #[cfg(target_os = "macos")]
        assert!(names.contains(&"libm.dylib".to_string()));
    }

    #[test]
    fn test_library_not_found() {
        let mut loader = LibraryLoader::new();
        let result = loader.load("nonexistent_library_xyz");
        assert!(matches!(result, Err(FfiError::LibraryNotFound { .. })));
        assert_eq!(loader.loaded_count(), 0);
    }

    #[test]
    fn test_configured_paths_come_first() {
        let mut config = EngineConfig::default();
        config.library = Some(ctypes_config::LibraryConfig {
            search_paths: vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")],
        });
        let loader = LibraryLoader::from_config(&config);
        assert_eq!(loader.search_paths()[0], PathBuf::from("/opt/a"));
        assert_eq!(loader.search_paths()[1], PathBuf::from("/opt/b"));
    }

    #[cfg(unix)]
    #[test]
    fn test_open_self_resolves_libc() {
        let process = LibraryLoader::open_self().unwrap();
        let strlen = process.symbol("strlen").unwrap();
        assert_ne!(strlen.address(), 0);
        assert_eq!(strlen.library(), PROCESS_LIBRARY);

        let err = process.symbol("definitely_not_a_symbol_xyz").unwrap_err();
        assert!(matches!(err, FfiError::SymbolNotFound { .. }));
    }
}
