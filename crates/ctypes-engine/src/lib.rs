//! ctypes engine - C type layout, memory and native calls
//!
//! This library provides a ctypes-style foreign function interface:
//! - Type registry and platform size tables
//! - Struct, union and bit-field layout
//! - Bounds-checked memory blocks, typed instances and pointers
//! - Native calls through libffi, including variadic functions
//! - Callback trampolines for native code calling host functions
//! - Errcheck hooks on bindings
//!
//! # Safety
//!
//! Calling native code cannot be made safe in general. Every operation that
//! trusts a caller-supplied signature or raw address is an `unsafe fn`
//! documenting the obligation it transfers; everything else is checked.
//!
//! # Example
//!
//! ```
//! use ctypes_engine::{CData, FieldSpec, Packing, TypeRegistry, Value};
//!
//! let registry = TypeRegistry::host();
//! let int = registry.by_name("int").unwrap();
//! let point = registry
//!     .define_struct(
//!         "Point",
//!         vec![FieldSpec::new("x", &int), FieldSpec::new("y", &int)],
//!         Packing::Natural,
//!     )
//!     .unwrap();
//!
//! let p = CData::new(&point).unwrap();
//! p.set("y", 7).unwrap();
//! assert_eq!(p.get("y").unwrap(), Value::Int(7));
//! assert_eq!(point.size(), 8);
//! ```

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod call;
pub mod callbacks;
pub mod errcheck;
pub mod error;
pub mod instance;
pub mod layout;
pub mod loader;
pub mod marshal;
pub mod memory;
pub mod pointer;
pub mod strings;
pub mod types;
pub mod value;

pub use call::{bind, CallConvention, CallableBinding, Signature, SignatureSpec};
pub use callbacks::{ErrorHandler, HostFn, Trampoline, TrampolineFactory};
pub use errcheck::{chain, ErrCheckFn, ErrCheckSlot, HookState};
pub use error::{BoxError, FfiError, FfiResult};
pub use instance::CData;
pub use layout::{
    compute_layout, BitSlot, CompositeKind, CompositeLayout, FieldDescriptor, FieldSpec, Member,
    Packing,
};
pub use loader::{LibraryLoader, NativeLibrary, Symbol};
pub use marshal::{infer_variadic_type, promote_variadic, MarshalContext};
pub use memory::{MemoryBlock, MemoryView, Retained};
pub use pointer::TypedPointer;
pub use strings::{
    buffer_string, create_string_buffer, create_string_buffer_sized, create_unicode_buffer,
    read_cstring, BoundedOutput,
};
pub use types::{DataModel, PlatformTable, PointerTarget, Primitive, TypeDescriptor, TypeKind, TypeRegistry};
pub use value::Value;

use ctypes_config::EngineConfig;
use std::collections::BTreeMap;
use tracing::debug;

/// Configured entry point tying the registry, loader and callbacks together
///
/// Setting `allow_foreign_reads = true` in configuration is the opt-in for
/// the unsafe foreign-read capability: bindings and callbacks created by the
/// engine then return pointers that can be dereferenced directly.
pub struct Engine {
    config: EngineConfig,
    registry: TypeRegistry,
    loader: LibraryLoader,
    callbacks: TrampolineFactory,
}

impl Engine {
    /// An engine for the host platform with default settings
    pub fn new() -> Self {
        Self::from_config(EngineConfig::default())
    }

    pub fn from_config(config: EngineConfig) -> Self {
        let registry = TypeRegistry::from_config(&config);
        let loader = LibraryLoader::from_config(&config);
        let callbacks = if config.allow_foreign_reads() {
            // Safety: the configuration opted in to foreign reads
            unsafe { TrampolineFactory::new().with_foreign_reads() }
        } else {
            TrampolineFactory::new()
        };

        debug!(
            data_model = ?registry.platform().data_model,
            declared_functions = config.functions.len(),
            "engine initialized"
        );

        Self {
            config,
            registry,
            loader,
            callbacks,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn callbacks(&self) -> &TrampolineFactory {
        &self.callbacks
    }

    pub fn loader_mut(&mut self) -> &mut LibraryLoader {
        &mut self.loader
    }

    pub fn load_library(&mut self, name: &str) -> FfiResult<NativeLibrary> {
        self.loader.load(name)
    }

    /// The running process, for symbols of libc and the executable
    pub fn process(&self) -> FfiResult<NativeLibrary> {
        LibraryLoader::open_self()
    }

    /// Resolve a signature declaration against this engine's registry
    ///
    /// Fails when the registry describes another platform: its layouts can
    /// be inspected but never called with.
    pub fn resolve_signature(&self, function: &str, spec: &SignatureSpec) -> FfiResult<Signature> {
        if !self.registry.platform().is_host() {
            return Err(FfiError::UnsupportedConvention {
                function: function.to_string(),
                convention: spec.convention.to_string(),
                reason: format!(
                    "the registry models {:?}, not the running platform",
                    self.registry.platform().data_model
                ),
            });
        }
        spec.resolve(&self.registry)
    }

    /// Resolve `symbol` in `library` (or the running process) and bind it
    ///
    /// # Safety
    ///
    /// The native function's actual signature and calling convention must
    /// match `signature`.
    pub unsafe fn bind(
        &mut self,
        library: Option<&str>,
        symbol: &str,
        signature: Signature,
    ) -> FfiResult<CallableBinding> {
        let lib = match library {
            Some(name) => self.loader.load(name)?,
            None => LibraryLoader::open_self()?,
        };
        let resolved = lib.symbol(symbol)?;
        let mut binding = bind(&resolved, signature)?;
        if self.config.allow_foreign_reads() {
            binding.allow_foreign_reads();
        }
        Ok(binding)
    }

    /// Bind a function declared in configuration under `[functions.<name>]`
    ///
    /// # Safety
    ///
    /// The declaration must match the native function.
    pub unsafe fn bind_declared(&mut self, name: &str) -> FfiResult<CallableBinding> {
        let decl = self
            .config
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| FfiError::SymbolNotFound {
                library: "<configuration>".to_string(),
                symbol: name.to_string(),
            })?;
        let signature = self.resolve_signature(name, &SignatureSpec::from_decl(&decl))?;
        self.bind(decl.library.as_deref(), decl.symbol_name(name), signature)
    }

    /// Bind every declared function, keyed by declaration name
    ///
    /// # Safety
    ///
    /// Every declaration must match its native function.
    pub unsafe fn bind_manifest(&mut self) -> FfiResult<BTreeMap<String, CallableBinding>> {
        let names: Vec<String> = self.config.functions.keys().cloned().collect();
        let mut bindings = BTreeMap::new();
        for name in names {
            let binding = self.bind_declared(&name)?;
            bindings.insert(name, binding);
        }
        Ok(bindings)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_undeclared_function() {
        let mut engine = Engine::new();
        let err = unsafe { engine.bind_declared("nope") }.unwrap_err();
        assert!(matches!(err, FfiError::SymbolNotFound { .. }));
    }

    #[test]
    fn test_layout_only_registry_refuses_binding() {
        let mut config = EngineConfig::default();
        let foreign_model = if cfg!(windows) {
            ctypes_config::DataModelName::Lp64
        } else {
            ctypes_config::DataModelName::Llp64
        };
        config.platform = Some(ctypes_config::PlatformConfig {
            data_model: Some(foreign_model),
            wchar_size: None,
        });
        let engine = Engine::from_config(config);
        let spec = SignatureSpec::from_json(r#"{"argTypes": ["long"], "returnType": "long"}"#).unwrap();
        assert!(matches!(
            engine.resolve_signature("labs", &spec),
            Err(FfiError::UnsupportedConvention { .. })
        ));
    }
}
