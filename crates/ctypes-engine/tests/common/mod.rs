//! Shared test helpers

#![allow(dead_code)]

use ctypes_engine::{CallableBinding, Signature, TypeDescriptor, TypeRegistry};

pub use pretty_assertions::{assert_eq, assert_ne};

/// Host registry type by name
pub fn ty(name: &str) -> TypeDescriptor {
    TypeRegistry::host()
        .by_name(name)
        .unwrap_or_else(|e| panic!("type {}: {}", name, e))
}

/// Bind an `extern "C"` function defined in the test itself
pub fn bind_local(name: &str, address: usize, args: &[&str], returns: &str) -> CallableBinding {
    let signature = Signature::new(args.iter().map(|a| ty(a)).collect(), ty(returns));
    unsafe { CallableBinding::from_address(name, address, signature) }
        .unwrap_or_else(|e| panic!("binding {}: {}", name, e))
}
