//! Callback trampolines - native code calling host functions
//!
//! `TrampolineFactory::create` wraps a host closure in a libffi closure and
//! hands back a native entry point. When native code calls it, the
//! trampoline:
//! 1. Decodes the raw argument frame into host values
//! 2. Calls the host function on the calling thread
//! 3. Encodes the result into the native return slot
//!
//! A failing or panicking host function never unwinds into native code.
//! The return slot is zeroed instead, the failure is recorded as the
//! trampoline's last error, handed to the error handler and logged.
//!
//! # Safety
//!
//! The entry point is valid until the `Trampoline` is dropped or released.
//! Native code calling it after that is undefined behavior; keeping the
//! trampoline alive for as long as native code holds the pointer is the
//! owner's obligation (use [`Trampoline::leak`] for process-lifetime
//! callbacks).
//!
//! Strings and instances referenced by a `char*`, `wchar_t*` or pointer
//! return value stay allocated until the trampoline is released, whichever
//! thread made the call. Native code must not use them after that.

use crate::call::{build_cif, CallConvention};
use crate::error::{BoxError, FfiError, FfiResult};
use crate::marshal::decode_at;
use crate::memory::{integer_bits, mask, sign_extend, MemoryBlock};
use crate::pointer::TypedPointer;
use crate::types::{TypeDescriptor, TypeKind};
use crate::value::Value;
use libffi::middle::Cif;
use libffi::raw;
use std::any::Any;
use std::ffi::c_void;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Host function behind a trampoline
pub type HostFn = Box<dyn Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync>;

/// Receives failures raised inside a trampoline
pub type ErrorHandler = Box<dyn Fn(&FfiError) + Send + Sync>;

/// Builds trampolines
#[derive(Debug, Clone, Default)]
pub struct TrampolineFactory {
    foreign_reads: bool,
}

impl TrampolineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant foreign access to pointer arguments passed to callbacks
    ///
    /// # Safety
    ///
    /// Every pointer native code passes to a callback must be valid for its
    /// declared target type while the callback runs.
    pub unsafe fn with_foreign_reads(mut self) -> Self {
        self.foreign_reads = true;
        self
    }

    /// Create a native entry point for `host_fn`
    pub fn create<F>(
        &self,
        name: &str,
        host_fn: F,
        args: Vec<TypeDescriptor>,
        returns: TypeDescriptor,
        convention: CallConvention,
    ) -> FfiResult<Trampoline>
    where
        F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        if returns.element().is_some() {
            return Err(FfiError::unsupported(returns.name(), "callbacks cannot return arrays"));
        }
        let cif = Box::new(build_cif(name, &args, &returns, convention, None)?);
        let context = Box::new(CallbackContext {
            name: name.to_string(),
            host: Box::new(host_fn),
            args,
            returns,
            foreign_reads: self.foreign_reads,
            last_error: Mutex::new(None),
            handler: Mutex::new(None),
            returned: Mutex::new(Vec::new()),
        });

        let mut code: *mut c_void = ptr::null_mut();
        let closure = unsafe { raw::ffi_closure_alloc(mem::size_of::<raw::ffi_closure>(), &mut code) }
            as *mut raw::ffi_closure;
        if closure.is_null() {
            return Err(FfiError::Callback {
                callback: name.to_string(),
                reason: "libffi could not allocate closure memory".to_string(),
            });
        }

        let userdata = &*context as *const CallbackContext as *mut c_void;
        let status = unsafe {
            raw::ffi_prep_closure_loc(closure, cif.as_raw_ptr(), Some(trampoline_entry), userdata, code)
        };
        if status != raw::ffi_status_FFI_OK {
            unsafe { raw::ffi_closure_free(closure as *mut c_void) };
            return Err(FfiError::Callback {
                callback: name.to_string(),
                reason: format!("libffi rejected the closure (status {})", status),
            });
        }

        debug!(callback = name, args = context.args.len(), code = code as usize, "trampoline created");

        Ok(Trampoline {
            closure,
            code: code as usize,
            _cif: cif,
            context,
        })
    }
}

/// Capture context shared between a trampoline and its entry point
struct CallbackContext {
    name: String,
    host: HostFn,
    args: Vec<TypeDescriptor>,
    returns: TypeDescriptor,
    foreign_reads: bool,
    last_error: Mutex<Option<FfiError>>,
    handler: Mutex<Option<ErrorHandler>>,
    /// Keeps host memory referenced by returned values alive until release
    returned: Mutex<Vec<MemoryBlock>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallbackContext {
    /// # Safety
    ///
    /// `args` must hold one valid pointer per declared argument type and
    /// `result` must be libffi's return slot for `self.returns`.
    unsafe fn dispatch(&self, result: *mut c_void, args: *mut *mut c_void) -> FfiResult<()> {
        let mut values = Vec::with_capacity(self.args.len());
        for (i, ty) in self.args.iter().enumerate() {
            let slot = *args.add(i) as *const u8;
            values.push(self.grant(decode_at(ty, slot)?));
        }

        let returned = (self.host)(&values).map_err(|e| FfiError::Callback {
            callback: self.name.clone(),
            reason: e.to_string(),
        })?;
        self.encode_return(result, &returned)
    }

    fn grant(&self, value: Value) -> Value {
        match value {
            Value::Pointer(p) if self.foreign_reads && p.is_foreign() => {
                // Safety: with_foreign_reads moved this obligation to the factory's owner
                Value::Pointer(unsafe { p.grant_foreign_access() })
            }
            other => other,
        }
    }

    unsafe fn encode_return(&self, result: *mut c_void, value: &Value) -> FfiResult<()> {
        let ty = &self.returns;
        match ty.kind() {
            TypeKind::Void => Ok(()),
            TypeKind::Bool | TypeKind::Int { .. } if ty.size() < mem::size_of::<raw::ffi_arg>() => {
                let width = ty.size() * 8;
                let bits = integer_bits(ty, value)? & mask(width as u32);
                let widened = if ty.is_signed() {
                    sign_extend(bits, width) as u64
                } else {
                    bits
                };
                (result as *mut raw::ffi_arg).write(widened as raw::ffi_arg);
                Ok(())
            }
            _ => {
                let staging = MemoryBlock::allocate(ty.size())?;
                staging.view().write(ty, 0, value)?;
                ptr::copy_nonoverlapping(staging.as_ptr(), result as *mut u8, ty.size());
                if staging.retained_count() > 0 {
                    lock(&self.returned).push(staging);
                }
                Ok(())
            }
        }
    }

    fn return_slot_size(&self) -> usize {
        match self.returns.kind() {
            TypeKind::Void => 0,
            TypeKind::Bool | TypeKind::Int { .. } => self.returns.size().max(mem::size_of::<raw::ffi_arg>()),
            _ => self.returns.size(),
        }
    }

    /// # Safety
    ///
    /// `result` must be libffi's return slot for `self.returns`.
    unsafe fn fail(&self, result: *mut c_void, error: FfiError) {
        ptr::write_bytes(result as *mut u8, 0, self.return_slot_size());
        warn!(callback = %self.name, error = %error, "host callback failed; returning zero to native caller");

        if let Some(handler) = lock(&self.handler).as_ref() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&error))).is_err() {
                warn!(callback = %self.name, "callback error handler panicked");
            }
        }
        *lock(&self.last_error) = Some(error);
    }
}

unsafe extern "C" fn trampoline_entry(
    _cif: *mut raw::ffi_cif,
    result: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let context = &*(userdata as *const CallbackContext);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| context.dispatch(result, args)));
    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => FfiError::Callback {
            callback: context.name.clone(),
            reason: format!("panicked: {}", panic_message(payload.as_ref())),
        },
    };
    context.fail(result, error);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A native entry point forwarding to a host function
pub struct Trampoline {
    closure: *mut raw::ffi_closure,
    code: usize,
    _cif: Box<Cif>,
    context: Box<CallbackContext>,
}

// Safety: the closure and CIF are immutable after creation; the context's
// mutable state sits behind mutexes and the host function is Send + Sync.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Native entry point address
    pub fn code_address(&self) -> usize {
        self.code
    }

    /// The entry point as a `void*`, for passing to function-pointer parameters
    pub fn as_pointer(&self) -> TypedPointer {
        TypedPointer::wrap_foreign_pointer(self.code, &TypeDescriptor::void())
    }

    pub fn arg_types(&self) -> &[TypeDescriptor] {
        &self.context.args
    }

    pub fn return_type(&self) -> &TypeDescriptor {
        &self.context.returns
    }

    /// Message of the most recent failure, if any
    pub fn last_error(&self) -> Option<String> {
        lock(&self.context.last_error).as_ref().map(|e| e.to_string())
    }

    pub fn take_last_error(&self) -> Option<FfiError> {
        lock(&self.context.last_error).take()
    }

    /// Number of return values whose host memory is still held
    pub fn held_returns(&self) -> usize {
        lock(&self.context.returned).len()
    }

    /// Install a handler for failures raised inside the callback
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&FfiError) + Send + Sync + 'static,
    {
        *lock(&self.context.handler) = Some(Box::new(handler));
    }

    /// Free the entry point now
    pub fn release(self) {
        drop(self);
    }

    /// Keep the entry point alive for the rest of the process
    pub fn leak(self) -> usize {
        let code = self.code;
        debug!(callback = %self.context.name, code, "trampoline leaked");
        mem::forget(self);
        code
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        debug!(callback = %self.context.name, code = self.code, "trampoline released");
        unsafe { raw::ffi_closure_free(self.closure as *mut c_void) };
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("name", &self.context.name)
            .field("code", &format_args!("{:#x}", self.code))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Primitive, TypeRegistry};

    fn int32() -> TypeDescriptor {
        TypeRegistry::host().describe(Primitive::Int32).unwrap()
    }

    #[test]
    fn test_trampoline_round_trip() {
        let tramp = TrampolineFactory::new()
            .create(
                "double_it",
                |args: &[Value]| Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2)),
                vec![int32()],
                int32(),
                CallConvention::Default,
            )
            .unwrap();
        let f: extern "C" fn(i32) -> i32 = unsafe { mem::transmute(tramp.code_address()) };
        assert_eq!(f(21), 42);
        assert!(tramp.last_error().is_none());
    }

    #[test]
    fn test_failure_zeroes_return() {
        let tramp = TrampolineFactory::new()
            .create(
                "fails",
                |_: &[Value]| Err("boom".into()),
                vec![],
                int32(),
                CallConvention::Default,
            )
            .unwrap();
        let f: extern "C" fn() -> i32 = unsafe { mem::transmute(tramp.code_address()) };
        assert_eq!(f(), 0);
        assert!(tramp.last_error().unwrap().contains("boom"));
        assert!(matches!(tramp.take_last_error(), Some(FfiError::Callback { .. })));
        assert!(tramp.last_error().is_none());
    }

    #[test]
    fn test_panic_does_not_unwind() {
        let tramp = TrampolineFactory::new()
            .create(
                "panics",
                |_: &[Value]| panic!("host bug"),
                vec![],
                int32(),
                CallConvention::Default,
            )
            .unwrap();
        let f: extern "C" fn() -> i32 = unsafe { mem::transmute(tramp.code_address()) };
        assert_eq!(f(), 0);
        assert!(tramp.last_error().unwrap().contains("host bug"));
    }

    #[test]
    fn test_returned_strings_outlive_later_calls() {
        use std::ffi::{c_char, CStr};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = AtomicUsize::new(0);
        let char_ptr = TypeRegistry::host().describe(Primitive::CString).unwrap();
        let tramp = TrampolineFactory::new()
            .create(
                "next_name",
                move |_: &[Value]| Ok(Value::Str(format!("name-{}", calls.fetch_add(1, Ordering::SeqCst)))),
                vec![],
                char_ptr,
                CallConvention::Default,
            )
            .unwrap();
        let f: extern "C" fn() -> *const c_char = unsafe { mem::transmute(tramp.code_address()) };

        let first = f();
        let second = f();
        assert_eq!(unsafe { CStr::from_ptr(first) }.to_str().unwrap(), "name-0");
        assert_eq!(unsafe { CStr::from_ptr(second) }.to_str().unwrap(), "name-1");
        assert_eq!(tramp.held_returns(), 2);
    }

    #[test]
    fn test_scalar_returns_hold_nothing() {
        let double = TypeRegistry::host().describe(Primitive::Double).unwrap();
        let tramp = TrampolineFactory::new()
            .create("half", |_: &[Value]| Ok(Value::Double(0.5)), vec![], double, CallConvention::Default)
            .unwrap();
        let f: extern "C" fn() -> f64 = unsafe { mem::transmute(tramp.code_address()) };
        assert_eq!(f(), 0.5);
        assert_eq!(f(), 0.5);
        assert_eq!(tramp.held_returns(), 0);
    }

    #[test]
    fn test_narrow_signed_return_widened() {
        let int8 = TypeRegistry::host().describe(Primitive::Int8).unwrap();
        let tramp = TrampolineFactory::new()
            .create(
                "minus_one",
                |_: &[Value]| Ok(Value::Int(-1)),
                vec![],
                int8,
                CallConvention::Default,
            )
            .unwrap();
        let f: extern "C" fn() -> i8 = unsafe { mem::transmute(tramp.code_address()) };
        assert_eq!(f(), -1);
    }
}
