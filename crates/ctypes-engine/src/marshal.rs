//! Argument marshaling - host values ↔ native call frames
//!
//! - `MarshalContext::push()`: encode one argument into its own slot
//! - `MarshalContext::frame()`: the `void**` array libffi consumes
//! - `decode_return()`: interpret raw return bytes per the declared type
//!
//! # Memory Safety
//!
//! - Every argument slot is a zeroed block owned by the context
//! - Strings and instances referenced by an argument are retained by its slot
//! - The context must outlive the native call it builds a frame for

use crate::error::{FfiError, FfiResult};
use crate::instance::CData;
use crate::memory::{int_value, MemoryBlock};
use crate::strings::read_wide_raw;
use crate::types::{PointerTarget, Primitive, TypeDescriptor, TypeKind, TypeRegistry};
use crate::value::Value;
use libffi::raw::ffi_arg;
use std::ffi::{c_char, c_void, CStr};
use std::mem;
use tracing::trace;

/// Smallest slot handed to libffi; covers register-widened integer returns
const SLOT_MIN: usize = mem::size_of::<u64>();

/// Argument storage for one native call
///
/// # Example
///
/// ```
/// # use ctypes_engine::{MarshalContext, Primitive, TypeRegistry, Value};
/// let registry = TypeRegistry::host();
/// let int = registry.describe(Primitive::Int32).unwrap();
/// let mut ctx = MarshalContext::new();
/// ctx.push("abs", 1, &int, &Value::Int(-5)).unwrap();
/// assert_eq!(ctx.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MarshalContext {
    slots: Vec<MemoryBlock>,
}

impl MarshalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `value` as argument `position` (1-based) of type `ty`
    ///
    /// Array-typed parameters decay to pointers: lists and strings are
    /// materialized into a temporary array kept alive by the slot.
    pub fn push(
        &mut self,
        function: &str,
        position: usize,
        ty: &TypeDescriptor,
        value: &Value,
    ) -> FfiResult<()> {
        let slot = MemoryBlock::allocate(ty.size().max(SLOT_MIN))?;
        let encoded = match ty.element() {
            Some((element, _)) => {
                let decayed = TypeRegistry::host().pointer_to(element);
                let value = match value {
                    Value::List(_) | Value::Str(_) => Value::CData(CData::from_value(ty, value.clone())?),
                    other => other.clone(),
                };
                slot.view().write(&decayed, 0, &value)
            }
            None => slot.view().write(ty, 0, value),
        };
        encoded.map_err(|e| e.at_argument(function, position))?;
        self.slots.push(slot);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Pointers to each argument slot, in order
    pub(crate) fn frame(&self) -> Vec<*mut c_void> {
        self.slots.iter().map(|s| s.as_ptr() as *mut c_void).collect()
    }
}

/// Native type a trailing variadic argument is passed as, before promotion
///
/// Returns `None` for values with no C representation in a variadic frame.
pub fn infer_variadic_type(registry: &TypeRegistry, value: &Value) -> Option<TypeDescriptor> {
    let primitive = match value {
        Value::Str(_) => Primitive::CString,
        Value::Int(i) if i32::try_from(*i).is_ok() => Primitive::Int32,
        Value::Int(_) => Primitive::Int64,
        Value::UInt(u) if u32::try_from(*u).is_ok() => Primitive::UInt32,
        Value::UInt(_) => Primitive::UInt64,
        Value::Double(_) => Primitive::Double,
        Value::Float(_) => Primitive::Float,
        Value::Bool(_) => Primitive::Int32,
        Value::Null | Value::Pointer(_) => Primitive::Pointer,
        Value::CData(c) if c.type_descriptor().is_scalar() => {
            return Some(c.type_descriptor().clone());
        }
        Value::CData(_) => Primitive::Pointer,
        Value::Void | Value::Record(_) | Value::List(_) => return None,
    };
    registry.describe(primitive).ok()
}

/// Apply C default argument promotions
///
/// Integers narrower than `int` widen to `int`; `float` widens to `double`.
pub fn promote_variadic(registry: &TypeRegistry, ty: &TypeDescriptor) -> FfiResult<TypeDescriptor> {
    let int = registry.describe(Primitive::Int32)?;
    let promoted = match ty.kind() {
        TypeKind::Bool => int,
        TypeKind::Int { .. } if ty.size() < int.size() => int,
        TypeKind::Float { bits: 32 } => registry.describe(Primitive::Double)?,
        _ => return Ok(ty.clone()),
    };
    trace!(from = ty.name(), to = promoted.name(), "variadic promotion");
    Ok(promoted)
}

/// Interpret the return buffer of a finished call
pub(crate) fn decode_return(ty: &TypeDescriptor, ret: &MemoryBlock) -> FfiResult<Value> {
    match ty.kind() {
        TypeKind::Void => Ok(Value::Void),
        TypeKind::Bool | TypeKind::Int { .. } if ty.size() < mem::size_of::<ffi_arg>() => {
            // libffi widens small integral returns to a full ffi_arg
            let raw = unsafe { (ret.as_ptr() as *const ffi_arg).read() } as u64;
            Ok(match ty.kind() {
                TypeKind::Bool => Value::Bool(raw & 0xff != 0),
                _ => int_value(raw, ty.size() * 8, ty.is_signed()),
            })
        }
        TypeKind::Array { .. } => Err(FfiError::unsupported(ty.name(), "C functions cannot return arrays")),
        // Safety: the block holds at least one value of the declared type
        _ => unsafe { decode_at(ty, ret.as_ptr()) },
    }
}

/// Decode one value of type `ty` stored at `p`
///
/// Composites are copied into a fresh block; `char*` and `wchar_t*` become
/// host strings.
///
/// # Safety
///
/// `p` must be valid for reading `ty.size()` bytes, and string pointers
/// stored there must be NUL-terminated.
pub(crate) unsafe fn decode_at(ty: &TypeDescriptor, p: *const u8) -> FfiResult<Value> {
    match ty.kind() {
        TypeKind::Void => Ok(Value::Void),
        TypeKind::Pointer(PointerTarget::CString) => {
            let address = native_address(std::slice::from_raw_parts(p, ty.size()));
            if address == 0 {
                return Ok(Value::Null);
            }
            let text = CStr::from_ptr(address as *const c_char);
            Ok(Value::Str(text.to_string_lossy().into_owned()))
        }
        TypeKind::Pointer(PointerTarget::WString { wchar_size }) => {
            let address = native_address(std::slice::from_raw_parts(p, ty.size()));
            if address == 0 {
                return Ok(Value::Null);
            }
            Ok(Value::Str(read_wide_raw(address, *wchar_size)))
        }
        TypeKind::Struct(_) | TypeKind::Union(_) | TypeKind::Array { .. } => {
            let block = MemoryBlock::allocate(ty.size())?;
            std::ptr::copy_nonoverlapping(p, block.as_ptr(), ty.size());
            Ok(Value::CData(CData::from_block(ty, &block, 0)?))
        }
        _ => MemoryBlock::wrap_native(p as usize, ty.size())?.view().read(ty, 0),
    }
}

fn native_address(bytes: &[u8]) -> usize {
    let mut buf = [0u8; mem::size_of::<usize>()];
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    usize::from_ne_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        TypeRegistry::host()
    }

    #[test]
    fn test_push_reports_position() {
        let int = registry().describe(Primitive::Int32).unwrap();
        let mut ctx = MarshalContext::new();
        ctx.push("abs", 1, &int, &Value::Int(1)).unwrap();
        let err = ctx.push("abs", 2, &int, &Value::from("nope")).unwrap_err();
        assert!(matches!(err, FfiError::ArgumentType { position: 2, .. }));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_string_argument_kept_alive() {
        let cstr = registry().describe(Primitive::CString).unwrap();
        let mut ctx = MarshalContext::new();
        ctx.push("puts", 1, &cstr, &Value::from("hi")).unwrap();
        let slot = ctx.frame()[0] as *const *const c_char;
        let text = unsafe { CStr::from_ptr(*slot) };
        assert_eq!(text.to_str().unwrap(), "hi");
    }

    #[test]
    fn test_variadic_inference() {
        let r = registry();
        let name = |v: Value| infer_variadic_type(&r, &v).map(|t| t.name().to_string());
        assert_eq!(name(Value::Int(5)).as_deref(), Some("int32"));
        assert_eq!(name(Value::Int(1 << 40)).as_deref(), Some("int64"));
        assert_eq!(name(Value::UInt(u64::MAX)).as_deref(), Some("uint64"));
        assert_eq!(name(Value::from("s")).as_deref(), Some("char*"));
        assert_eq!(name(Value::Null).as_deref(), Some("void*"));
        assert_eq!(name(Value::List(vec![])), None);
    }

    #[test]
    fn test_promotion() {
        let r = registry();
        let float = r.describe(Primitive::Float).unwrap();
        let short = r.describe(Primitive::Int16).unwrap();
        let int64 = r.describe(Primitive::Int64).unwrap();
        assert_eq!(promote_variadic(&r, &float).unwrap().name(), "double");
        assert_eq!(promote_variadic(&r, &short).unwrap().name(), "int32");
        assert_eq!(promote_variadic(&r, &int64).unwrap().name(), "int64");
    }

    #[test]
    fn test_decode_widened_return() {
        let ret = MemoryBlock::allocate(8).unwrap();
        let raw: ffi_arg = (-2i64) as ffi_arg;
        unsafe { (ret.as_ptr() as *mut ffi_arg).write(raw) };
        let int8 = registry().describe(Primitive::Int8).unwrap();
        assert_eq!(decode_return(&int8, &ret).unwrap(), Value::Int(-2));
    }

    #[test]
    fn test_decode_null_string() {
        let ret = MemoryBlock::allocate(8).unwrap();
        let cstr = registry().describe(Primitive::CString).unwrap();
        assert_eq!(decode_return(&cstr, &ret).unwrap(), Value::Null);
    }
}
