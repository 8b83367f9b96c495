//! Native call dispatch over libffi
//!
//! A `CallableBinding` pairs a resolved entry point with a `Signature`.
//! Fixed-arity bindings prepare their call interface once; variadic bindings
//! prepare one per call from the runtime types of the trailing arguments,
//! after C default argument promotion.

use crate::errcheck::{ErrCheckFn, ErrCheckSlot, HookState};
use crate::error::{BoxError, FfiError, FfiResult};
use crate::layout::{has_irregular_members, CompositeLayout};
use crate::loader::Symbol;
use crate::marshal::{decode_return, infer_variadic_type, promote_variadic, MarshalContext};
use crate::memory::MemoryBlock;
use crate::pointer::TypedPointer;
use crate::types::{TypeDescriptor, TypeKind, TypeRegistry};
use crate::value::Value;
use ctypes_config::{ConventionName, FunctionDecl};
use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Calling convention of a native function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallConvention {
    /// The platform's C convention (cdecl on x86)
    #[default]
    #[serde(alias = "cdecl")]
    Default,
    /// Win32 `__stdcall`
    Stdcall,
}

impl CallConvention {
    /// libffi ABI for this convention on the running platform
    pub(crate) fn abi(self, function: &str) -> FfiResult<raw::ffi_abi> {
        match self {
            CallConvention::Default => Ok(raw::ffi_abi_FFI_DEFAULT_ABI),
            CallConvention::Stdcall => stdcall_abi().ok_or_else(|| FfiError::UnsupportedConvention {
                function: function.to_string(),
                convention: self.to_string(),
                reason: "stdcall is only available on Windows".to_string(),
            }),
        }
    }
}

#[cfg(all(windows, target_arch = "x86"))]
fn stdcall_abi() -> Option<raw::ffi_abi> {
    Some(raw::ffi_abi_FFI_STDCALL)
}

// 64-bit Windows has a single convention; stdcall declarations map onto it
#[cfg(all(windows, not(target_arch = "x86")))]
fn stdcall_abi() -> Option<raw::ffi_abi> {
    Some(raw::ffi_abi_FFI_DEFAULT_ABI)
}

#[cfg(not(windows))]
fn stdcall_abi() -> Option<raw::ffi_abi> {
    None
}

impl fmt::Display for CallConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallConvention::Default => write!(f, "default"),
            CallConvention::Stdcall => write!(f, "stdcall"),
        }
    }
}

impl FromStr for CallConvention {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "cdecl" => Ok(CallConvention::Default),
            "stdcall" => Ok(CallConvention::Stdcall),
            other => Err(FfiError::UnsupportedConvention {
                function: "<declaration>".to_string(),
                convention: other.to_string(),
                reason: "expected \"default\" or \"stdcall\"".to_string(),
            }),
        }
    }
}

impl From<ConventionName> for CallConvention {
    fn from(name: ConventionName) -> Self {
        match name {
            ConventionName::Default => CallConvention::Default,
            ConventionName::Stdcall => CallConvention::Stdcall,
        }
    }
}

/// Resolved signature of a native function
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Fixed argument types
    pub args: Vec<TypeDescriptor>,
    pub returns: TypeDescriptor,
    pub convention: CallConvention,
    /// Accepts trailing arguments beyond `args`
    pub variadic: bool,
}

impl Signature {
    pub fn new(args: Vec<TypeDescriptor>, returns: TypeDescriptor) -> Self {
        Self {
            args,
            returns,
            convention: CallConvention::Default,
            variadic: false,
        }
    }

    pub fn with_convention(mut self, convention: CallConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_variadic(mut self, variadic: bool) -> Self {
        self.variadic = variadic;
        self
    }
}

fn void_name() -> String {
    "void".to_string()
}

/// Signature declaration by type name
///
/// JSON form: `{"argTypes": [...], "returnType": "...", "convention":
/// "default" | "stdcall", "variadic": bool}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureSpec {
    #[serde(rename = "argTypes", alias = "args", default)]
    pub arg_types: Vec<String>,
    #[serde(rename = "returnType", alias = "returns", default = "void_name")]
    pub return_type: String,
    #[serde(default)]
    pub convention: CallConvention,
    #[serde(default)]
    pub variadic: bool,
}

impl SignatureSpec {
    pub fn from_json(json: &str) -> FfiResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| FfiError::unsupported("signature", format!("invalid declaration: {}", e)))
    }

    pub fn from_decl(decl: &FunctionDecl) -> Self {
        Self {
            arg_types: decl.args.clone(),
            return_type: decl.return_type().to_string(),
            convention: decl.convention.into(),
            variadic: decl.variadic,
        }
    }

    /// Resolve every type name through `registry`
    pub fn resolve(&self, registry: &TypeRegistry) -> FfiResult<Signature> {
        let args = self
            .arg_types
            .iter()
            .map(|name| registry.by_name(name))
            .collect::<FfiResult<Vec<_>>>()?;
        let returns = registry.by_name(&self.return_type)?;
        Ok(Signature {
            args,
            returns,
            convention: self.convention,
            variadic: self.variadic,
        })
    }
}

/// A native entry point bound to a signature
pub struct CallableBinding {
    name: String,
    library: Option<String>,
    address: usize,
    signature: Signature,
    /// Prepared once for fixed-arity bindings
    cif: Option<Box<Cif>>,
    registry: TypeRegistry,
    errcheck: ErrCheckSlot,
    foreign_reads: bool,
    _library: Option<Arc<libloading::Library>>,
}

// Safety: the binding holds a code address and a prepared call interface that
// ffi_call only reads. Mutation (errcheck attach/detach) needs `&mut self`.
unsafe impl Send for CallableBinding {}
unsafe impl Sync for CallableBinding {}

/// Bind a resolved symbol to a signature
///
/// # Safety
///
/// The caller must ensure the native function's actual signature and
/// calling convention match `signature`.
pub unsafe fn bind(symbol: &Symbol, signature: Signature) -> FfiResult<CallableBinding> {
    CallableBinding::prepare(
        symbol.name().to_string(),
        Some(symbol.library().to_string()),
        symbol.address(),
        signature,
        Some(symbol.handle()),
    )
}

impl CallableBinding {
    /// Bind a raw code address (for example an `extern "C"` function)
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `address` is the entry point of a function with this signature
    /// - the code stays mapped for the lifetime of the binding
    pub unsafe fn from_address(
        name: impl Into<String>,
        address: usize,
        signature: Signature,
    ) -> FfiResult<Self> {
        Self::prepare(name.into(), None, address, signature, None)
    }

    fn prepare(
        name: String,
        library: Option<String>,
        address: usize,
        signature: Signature,
        handle: Option<Arc<libloading::Library>>,
    ) -> FfiResult<Self> {
        if address == 0 {
            return Err(FfiError::SymbolNotFound {
                library: library.unwrap_or_else(|| "<address>".to_string()),
                symbol: name,
            });
        }
        if signature.returns.element().is_some() {
            return Err(FfiError::unsupported(
                signature.returns.name(),
                "C functions cannot return arrays",
            ));
        }

        let fixed = signature.variadic.then_some(signature.args.len());
        let cif = build_cif(
            &name,
            &signature.args,
            &signature.returns,
            signature.convention,
            fixed,
        )?;

        debug!(
            function = %name,
            library = library.as_deref().unwrap_or("<address>"),
            args = signature.args.len(),
            variadic = signature.variadic,
            convention = %signature.convention,
            "binding created"
        );

        Ok(Self {
            name,
            library,
            address,
            cif: (!signature.variadic).then(|| Box::new(cif)),
            signature,
            registry: TypeRegistry::host(),
            errcheck: ErrCheckSlot::new(),
            foreign_reads: false,
            _library: handle,
        })
    }

    /// Call the native function
    ///
    /// Marshals `args`, performs the call, decodes the return value and runs
    /// the attached errcheck hook, if any.
    pub fn invoke(&self, args: &[Value]) -> FfiResult<Value> {
        let result = self.call_native(args)?;
        self.errcheck.apply(result, self, args)
    }

    fn call_native(&self, args: &[Value]) -> FfiResult<Value> {
        let fixed = self.signature.args.len();
        if args.len() < fixed {
            return Err(FfiError::ArgumentType {
                function: self.name.clone(),
                position: args.len() + 1,
                expected: self.signature.args[args.len()].name().to_string(),
                found: "missing argument".to_string(),
            });
        }
        if args.len() > fixed && !self.signature.variadic {
            return Err(FfiError::ArgumentType {
                function: self.name.clone(),
                position: fixed + 1,
                expected: format!("at most {} arguments", fixed),
                found: args[fixed].type_name().to_string(),
            });
        }

        trace!(function = %self.name, args = args.len(), "dispatch");

        let mut ctx = MarshalContext::new();
        for (i, (arg, ty)) in args.iter().zip(&self.signature.args).enumerate() {
            ctx.push(&self.name, i + 1, ty, arg)?;
        }

        let variadic_cif;
        let cif = match &self.cif {
            Some(cif) => cif.as_ref(),
            None => {
                let mut types = self.signature.args.clone();
                for (i, arg) in args.iter().enumerate().skip(fixed) {
                    let inferred = infer_variadic_type(&self.registry, arg).ok_or_else(|| {
                        FfiError::ArgumentType {
                            function: self.name.clone(),
                            position: i + 1,
                            expected: "a number, string or pointer".to_string(),
                            found: arg.type_name().to_string(),
                        }
                    })?;
                    let promoted = promote_variadic(&self.registry, &inferred)?;
                    ctx.push(&self.name, i + 1, &promoted, arg)?;
                    types.push(promoted);
                }
                trace!(
                    function = %self.name,
                    promoted = ?types[fixed..].iter().map(|t| t.name()).collect::<Vec<_>>(),
                    "variadic cif prepared"
                );
                variadic_cif = build_cif(
                    &self.name,
                    &types,
                    &self.signature.returns,
                    self.signature.convention,
                    Some(fixed),
                )?;
                &variadic_cif
            }
        };

        let ret = MemoryBlock::allocate(
            self.signature
                .returns
                .size()
                .max(mem::size_of::<raw::ffi_arg>())
                .max(mem::size_of::<u64>()),
        )?;
        let mut frame = ctx.frame();
        let code = CodePtr(self.address as *mut c_void);

        // Safety: the binding's creator vouched for the signature; every
        // frame slot is sized for its declared type and outlives the call.
        unsafe {
            raw::ffi_call(
                cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                ret.as_ptr() as *mut c_void,
                frame.as_mut_ptr(),
            );
        }

        let value = decode_return(&self.signature.returns, &ret)?;
        Ok(self.grant(value))
    }

    fn grant(&self, value: Value) -> Value {
        match value {
            Value::Pointer(p) if self.foreign_reads && p.is_foreign() => {
                // Safety: allow_foreign_reads transferred this obligation to the caller
                Value::Pointer(unsafe { p.grant_foreign_access() })
            }
            other => other,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Library the symbol came from; `None` for raw addresses
    pub fn library(&self) -> Option<&str> {
        self.library.as_deref()
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_variadic(&self) -> bool {
        self.signature.variadic
    }

    /// The binding's address as a `void*` value
    pub fn as_pointer(&self) -> TypedPointer {
        TypedPointer::wrap_foreign_pointer(self.address, &TypeDescriptor::void())
    }

    /// Attach a hook, replacing any previous one
    pub fn attach_errcheck<F>(&mut self, hook: F)
    where
        F: Fn(Value, &CallableBinding, &[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.errcheck.attach(Arc::new(hook));
    }

    /// Attach a shared hook (see [`crate::errcheck::chain`])
    pub fn attach_errcheck_fn(&mut self, hook: ErrCheckFn) {
        self.errcheck.attach(hook);
    }

    pub fn detach_errcheck(&mut self) -> Option<ErrCheckFn> {
        self.errcheck.detach()
    }

    pub fn errcheck_state(&self) -> HookState {
        self.errcheck.state()
    }

    pub fn errcheck(&self) -> Option<ErrCheckFn> {
        self.errcheck.current()
    }

    /// Grant foreign access to every pointer this binding returns
    ///
    /// # Safety
    ///
    /// The caller must ensure every non-null pointer returned by the native
    /// function refers to memory valid for its declared target type.
    pub unsafe fn allow_foreign_reads(&mut self) {
        self.foreign_reads = true;
    }
}

impl fmt::Debug for CallableBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableBinding")
            .field("name", &self.name)
            .field("library", &self.library)
            .field("address", &format_args!("{:#x}", self.address))
            .field("signature", &self.signature)
            .field("errcheck", &self.errcheck)
            .finish()
    }
}

/// Prepare a call interface; `fixed` is the fixed-argument count of a variadic call
pub(crate) fn build_cif(
    function: &str,
    args: &[TypeDescriptor],
    returns: &TypeDescriptor,
    convention: CallConvention,
    fixed: Option<usize>,
) -> FfiResult<Cif> {
    let arg_types = args
        .iter()
        .enumerate()
        .map(|(i, ty)| ffi_type(ty).map_err(|e| e.at_argument(function, i + 1)))
        .collect::<FfiResult<Vec<_>>>()?;
    let ret_type = if returns.is_void() {
        Type::void()
    } else {
        ffi_type(returns)?
    };
    let abi = convention.abi(function)?;

    let cif = Cif::new(arg_types, ret_type);
    if fixed.is_none() && abi == raw::ffi_abi_FFI_DEFAULT_ABI {
        return Ok(cif);
    }

    // Re-prepare in place for a variadic frame or a non-default ABI
    let raw_cif = cif.as_raw_ptr();
    let status = unsafe {
        let nargs = (*raw_cif).nargs;
        match fixed {
            Some(nfixed) => raw::ffi_prep_cif_var(
                raw_cif,
                abi,
                nfixed as u32,
                nargs,
                (*raw_cif).rtype,
                (*raw_cif).arg_types,
            ),
            None => raw::ffi_prep_cif(raw_cif, abi, nargs, (*raw_cif).rtype, (*raw_cif).arg_types),
        }
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(FfiError::UnsupportedConvention {
            function: function.to_string(),
            convention: convention.to_string(),
            reason: format!("libffi rejected the call interface (status {})", status),
        });
    }
    Ok(cif)
}

/// libffi type for a value passed by value
pub(crate) fn ffi_type(ty: &TypeDescriptor) -> FfiResult<Type> {
    Ok(match ty.kind() {
        TypeKind::Void => {
            return Err(FfiError::unsupported("void", "void is only valid as a return type"))
        }
        TypeKind::Bool => Type::u8(),
        TypeKind::Int { bits: 8, signed: true } => Type::i8(),
        TypeKind::Int { bits: 8, signed: false } => Type::u8(),
        TypeKind::Int { bits: 16, signed: true } => Type::i16(),
        TypeKind::Int { bits: 16, signed: false } => Type::u16(),
        TypeKind::Int { bits: 32, signed: true } => Type::i32(),
        TypeKind::Int { bits: 32, signed: false } => Type::u32(),
        TypeKind::Int { bits: 64, signed: true } => Type::i64(),
        TypeKind::Int { bits: 64, signed: false } => Type::u64(),
        TypeKind::Int { .. } => {
            return Err(FfiError::unsupported(ty.name(), "no libffi type of this width"))
        }
        TypeKind::Float { bits: 32 } => Type::f32(),
        TypeKind::Float { .. } => Type::f64(),
        // Arrays decay to pointers in parameter position
        TypeKind::Pointer(_) | TypeKind::Array { .. } => Type::pointer(),
        TypeKind::Struct(layout) => {
            if has_irregular_members(layout) {
                return Err(FfiError::unsupported(
                    ty.name(),
                    "packed structs and structs containing unions cannot be passed by value",
                ));
            }
            if layout.size() == 0 {
                return Err(FfiError::unsupported(ty.name(), "empty structs cannot be passed by value"));
            }
            Type::structure(struct_elements(layout)?)
        }
        TypeKind::Union(_) => {
            return Err(FfiError::unsupported(ty.name(), "unions cannot be passed by value"))
        }
    })
}

/// Element list of a by-value struct: bit-field runs collapse to their
/// storage unit and arrays expand element by element
fn struct_elements(layout: &CompositeLayout) -> FfiResult<Vec<Type>> {
    let mut elements = Vec::new();
    let mut last_unit = None;
    for field in layout.fields() {
        if field.bit_width.is_some() {
            if last_unit == Some(field.offset) {
                continue;
            }
            last_unit = Some(field.offset);
        } else {
            last_unit = None;
        }
        push_flattened(&field.ty, &mut elements)?;
    }
    Ok(elements)
}

fn push_flattened(ty: &TypeDescriptor, elements: &mut Vec<Type>) -> FfiResult<()> {
    match ty.kind() {
        TypeKind::Array { element, count } => {
            for _ in 0..*count {
                push_flattened(element, elements)?;
            }
            Ok(())
        }
        _ => {
            elements.push(ffi_type(ty)?);
            Ok(())
        }
    }
}
