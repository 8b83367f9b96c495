//! Type registry - canonical descriptors for C types
//!
//! Defines:
//! - `TypeDescriptor`: immutable, cheaply clonable description of a C type
//! - `PlatformTable`: the frozen size table for platform-dependent integers
//! - `TypeRegistry`: primitive descriptors plus user-defined composites
//!
//! Primitive descriptors are built once per registry and handed out as
//! clones, so `describe` is idempotent. The host registry is a process-wide
//! singleton resolved on first use.
//!
//! # Examples
//!
//! ```
//! # use ctypes_engine::{Primitive, TypeRegistry};
//! let registry = TypeRegistry::host();
//! let int = registry.describe(Primitive::Int32).unwrap();
//! assert_eq!((int.size(), int.align()), (4, 4));
//! assert_eq!(registry.by_name("int").unwrap(), int);
//! ```

use crate::error::{FfiError, FfiResult};
use crate::layout::{compute_layout, CompositeKind, CompositeLayout, FieldSpec, Packing};
use ctypes_config::{DataModelName, EngineConfig};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

/// Descriptor of a C type
///
/// Equality is structural: two descriptors are equal when their kind, size
/// and alignment agree, so `long` and `int64` compare equal on LP64 hosts.
#[derive(Clone)]
pub struct TypeDescriptor(Arc<TypeDef>);

#[derive(Debug)]
struct TypeDef {
    name: String,
    kind: TypeKind,
    size: usize,
    align: usize,
}

/// Kind of a C type
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Void,
    /// C `_Bool` (one byte, 0 or 1)
    Bool,
    Int { bits: u32, signed: bool },
    Float { bits: u32 },
    Pointer(PointerTarget),
    Array { element: TypeDescriptor, count: usize },
    Struct(Arc<CompositeLayout>),
    Union(Arc<CompositeLayout>),
}

/// What a pointer type points at
#[derive(Debug, Clone, PartialEq)]
pub enum PointerTarget {
    /// `void*`
    Opaque,
    /// `POINTER(T)`
    Typed(TypeDescriptor),
    /// `char*`, marshaled from and to host strings
    CString,
    /// `wchar_t*`, marshaled from and to host strings
    WString { wchar_size: usize },
}

impl PointerTarget {
    /// Descriptor of a single pointee element
    pub fn pointee(&self) -> TypeDescriptor {
        match self {
            PointerTarget::Opaque => TypeDescriptor::void(),
            PointerTarget::Typed(t) => t.clone(),
            PointerTarget::CString => TypeDescriptor::integer("char", 1, true, 1),
            PointerTarget::WString { wchar_size } => TypeDescriptor::integer(
                "wchar_t",
                *wchar_size,
                *wchar_size == 4,
                *wchar_size,
            ),
        }
    }
}

impl TypeDescriptor {
    pub(crate) fn new(name: impl Into<String>, kind: TypeKind, size: usize, align: usize) -> Self {
        TypeDescriptor(Arc::new(TypeDef {
            name: name.into(),
            kind,
            size,
            align: align.max(1),
        }))
    }

    pub(crate) fn integer(name: &str, size: usize, signed: bool, align: usize) -> Self {
        Self::new(
            name,
            TypeKind::Int {
                bits: (size * 8) as u32,
                signed,
            },
            size,
            align,
        )
    }

    /// The `void` descriptor (size 0)
    pub fn void() -> Self {
        static VOID: OnceLock<TypeDescriptor> = OnceLock::new();
        VOID.get_or_init(|| TypeDescriptor::new("void", TypeKind::Void, 0, 1))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    /// `sizeof`
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// `alignof`
    pub fn align(&self) -> usize {
        self.0.align
    }

    pub fn is_void(&self) -> bool {
        matches!(self.0.kind, TypeKind::Void)
    }

    /// Integers and `_Bool`
    pub fn is_integral(&self) -> bool {
        matches!(self.0.kind, TypeKind::Int { .. } | TypeKind::Bool)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.0.kind, TypeKind::Int { signed: true, .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self.0.kind, TypeKind::Float { .. })
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.0.kind, TypeKind::Pointer(_))
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.0.kind, TypeKind::Struct(_) | TypeKind::Union(_))
    }

    /// Scalars are everything a single read produces a non-aggregate value for
    pub fn is_scalar(&self) -> bool {
        self.is_integral() || self.is_float() || self.is_pointer()
    }

    /// Computed layout of a struct or union
    pub fn layout(&self) -> Option<&CompositeLayout> {
        match &self.0.kind {
            TypeKind::Struct(l) | TypeKind::Union(l) => Some(l),
            _ => None,
        }
    }

    /// Element type and count of an array
    pub fn element(&self) -> Option<(&TypeDescriptor, usize)> {
        match &self.0.kind {
            TypeKind::Array { element, count } => Some((element, *count)),
            _ => None,
        }
    }

    /// Pointee of a pointer type
    pub fn pointee(&self) -> Option<TypeDescriptor> {
        match &self.0.kind {
            TypeKind::Pointer(target) => Some(target.pointee()),
            _ => None,
        }
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.size == other.0.size
                && self.0.align == other.0.align
                && self.0.kind == other.0.kind)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TypeDescriptor({}, size={}, align={})",
            self.0.name, self.0.size, self.0.align
        )
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Integer data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataModel {
    /// long and pointers are 64-bit
    Lp64,
    /// long is 32-bit, pointers 64-bit
    Llp64,
    /// int, long and pointers are 32-bit
    Ilp32,
}

/// Frozen table of platform-dependent sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformTable {
    pub data_model: DataModel,
    pub long_size: usize,
    pub pointer_size: usize,
    pub wchar_size: usize,
    pub wchar_signed: bool,
    /// Alignment of 64-bit integers inside structs
    pub int64_align: usize,
    /// Alignment of `double` inside structs
    pub double_align: usize,
}

impl PlatformTable {
    /// The table of the platform this process runs on
    pub fn host() -> Self {
        let pointer_size = mem::size_of::<usize>();
        let long_size = mem::size_of::<libc::c_long>();
        let data_model = match (long_size, pointer_size) {
            (8, 8) => DataModel::Lp64,
            (4, 8) => DataModel::Llp64,
            _ => DataModel::Ilp32,
        };

        Self {
            data_model,
            long_size,
            pointer_size,
            wchar_size: mem::size_of::<libc::wchar_t>(),
            wchar_signed: libc::wchar_t::MIN != 0,
            int64_align: mem::align_of::<u64>(),
            double_align: mem::align_of::<f64>(),
        }
    }

    /// A table for a named data model, using natural alignment throughout
    pub fn for_model(data_model: DataModel) -> Self {
        let (long_size, pointer_size, wchar_size) = match data_model {
            DataModel::Lp64 => (8, 8, 4),
            DataModel::Llp64 => (4, 8, 2),
            DataModel::Ilp32 => (4, 4, 4),
        };

        Self {
            data_model,
            long_size,
            pointer_size,
            wchar_size,
            wchar_signed: wchar_size == 4,
            int64_align: 8,
            double_align: 8,
        }
    }

    /// Resolve the table named by a configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut table = match config.data_model() {
            DataModelName::Native => Self::host(),
            DataModelName::Lp64 => Self::for_model(DataModel::Lp64),
            DataModelName::Llp64 => Self::for_model(DataModel::Llp64),
            DataModelName::Ilp32 => Self::for_model(DataModel::Ilp32),
        };

        if let Some(size) = config.wchar_size() {
            table.wchar_size = size;
            table.wchar_signed = size == 4;
        }

        // A named model that happens to describe this host keeps host alignment.
        let host = Self::host();
        if table.data_model == host.data_model
            && table.wchar_size == host.wchar_size
            && table.pointer_size == host.pointer_size
        {
            return host;
        }
        table
    }

    /// Whether descriptors built from this table match the running process
    pub fn is_host(&self) -> bool {
        *self == Self::host()
    }
}

/// Primitive C types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Int128,
    UInt128,
    Long,
    ULong,
    SizeT,
    SSizeT,
    Float,
    Double,
    WChar,
    /// `void*`
    Pointer,
    /// `char*`
    CString,
    /// `wchar_t*`
    WString,
}

impl Primitive {
    /// Every primitive the registry can represent
    pub const SUPPORTED: [Primitive; 20] = [
        Primitive::Void,
        Primitive::Bool,
        Primitive::Int8,
        Primitive::UInt8,
        Primitive::Int16,
        Primitive::UInt16,
        Primitive::Int32,
        Primitive::UInt32,
        Primitive::Int64,
        Primitive::UInt64,
        Primitive::Long,
        Primitive::ULong,
        Primitive::SizeT,
        Primitive::SSizeT,
        Primitive::Float,
        Primitive::Double,
        Primitive::WChar,
        Primitive::Pointer,
        Primitive::CString,
        Primitive::WString,
    ];

    pub fn canonical_name(self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "bool",
            Primitive::Int8 => "int8",
            Primitive::UInt8 => "uint8",
            Primitive::Int16 => "int16",
            Primitive::UInt16 => "uint16",
            Primitive::Int32 => "int32",
            Primitive::UInt32 => "uint32",
            Primitive::Int64 => "int64",
            Primitive::UInt64 => "uint64",
            Primitive::Int128 => "int128",
            Primitive::UInt128 => "uint128",
            Primitive::Long => "long",
            Primitive::ULong => "ulong",
            Primitive::SizeT => "size_t",
            Primitive::SSizeT => "ssize_t",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::WChar => "wchar_t",
            Primitive::Pointer => "void*",
            Primitive::CString => "char*",
            Primitive::WString => "wchar_t*",
        }
    }

    /// Resolve a type name or alias (whitespace-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        let primitive = match normalize(name).as_str() {
            "void" => Primitive::Void,
            "bool" | "_Bool" => Primitive::Bool,
            "int8" | "int8_t" | "char" | "signed char" => Primitive::Int8,
            "uint8" | "uint8_t" | "uchar" | "unsigned char" | "byte" => Primitive::UInt8,
            "int16" | "int16_t" | "short" => Primitive::Int16,
            "uint16" | "uint16_t" | "ushort" | "unsigned short" => Primitive::UInt16,
            "int32" | "int32_t" | "int" => Primitive::Int32,
            "uint32" | "uint32_t" | "uint" | "unsigned int" | "unsigned" => Primitive::UInt32,
            "int64" | "int64_t" | "long long" | "longlong" => Primitive::Int64,
            "uint64" | "uint64_t" | "unsigned long long" | "ulonglong" => Primitive::UInt64,
            "int128" | "int128_t" | "__int128" => Primitive::Int128,
            "uint128" | "uint128_t" | "unsigned __int128" => Primitive::UInt128,
            "long" | "c_long" => Primitive::Long,
            "ulong" | "unsigned long" | "c_ulong" => Primitive::ULong,
            "size_t" => Primitive::SizeT,
            "ssize_t" => Primitive::SSizeT,
            "float" => Primitive::Float,
            "double" => Primitive::Double,
            "wchar" | "wchar_t" => Primitive::WChar,
            "pointer" | "void*" | "ptr" => Primitive::Pointer,
            "string" | "char*" | "cstring" => Primitive::CString,
            "wstring" | "wchar_t*" => Primitive::WString,
            _ => return None,
        };
        Some(primitive)
    }
}

/// Collapse runs of whitespace and glue `*` to the preceding token
fn normalize(name: &str) -> String {
    let joined = name.split_whitespace().collect::<Vec<_>>().join(" ");
    joined.replace(" *", "*")
}

fn build_primitive(primitive: Primitive, table: &PlatformTable) -> Option<TypeDescriptor> {
    let name = primitive.canonical_name();
    let ptr = table.pointer_size;
    let descriptor = match primitive {
        Primitive::Void => TypeDescriptor::void(),
        Primitive::Bool => TypeDescriptor::new(name, TypeKind::Bool, 1, 1),
        Primitive::Int8 => TypeDescriptor::integer(name, 1, true, 1),
        Primitive::UInt8 => TypeDescriptor::integer(name, 1, false, 1),
        Primitive::Int16 => TypeDescriptor::integer(name, 2, true, 2),
        Primitive::UInt16 => TypeDescriptor::integer(name, 2, false, 2),
        Primitive::Int32 => TypeDescriptor::integer(name, 4, true, 4),
        Primitive::UInt32 => TypeDescriptor::integer(name, 4, false, 4),
        Primitive::Int64 => TypeDescriptor::integer(name, 8, true, table.int64_align),
        Primitive::UInt64 => TypeDescriptor::integer(name, 8, false, table.int64_align),
        Primitive::Int128 | Primitive::UInt128 => return None,
        Primitive::Long | Primitive::ULong => {
            let align = if table.long_size == 8 {
                table.int64_align
            } else {
                table.long_size
            };
            TypeDescriptor::integer(name, table.long_size, primitive == Primitive::Long, align)
        }
        Primitive::SizeT => TypeDescriptor::integer(name, ptr, false, ptr),
        Primitive::SSizeT => TypeDescriptor::integer(name, ptr, true, ptr),
        Primitive::Float => TypeDescriptor::new(name, TypeKind::Float { bits: 32 }, 4, 4),
        Primitive::Double => {
            TypeDescriptor::new(name, TypeKind::Float { bits: 64 }, 8, table.double_align)
        }
        Primitive::WChar => TypeDescriptor::integer(
            name,
            table.wchar_size,
            table.wchar_signed,
            table.wchar_size,
        ),
        Primitive::Pointer => {
            TypeDescriptor::new(name, TypeKind::Pointer(PointerTarget::Opaque), ptr, ptr)
        }
        Primitive::CString => {
            TypeDescriptor::new(name, TypeKind::Pointer(PointerTarget::CString), ptr, ptr)
        }
        Primitive::WString => TypeDescriptor::new(
            name,
            TypeKind::Pointer(PointerTarget::WString {
                wchar_size: table.wchar_size,
            }),
            ptr,
            ptr,
        ),
    };
    Some(descriptor)
}

/// Registry of C type descriptors
///
/// Cloning is cheap; clones share primitives and named composites.
#[derive(Clone)]
pub struct TypeRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    platform: PlatformTable,
    primitives: HashMap<Primitive, TypeDescriptor>,
    composites: RwLock<HashMap<String, TypeDescriptor>>,
}

impl TypeRegistry {
    /// The process-wide registry for the running platform
    pub fn host() -> TypeRegistry {
        static HOST: OnceLock<TypeRegistry> = OnceLock::new();
        HOST.get_or_init(|| TypeRegistry::with_platform(PlatformTable::host()))
            .clone()
    }

    /// A registry over an explicit platform table
    ///
    /// A table that does not describe the running process yields a
    /// layout-only registry: sizes and offsets are computed for the named
    /// model, but calls cannot be bound against it.
    pub fn with_platform(platform: PlatformTable) -> TypeRegistry {
        let primitives = Primitive::SUPPORTED
            .iter()
            .filter_map(|p| build_primitive(*p, &platform).map(|d| (*p, d)))
            .collect();

        debug!(data_model = ?platform.data_model, long_size = platform.long_size, "type registry initialized");

        TypeRegistry {
            inner: Arc::new(RegistryInner {
                platform,
                primitives,
                composites: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registry for a loaded configuration
    pub fn from_config(config: &EngineConfig) -> TypeRegistry {
        let table = PlatformTable::from_config(config);
        if table.is_host() {
            Self::host()
        } else {
            Self::with_platform(table)
        }
    }

    pub fn platform(&self) -> &PlatformTable {
        &self.inner.platform
    }

    /// Canonical descriptor of a primitive
    pub fn describe(&self, primitive: Primitive) -> FfiResult<TypeDescriptor> {
        self.inner
            .primitives
            .get(&primitive)
            .cloned()
            .ok_or_else(|| {
                FfiError::unsupported(
                    primitive.canonical_name(),
                    "128-bit integers are not representable on this ABI",
                )
            })
    }

    /// Resolve a type by name
    ///
    /// Accepts every primitive alias, `T*` and `POINTER(T)` pointer
    /// spellings, `T[N]` arrays and the names of composites defined
    /// through this registry.
    pub fn by_name(&self, name: &str) -> FfiResult<TypeDescriptor> {
        let normalized = normalize(name);
        if let Some(primitive) = Primitive::from_name(&normalized) {
            return self.describe(primitive);
        }

        if let Some(inner) = normalized
            .strip_prefix("POINTER(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let target = self.by_name(inner)?;
            return Ok(self.pointer_to(&target));
        }

        if let Some(base) = normalized.strip_suffix('*') {
            let target = self.by_name(base)?;
            return Ok(self.pointer_to(&target));
        }

        if let Some(open) = normalized.rfind('[') {
            if let Some(count) = normalized[open + 1..]
                .strip_suffix(']')
                .and_then(|c| c.trim().parse::<usize>().ok())
            {
                let element = self.by_name(&normalized[..open])?;
                return self.array(&element, count);
            }
        }

        let composites = self
            .inner
            .composites
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        composites
            .get(&normalized)
            .cloned()
            .ok_or_else(|| FfiError::unsupported(name, "unknown type name"))
    }

    /// `POINTER(target)`; a pointer to `void` is the opaque `void*`
    pub fn pointer_to(&self, target: &TypeDescriptor) -> TypeDescriptor {
        let ptr = self.inner.platform.pointer_size;
        if target.is_void() {
            return TypeDescriptor::new("void*", TypeKind::Pointer(PointerTarget::Opaque), ptr, ptr);
        }
        TypeDescriptor::new(
            format!("{}*", target.name()),
            TypeKind::Pointer(PointerTarget::Typed(target.clone())),
            ptr,
            ptr,
        )
    }

    /// `element[count]`
    pub fn array(&self, element: &TypeDescriptor, count: usize) -> FfiResult<TypeDescriptor> {
        if element.is_void() {
            return Err(FfiError::unsupported("void", "arrays of void are not allowed"));
        }
        let size = element.size().checked_mul(count).ok_or_else(|| {
            FfiError::unsupported(
                format!("{}[{}]", element.name(), count),
                "array size overflows the address space",
            )
        })?;
        Ok(TypeDescriptor::new(
            format!("{}[{}]", element.name(), count),
            TypeKind::Array {
                element: element.clone(),
                count,
            },
            size,
            element.align(),
        ))
    }

    /// Define a struct; its name becomes resolvable through `by_name`
    pub fn define_struct(
        &self,
        name: &str,
        fields: Vec<FieldSpec>,
        packing: Packing,
    ) -> FfiResult<TypeDescriptor> {
        self.define(name, CompositeKind::Struct, fields, packing)
    }

    /// Define a union; its name becomes resolvable through `by_name`
    pub fn define_union(
        &self,
        name: &str,
        fields: Vec<FieldSpec>,
        packing: Packing,
    ) -> FfiResult<TypeDescriptor> {
        self.define(name, CompositeKind::Union, fields, packing)
    }

    fn define(
        &self,
        name: &str,
        kind: CompositeKind,
        fields: Vec<FieldSpec>,
        packing: Packing,
    ) -> FfiResult<TypeDescriptor> {
        let layout = Arc::new(compute_layout(name, kind, &fields, packing)?);
        let (size, align) = (layout.size(), layout.align());
        let type_kind = match kind {
            CompositeKind::Struct => TypeKind::Struct(layout),
            CompositeKind::Union => TypeKind::Union(layout),
        };
        let descriptor = TypeDescriptor::new(name, type_kind, size, align);

        debug!(composite = name, size, align, "composite type defined");

        if !name.is_empty() {
            let mut composites = self
                .inner
                .composites
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            composites.insert(name.to_string(), descriptor.clone());
        }
        Ok(descriptor)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("platform", &self.inner.platform)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_is_idempotent() {
        let registry = TypeRegistry::host();
        let a = registry.describe(Primitive::Double).unwrap();
        let b = registry.describe(Primitive::Double).unwrap();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_host_registry_is_shared() {
        let a = TypeRegistry::host().describe(Primitive::Int32).unwrap();
        let b = TypeRegistry::host().describe(Primitive::Int32).unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_int128_unsupported() {
        let registry = TypeRegistry::host();
        assert!(matches!(
            registry.describe(Primitive::Int128),
            Err(FfiError::UnsupportedType { .. })
        ));
        assert!(matches!(
            registry.by_name("__int128"),
            Err(FfiError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_alias_resolution() {
        let registry = TypeRegistry::host();
        assert_eq!(
            registry.by_name("unsigned   short").unwrap(),
            registry.describe(Primitive::UInt16).unwrap()
        );
        assert_eq!(
            registry.by_name("char *").unwrap(),
            registry.describe(Primitive::CString).unwrap()
        );
        assert_eq!(Primitive::from_name("_Bool"), Some(Primitive::Bool));
        assert_eq!(Primitive::from_name("quadruple"), None);
    }

    #[test]
    fn test_pointer_spellings() {
        let registry = TypeRegistry::host();
        let a = registry.by_name("int*").unwrap();
        let b = registry.by_name("POINTER(int32)").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pointee().unwrap(), registry.describe(Primitive::Int32).unwrap());
        assert_eq!(a.size(), mem::size_of::<usize>());
    }

    #[test]
    fn test_array_by_name() {
        let registry = TypeRegistry::host();
        let arr = registry.by_name("uint16[5]").unwrap();
        assert_eq!(arr.size(), 10);
        assert_eq!(arr.align(), 2);
        assert_eq!(arr.name(), "uint16[5]");
    }

    #[test]
    fn test_llp64_table() {
        let registry = TypeRegistry::with_platform(PlatformTable::for_model(DataModel::Llp64));
        assert_eq!(registry.describe(Primitive::Long).unwrap().size(), 4);
        assert_eq!(registry.describe(Primitive::WChar).unwrap().size(), 2);
        assert_eq!(registry.describe(Primitive::Pointer).unwrap().size(), 8);
    }

    #[test]
    fn test_ilp32_table() {
        let registry = TypeRegistry::with_platform(PlatformTable::for_model(DataModel::Ilp32));
        assert_eq!(registry.describe(Primitive::SizeT).unwrap().size(), 4);
        assert_eq!(registry.describe(Primitive::Long).unwrap().size(), 4);
        assert_eq!(registry.describe(Primitive::Int64).unwrap().size(), 8);
    }

    #[test]
    fn test_host_long_matches_libc() {
        let registry = TypeRegistry::host();
        let long = registry.describe(Primitive::Long).unwrap();
        assert_eq!(long.size(), mem::size_of::<libc::c_long>());
        assert_eq!(long.align(), mem::align_of::<libc::c_long>());
        assert!(registry.platform().is_host());
    }
}
