//! Memory blocks and bounds-checked typed views
//!
//! A `MemoryBlock` is a fixed-length byte buffer, either owned by the engine
//! (zero-initialized, freed with its last handle) or wrapping native memory
//! the engine does not own. A `MemoryView` is a borrowed window over a
//! block; every read and write is checked against the window.
//!
//! # Safety
//!
//! Blocks perform no locking. Concurrent unsynchronized writes to the same
//! block from several threads behave like they would on native memory and
//! are the caller's responsibility.

use crate::error::{FfiError, FfiResult};
use crate::instance::CData;
use crate::layout::{BitSlot, Member};
use crate::pointer::TypedPointer;
use crate::strings::{decode_wide, encode_wide};
use crate::types::{PointerTarget, TypeDescriptor, TypeKind};
use crate::value::Value;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Alignment of engine-owned blocks; covers every scalar and SIMD-free struct
const BLOCK_ALIGN: usize = 16;

/// Host-owned memory whose address was stored into a block
pub enum Retained {
    Block(MemoryBlock),
    CString(CString),
}

/// A fixed-length byte buffer
#[derive(Clone)]
pub struct MemoryBlock {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    ptr: NonNull<u8>,
    len: usize,
    /// Allocation layout; `None` for wrapped native memory
    layout: Option<Layout>,
    /// Keep-alives keyed by the byte offset whose stored address needs them
    retained: Mutex<BTreeMap<usize, Retained>>,
}

// Safety: a block is plain bytes behind a raw pointer. Synchronizing access to
// those bytes is the caller's job, exactly as for native memory.
unsafe impl Send for BlockInner {}
unsafe impl Sync for BlockInner {}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl MemoryBlock {
    /// Allocate a zero-initialized block of `len` bytes
    pub fn allocate(len: usize) -> FfiResult<Self> {
        let layout = Layout::from_size_align(len.max(1), BLOCK_ALIGN).map_err(|_| {
            FfiError::OutOfBounds {
                operation: "allocate_block",
                offset: 0,
                len,
                size: isize::MAX as usize,
            }
        })?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Ok(Self::from_parts(ptr, len, Some(layout)))
    }

    /// Wrap `len` bytes of native memory at `address` without owning them
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `address..address + len` is valid for reads and writes
    /// - the memory outlives every handle to the returned block
    pub unsafe fn wrap_native(address: usize, len: usize) -> FfiResult<Self> {
        let ptr = NonNull::new(address as *mut u8).ok_or_else(|| FfiError::NullDereference {
            operation: "wrap_native",
            target: format!("{} bytes", len),
        })?;
        Ok(Self::from_parts(ptr, len, None))
    }

    fn from_parts(ptr: NonNull<u8>, len: usize, layout: Option<Layout>) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                ptr,
                len,
                layout,
                retained: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Numeric address of the first byte
    pub fn address(&self) -> usize {
        self.inner.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr.as_ptr()
    }

    /// Whether the block wraps memory the engine does not own
    pub fn is_native(&self) -> bool {
        self.inner.layout.is_none()
    }

    /// Whether two handles refer to the same block
    pub fn same(a: &MemoryBlock, b: &MemoryBlock) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn contains(&self, address: usize) -> bool {
        address.wrapping_sub(self.address()) < self.len()
    }

    /// A view over the whole block
    pub fn view(&self) -> MemoryView<'_> {
        MemoryView {
            block: self,
            start: 0,
            len: self.len(),
        }
    }

    /// A view over `len` bytes starting at `offset`
    pub fn view_range(&self, offset: usize, len: usize) -> FfiResult<MemoryView<'_>> {
        self.view().locate("view", offset, len)?;
        Ok(MemoryView {
            block: self,
            start: offset,
            len,
        })
    }

    /// Keep host-owned memory alive while `offset..offset + len` refers to it
    ///
    /// Whatever was kept for that range before is dropped, so overwriting a
    /// pointer slot releases the previous target. `None` only clears.
    pub fn retain_at(&self, offset: usize, len: usize, item: Option<Retained>) {
        let end = offset.saturating_add(len);
        let mut retained = self.retained();
        let stale: Vec<usize> = retained.range(offset..end).map(|(key, _)| *key).collect();
        for key in stale {
            retained.remove(&key);
        }
        match item {
            Some(Retained::Block(other)) if MemoryBlock::same(self, &other) => {}
            Some(item) => {
                retained.insert(offset, item);
            }
            None => {}
        }
    }

    /// Number of objects kept alive by this block
    pub fn retained_count(&self) -> usize {
        self.retained().len()
    }

    fn retained(&self) -> MutexGuard<'_, BTreeMap<usize, Retained>> {
        self.inner
            .retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand retained objects over to native code for good
    pub(crate) fn leak_retained(&self) {
        let items = std::mem::take(&mut *self.retained());
        std::mem::forget(items);
    }

    /// Find the block backing `address`: this block or one it retains
    pub(crate) fn resolve(&self, address: usize) -> Option<(MemoryBlock, usize)> {
        if self.contains(address) {
            return Some((self.clone(), address - self.address()));
        }
        self.retained().values().find_map(|item| match item {
            Retained::Block(block) if block.contains(address) => {
                Some((block.clone(), address - block.address()))
            }
            _ => None,
        })
    }

    fn retained_cstring(&self, address: usize) -> Option<String> {
        self.retained().values().find_map(|item| match item {
            Retained::CString(s) if s.as_ptr() as usize == address => {
                Some(s.to_string_lossy().into_owned())
            }
            _ => None,
        })
    }

    fn retained_wide(&self, address: usize, wchar_size: usize) -> Option<String> {
        self.retained().values().find_map(|item| match item {
            Retained::Block(block) if block.address() == address => {
                block.view().read_bytes(0, block.len()).ok().map(|bytes| decode_wide(&bytes, wchar_size))
            }
            _ => None,
        })
    }

    /// Host value of a pointer stored in this block
    pub(crate) fn pointer_value(&self, target: &PointerTarget, address: usize) -> Value {
        match target {
            PointerTarget::CString | PointerTarget::WString { .. } if address == 0 => Value::Null,
            PointerTarget::CString => match self.retained_cstring(address) {
                Some(s) => Value::Str(s),
                None => Value::Pointer(TypedPointer::foreign(&target.pointee(), address)),
            },
            PointerTarget::WString { wchar_size } => match self.retained_wide(address, *wchar_size) {
                Some(s) => Value::Str(s),
                None => Value::Pointer(TypedPointer::foreign(&target.pointee(), address)),
            },
            _ => match self.resolve(address) {
                Some((block, offset)) => {
                    Value::Pointer(TypedPointer::from_block(&target.pointee(), &block, offset))
                }
                None => Value::Pointer(TypedPointer::foreign(&target.pointee(), address)),
            },
        }
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len())
            .field("native", &self.is_native())
            .finish()
    }
}

/// A bounds-checked window over a memory block
#[derive(Clone, Copy)]
pub struct MemoryView<'a> {
    block: &'a MemoryBlock,
    start: usize,
    len: usize,
}

impl<'a> MemoryView<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block(&self) -> &'a MemoryBlock {
        self.block
    }

    fn locate(&self, operation: &'static str, offset: usize, len: usize) -> FfiResult<*mut u8> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => {
                Ok(unsafe { self.block.as_ptr().add(self.start + offset) })
            }
            _ => Err(FfiError::OutOfBounds {
                operation,
                offset: offset as isize,
                len,
                size: self.len,
            }),
        }
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> FfiResult<Vec<u8>> {
        let p = self.locate("read", offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(p, len) }.to_vec())
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> FfiResult<()> {
        let p = self.locate("write", offset, bytes.len())?;
        unsafe { ptr::copy(bytes.as_ptr(), p, bytes.len()) };
        Ok(())
    }

    /// Zero `len` bytes at `offset`
    pub fn zero(&self, offset: usize, len: usize) -> FfiResult<()> {
        let p = self.locate("write", offset, len)?;
        unsafe { ptr::write_bytes(p, 0, len) };
        Ok(())
    }

    /// Read a value of type `ty` at `offset`
    pub fn read(&self, ty: &TypeDescriptor, offset: usize) -> FfiResult<Value> {
        match ty.kind() {
            TypeKind::Void => Err(FfiError::unsupported("void", "void has no value")),
            TypeKind::Bool => {
                let p = self.locate("read", offset, 1)?;
                Ok(Value::Bool(unsafe { p.read() } != 0))
            }
            TypeKind::Int { signed, .. } => {
                let p = self.locate("read", offset, ty.size())?;
                let bits = unsafe { load_bits(p, ty.size()) };
                Ok(int_value(bits, ty.size() * 8, *signed))
            }
            TypeKind::Float { bits: 32 } => {
                let p = self.locate("read", offset, 4)?;
                Ok(Value::Float(f32::from_bits(unsafe { load_bits(p, 4) } as u32)))
            }
            TypeKind::Float { .. } => {
                let p = self.locate("read", offset, 8)?;
                Ok(Value::Double(f64::from_bits(unsafe { load_bits(p, 8) })))
            }
            TypeKind::Pointer(target) => {
                let p = self.locate("read", offset, ty.size())?;
                let address = unsafe { load_bits(p, ty.size()) } as usize;
                Ok(self.block.pointer_value(target, address))
            }
            TypeKind::Array { element, count } => {
                self.locate("read", offset, ty.size())?;
                (0..*count)
                    .map(|i| self.read(element, offset + i * element.size()))
                    .collect::<FfiResult<Vec<_>>>()
                    .map(Value::List)
            }
            TypeKind::Struct(layout) | TypeKind::Union(layout) => {
                self.locate("read", offset, ty.size())?;
                let mut record = BTreeMap::new();
                for member in layout.members() {
                    record.insert(member.name.clone(), self.read_member(member, offset)?);
                }
                Ok(Value::Record(record))
            }
        }
    }

    /// Write `value` as type `ty` at `offset`
    pub fn write(&self, ty: &TypeDescriptor, offset: usize, value: &Value) -> FfiResult<()> {
        if let Value::CData(source) = value {
            if source.type_descriptor() == ty {
                return self.copy_instance(offset, source);
            }
            if source.type_descriptor().is_pointer() && ty.is_pointer() {
                return self.copy_pointer(ty, offset, source);
            }
            if source.type_descriptor().is_scalar() && ty.is_scalar() && !ty.is_pointer() {
                return self.write(ty, offset, &source.value()?);
            }
        }

        match ty.kind() {
            TypeKind::Void => Err(FfiError::mismatch("write", "void", value.type_name())),
            TypeKind::Bool => {
                let bits = integer_bits(ty, value)?;
                let p = self.locate("write", offset, 1)?;
                unsafe { p.write((bits != 0) as u8) };
                Ok(())
            }
            TypeKind::Int { .. } => {
                let bits = integer_bits(ty, value)?;
                let p = self.locate("write", offset, ty.size())?;
                unsafe { store_bits(p, ty.size(), bits) };
                Ok(())
            }
            TypeKind::Float { bits: 32 } => {
                let x = float_value(ty, value)? as f32;
                let p = self.locate("write", offset, 4)?;
                unsafe { store_bits(p, 4, x.to_bits() as u64) };
                Ok(())
            }
            TypeKind::Float { .. } => {
                let x = float_value(ty, value)?;
                let p = self.locate("write", offset, 8)?;
                unsafe { store_bits(p, 8, x.to_bits()) };
                Ok(())
            }
            TypeKind::Pointer(target) => {
                let p = self.locate("write", offset, ty.size())?;
                let (address, keep) = self.pointer_bits(ty, target, value)?;
                unsafe { store_bits(p, ty.size(), address as u64) };
                self.block.retain_at(self.start + offset, ty.size(), keep);
                Ok(())
            }
            TypeKind::Array { element, count } => self.write_array(ty, element, *count, offset, value),
            TypeKind::Struct(layout) | TypeKind::Union(layout) => {
                self.locate("write", offset, ty.size())?;
                match value {
                    Value::Record(entries) => {
                        for (name, item) in entries {
                            let member = layout.member(name).ok_or_else(|| FfiError::InvalidField {
                                composite: layout.name().to_string(),
                                field: name.clone(),
                                reason: "no such member".to_string(),
                            })?;
                            self.write_member(member, offset, item)?;
                        }
                        Ok(())
                    }
                    Value::List(items) if items.len() <= layout.members().len() => {
                        for (member, item) in layout.members().iter().zip(items) {
                            self.write_member(member, offset, item)?;
                        }
                        Ok(())
                    }
                    _ => Err(FfiError::mismatch("write", ty.name(), value.type_name())),
                }
            }
        }
    }

    fn write_array(
        &self,
        ty: &TypeDescriptor,
        element: &TypeDescriptor,
        count: usize,
        offset: usize,
        value: &Value,
    ) -> FfiResult<()> {
        self.locate("write", offset, ty.size())?;
        match value {
            Value::List(items) if items.len() <= count => {
                for (i, item) in items.iter().enumerate() {
                    self.write(element, offset + i * element.size(), item)?;
                }
                Ok(())
            }
            Value::Str(s) if element.size() == 1 && element.is_integral() && s.len() <= count => {
                self.write_bytes(offset, s.as_bytes())?;
                if s.len() < count {
                    self.zero(offset + s.len(), 1)?;
                }
                Ok(())
            }
            Value::List(items) => Err(FfiError::mismatch(
                "write",
                ty.name(),
                format!("list of {} items", items.len()),
            )),
            Value::Str(s) => Err(FfiError::mismatch(
                "write",
                ty.name(),
                format!("string of {} bytes", s.len()),
            )),
            _ => Err(FfiError::mismatch("write", ty.name(), value.type_name())),
        }
    }

    fn copy_instance(&self, offset: usize, source: &CData) -> FfiResult<()> {
        let bytes = source.bytes()?;
        self.write_bytes(offset, &bytes)?;
        let keep = contains_pointers(source.type_descriptor()).then(|| Retained::Block(source.block().clone()));
        self.block.retain_at(self.start + offset, bytes.len(), keep);
        Ok(())
    }

    /// Store the address held by a pointer instance of another pointer type
    fn copy_pointer(&self, ty: &TypeDescriptor, offset: usize, source: &CData) -> FfiResult<()> {
        let bytes = source.bytes()?;
        let address = unsafe { load_bits(bytes.as_ptr(), bytes.len()) };
        let p = self.locate("write", offset, ty.size())?;
        unsafe { store_bits(p, ty.size(), address) };
        let keep = (address != 0).then(|| Retained::Block(source.block().clone()));
        self.block.retain_at(self.start + offset, ty.size(), keep);
        Ok(())
    }

    /// Address to store for a pointer-typed write and what must stay alive for it
    fn pointer_bits(
        &self,
        ty: &TypeDescriptor,
        target: &PointerTarget,
        value: &Value,
    ) -> FfiResult<(usize, Option<Retained>)> {
        match value {
            Value::Null => Ok((0, None)),
            Value::Int(i) => usize::try_from(*i)
                .map(|address| (address, None))
                .map_err(|_| FfiError::mismatch("write", ty.name(), "negative address")),
            Value::UInt(u) => usize::try_from(*u)
                .map(|address| (address, None))
                .map_err(|_| FfiError::mismatch("write", ty.name(), "oversized address")),
            Value::Pointer(p) => Ok((p.address(), p.block().map(|block| Retained::Block(block.clone())))),
            Value::CData(instance) => Ok((
                instance.address(),
                Some(Retained::Block(instance.block().clone())),
            )),
            Value::Str(s) => match target {
                PointerTarget::CString | PointerTarget::Opaque => {
                    let c_string = CString::new(s.as_str())
                        .map_err(|e| FfiError::InvalidString(format!("string contains a NUL byte: {}", e)))?;
                    let address = c_string.as_ptr() as usize;
                    Ok((address, Some(Retained::CString(c_string))))
                }
                PointerTarget::WString { wchar_size } => {
                    let bytes = encode_wide(s, *wchar_size);
                    let storage = MemoryBlock::allocate(bytes.len())?;
                    storage.view().write_bytes(0, &bytes)?;
                    Ok((storage.address(), Some(Retained::Block(storage))))
                }
                PointerTarget::Typed(_) => Err(FfiError::mismatch("write", ty.name(), "string")),
            },
            _ => Err(FfiError::mismatch("write", ty.name(), value.type_name())),
        }
    }

    /// Read a member of a composite located at `base`
    pub fn read_member(&self, member: &Member, base: usize) -> FfiResult<Value> {
        match member.bits {
            Some(slot) => self.read_bits(&member.ty, base + member.offset, slot),
            None => self.read(&member.ty, base + member.offset),
        }
    }

    /// Write a member of a composite located at `base`
    pub fn write_member(&self, member: &Member, base: usize, value: &Value) -> FfiResult<()> {
        match member.bits {
            Some(slot) => self.write_bits(&member.ty, base + member.offset, slot, value),
            None => self.write(&member.ty, base + member.offset, value),
        }
    }

    /// Read a bit-field from the storage unit at `unit_offset`
    pub fn read_bits(&self, ty: &TypeDescriptor, unit_offset: usize, slot: BitSlot) -> FfiResult<Value> {
        let p = self.locate("read", unit_offset, ty.size())?;
        let raw = unsafe { load_bits(p, ty.size()) };
        let field = (raw >> slot.offset) & mask(slot.width);
        Ok(match ty.kind() {
            TypeKind::Bool => Value::Bool(field != 0),
            _ => int_value(field, slot.width as usize, ty.is_signed()),
        })
    }

    /// Write a bit-field; bits above the field width are dropped
    pub fn write_bits(
        &self,
        ty: &TypeDescriptor,
        unit_offset: usize,
        slot: BitSlot,
        value: &Value,
    ) -> FfiResult<()> {
        let bits = integer_bits(ty, value)?;
        let p = self.locate("write", unit_offset, ty.size())?;
        let field_mask = mask(slot.width) << slot.offset;
        unsafe {
            let raw = load_bits(p, ty.size());
            store_bits(p, ty.size(), (raw & !field_mask) | ((bits << slot.offset) & field_mask));
        }
        Ok(())
    }
}

fn contains_pointers(ty: &TypeDescriptor) -> bool {
    match ty.kind() {
        TypeKind::Pointer(_) => true,
        TypeKind::Array { element, .. } => contains_pointers(element),
        TypeKind::Struct(layout) | TypeKind::Union(layout) => {
            layout.fields().iter().any(|f| contains_pointers(&f.ty))
        }
        _ => false,
    }
}

pub(crate) fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

pub(crate) fn sign_extend(bits: u64, width: usize) -> i64 {
    if width >= 64 || width == 0 {
        bits as i64
    } else {
        let shift = 64 - width as u32;
        ((bits << shift) as i64) >> shift
    }
}

/// Host integer for the low `width` bits of `bits`
pub(crate) fn int_value(bits: u64, width: usize, signed: bool) -> Value {
    if signed {
        Value::Int(sign_extend(bits, width))
    } else {
        Value::UInt(bits & mask(width as u32))
    }
}

/// Raw two's-complement bits of an integral host value
pub(crate) fn integer_bits(ty: &TypeDescriptor, value: &Value) -> FfiResult<u64> {
    match value {
        Value::Int(i) => Ok(*i as u64),
        Value::UInt(u) => Ok(*u),
        Value::Bool(b) => Ok(*b as u64),
        Value::CData(c) if c.type_descriptor().is_integral() => integer_bits(ty, &c.value()?),
        _ => Err(FfiError::mismatch("write", ty.name(), value.type_name())),
    }
}

fn float_value(ty: &TypeDescriptor, value: &Value) -> FfiResult<f64> {
    match value {
        Value::Float(_) | Value::Double(_) | Value::Int(_) | Value::UInt(_) => value
            .as_f64()
            .ok_or_else(|| FfiError::mismatch("write", ty.name(), value.type_name())),
        _ => Err(FfiError::mismatch("write", ty.name(), value.type_name())),
    }
}

/// Load a native-endian integer of `size` bytes
///
/// # Safety
///
/// `p` must be valid for reading `size` bytes.
pub(crate) unsafe fn load_bits(p: *const u8, size: usize) -> u64 {
    match size {
        1 => p.read() as u64,
        2 => ptr::read_unaligned(p as *const u16) as u64,
        4 => ptr::read_unaligned(p as *const u32) as u64,
        _ => ptr::read_unaligned(p as *const u64),
    }
}

/// Store the low `size` bytes of `bits` in native byte order
///
/// # Safety
///
/// `p` must be valid for writing `size` bytes.
pub(crate) unsafe fn store_bits(p: *mut u8, size: usize, bits: u64) {
    match size {
        1 => p.write(bits as u8),
        2 => ptr::write_unaligned(p as *mut u16, bits as u16),
        4 => ptr::write_unaligned(p as *mut u32, bits as u32),
        _ => ptr::write_unaligned(p as *mut u64, bits),
    }
}
