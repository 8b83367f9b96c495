//! Typed pointers
//!
//! A pointer either refers into a block the engine tracks, or carries a raw
//! foreign address handed back by native code. Block-backed pointers are
//! bounds-checked against their block. Foreign pointers cannot be read or
//! written until the caller grants access through the unsafe
//! [`TypedPointer::grant_foreign_access`] capability, because the engine has
//! no way to know how much memory sits behind them.

use crate::error::{FfiError, FfiResult};
use crate::instance::CData;
use crate::memory::{MemoryBlock, MemoryView};
use crate::types::TypeDescriptor;
use crate::value::Value;
use std::fmt;

#[derive(Clone)]
enum Address {
    Null,
    Block { block: MemoryBlock, offset: usize },
    Foreign(usize),
}

/// `POINTER(T)` value
#[derive(Clone)]
pub struct TypedPointer {
    target: TypeDescriptor,
    address: Address,
    foreign_access: bool,
}

impl TypedPointer {
    pub fn null(target: &TypeDescriptor) -> Self {
        Self {
            target: target.clone(),
            address: Address::Null,
            foreign_access: false,
        }
    }

    /// A pointer to `offset` within `block`
    pub fn from_block(target: &TypeDescriptor, block: &MemoryBlock, offset: usize) -> Self {
        Self {
            target: target.clone(),
            address: Address::Block {
                block: block.clone(),
                offset,
            },
            foreign_access: false,
        }
    }

    pub(crate) fn foreign(target: &TypeDescriptor, address: usize) -> Self {
        Self {
            target: target.clone(),
            address: if address == 0 {
                Address::Null
            } else {
                Address::Foreign(address)
            },
            foreign_access: false,
        }
    }

    /// Wrap a raw address returned by native code
    ///
    /// The result cannot be dereferenced until
    /// [`grant_foreign_access`](Self::grant_foreign_access) is called.
    pub fn wrap_foreign_pointer(address: usize, target: &TypeDescriptor) -> Self {
        Self::foreign(target, address)
    }

    /// Allow reads and writes through a foreign address
    ///
    /// # Safety
    ///
    /// The caller must ensure every element later accessed through this
    /// pointer (and pointers derived from it by `offset` or `cast`) is valid
    /// native memory for the target type.
    pub unsafe fn grant_foreign_access(mut self) -> Self {
        self.foreign_access = true;
        self
    }

    pub fn has_foreign_access(&self) -> bool {
        self.foreign_access
    }

    pub fn target(&self) -> &TypeDescriptor {
        &self.target
    }

    pub fn is_null(&self) -> bool {
        matches!(self.address, Address::Null)
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self.address, Address::Foreign(_))
    }

    /// Numeric address; 0 for NULL
    pub fn address(&self) -> usize {
        match &self.address {
            Address::Null => 0,
            Address::Block { block, offset } => block.address() + offset,
            Address::Foreign(address) => *address,
        }
    }

    /// Block this pointer refers into, if the engine tracks it
    pub fn block(&self) -> Option<&MemoryBlock> {
        match &self.address {
            Address::Block { block, .. } => Some(block),
            _ => None,
        }
    }

    /// `*p`
    pub fn deref(&self) -> FfiResult<Value> {
        self.index(0)
    }

    /// `*p = value`
    pub fn set(&self, value: impl Into<Value>) -> FfiResult<()> {
        self.index_set(0, value)
    }

    /// `p[index]`
    ///
    /// Pointers into an engine block are checked against that block and fail
    /// with `OutOfBounds`. Foreign pointers are not checked beyond null.
    pub fn index(&self, index: isize) -> FfiResult<Value> {
        let target = self.target.clone();
        self.with_element("index", index, |view, offset| view.read(&target, offset))
    }

    /// `p[index] = value`, with the same bounds rules as [`TypedPointer::index`]
    pub fn index_set(&self, index: isize, value: impl Into<Value>) -> FfiResult<()> {
        let value = value.into();
        let target = self.target.clone();
        self.with_element("index_set", index, |view, offset| {
            view.write(&target, offset, &value)?;
            if view.block().is_native() {
                view.block().leak_retained();
            }
            Ok(())
        })
    }

    /// `p.contents`: the pointee as an addressable instance
    pub fn contents(&self) -> FfiResult<CData> {
        let size = self.element_size("contents")?;
        match &self.address {
            Address::Null => Err(self.null_dereference("contents")),
            Address::Block { block, offset } => CData::from_block(&self.target, block, *offset),
            Address::Foreign(address) => {
                let block = self.foreign_element("contents", *address, size)?;
                CData::from_block(&self.target, &block, 0)
            }
        }
    }

    /// Pointer arithmetic in units of the target size
    pub fn offset(&self, count: isize) -> TypedPointer {
        let delta = count.wrapping_mul(self.target.size() as isize);
        let address = match &self.address {
            Address::Null => Address::Null,
            Address::Block { block, offset } => Address::Block {
                block: block.clone(),
                offset: offset.wrapping_add_signed(delta),
            },
            Address::Foreign(address) => Address::Foreign(address.wrapping_add_signed(delta)),
        };
        TypedPointer {
            target: self.target.clone(),
            address,
            foreign_access: self.foreign_access,
        }
    }

    /// The same address viewed through another target type
    pub fn cast(&self, target: &TypeDescriptor) -> TypedPointer {
        TypedPointer {
            target: target.clone(),
            address: self.address.clone(),
            foreign_access: self.foreign_access,
        }
    }

    /// `byref`/`pointer`: address of an addressable value
    pub fn address_of(value: &Value) -> FfiResult<TypedPointer> {
        match value {
            Value::CData(instance) => Ok(instance.pointer()),
            other => Err(FfiError::NotAddressable {
                operation: "address_of",
                reason: format!("{} values are not backed by native memory", other.type_name()),
            }),
        }
    }

    fn element_size(&self, operation: &'static str) -> FfiResult<usize> {
        if self.target.size() == 0 {
            return Err(FfiError::unsupported(
                self.target.name(),
                format!("{} through a pointer to an unsized type", operation),
            ));
        }
        Ok(self.target.size())
    }

    fn null_dereference(&self, operation: &'static str) -> FfiError {
        FfiError::NullDereference {
            operation,
            target: self.target.name().to_string(),
        }
    }

    fn foreign_element(&self, operation: &'static str, address: usize, size: usize) -> FfiResult<MemoryBlock> {
        if !self.foreign_access {
            return Err(FfiError::ForeignAccessDenied { operation, address });
        }
        // Safety: the holder of this pointer vouched for the memory in
        // grant_foreign_access.
        unsafe { MemoryBlock::wrap_native(address, size) }
    }

    fn with_element<R>(
        &self,
        operation: &'static str,
        index: isize,
        f: impl FnOnce(MemoryView<'_>, usize) -> FfiResult<R>,
    ) -> FfiResult<R> {
        let size = self.element_size(operation)?;
        match &self.address {
            Address::Null => Err(self.null_dereference(operation)),
            Address::Block { block, offset } => {
                let position = index
                    .checked_mul(size as isize)
                    .and_then(|delta| (*offset as isize).checked_add(delta));
                match position {
                    Some(position) if position >= 0 => f(block.view(), position as usize),
                    _ => Err(FfiError::OutOfBounds {
                        operation,
                        offset: position.unwrap_or(isize::MIN),
                        len: size,
                        size: block.len(),
                    }),
                }
            }
            Address::Foreign(address) => {
                let element = address.wrapping_add_signed(index.wrapping_mul(size as isize));
                let block = self.foreign_element(operation, element, size)?;
                f(block.view(), 0)
            }
        }
    }
}

/// Pointers are equal when they share a target type and address
impl PartialEq for TypedPointer {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.address() == other.address()
    }
}

impl fmt::Debug for TypedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedPointer")
            .field("target", &self.target.name())
            .field("address", &format_args!("{:#x}", self.address()))
            .field("foreign", &self.is_foreign())
            .finish()
    }
}

impl fmt::Display for TypedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "<{}* NULL>", self.target.name())
        } else {
            write!(f, "<{}* {:#x}>", self.target.name(), self.address())
        }
    }
}
