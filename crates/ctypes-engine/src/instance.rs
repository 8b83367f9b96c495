//! Typed instances over memory blocks

use crate::error::{FfiError, FfiResult};
use crate::layout::Member;
use crate::memory::{MemoryBlock, MemoryView};
use crate::pointer::TypedPointer;
use crate::types::TypeDescriptor;
use crate::value::Value;
use std::fmt;

/// An addressable instance of a C type
///
/// Sub-instances returned by [`CData::field`] and [`CData::at`] share the
/// parent's block, so writes through either are visible to both.
#[derive(Clone)]
pub struct CData {
    ty: TypeDescriptor,
    block: MemoryBlock,
    offset: usize,
}

impl CData {
    /// A zero-initialized instance in a fresh block
    pub fn new(ty: &TypeDescriptor) -> FfiResult<Self> {
        if ty.is_void() {
            return Err(FfiError::unsupported("void", "void cannot be instantiated"));
        }
        Ok(Self {
            ty: ty.clone(),
            block: MemoryBlock::allocate(ty.size())?,
            offset: 0,
        })
    }

    /// A fresh instance initialized from a host value
    pub fn from_value(ty: &TypeDescriptor, value: impl Into<Value>) -> FfiResult<Self> {
        let instance = Self::new(ty)?;
        instance.set_value(value)?;
        Ok(instance)
    }

    /// An instance viewing existing memory at `offset`
    pub fn from_block(ty: &TypeDescriptor, block: &MemoryBlock, offset: usize) -> FfiResult<Self> {
        block.view_range(offset, ty.size())?;
        Ok(Self {
            ty: ty.clone(),
            block: block.clone(),
            offset,
        })
    }

    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }

    /// Numeric address of the instance
    pub fn address(&self) -> usize {
        self.block.address() + self.offset
    }

    pub fn view(&self) -> FfiResult<MemoryView<'_>> {
        self.block.view_range(self.offset, self.ty.size())
    }

    /// Read the whole instance as a host value
    pub fn value(&self) -> FfiResult<Value> {
        self.view()?.read(&self.ty, 0)
    }

    pub fn set_value(&self, value: impl Into<Value>) -> FfiResult<()> {
        self.view()?.write(&self.ty, 0, &value.into())
    }

    fn member(&self, name: &str) -> FfiResult<&Member> {
        let layout = self.ty.layout().ok_or_else(|| FfiError::InvalidField {
            composite: self.ty.name().to_string(),
            field: name.to_string(),
            reason: "type has no members".to_string(),
        })?;
        layout.member(name).ok_or_else(|| FfiError::InvalidField {
            composite: self.ty.name().to_string(),
            field: name.to_string(),
            reason: "no such member".to_string(),
        })
    }

    /// Read a member by name, including promoted anonymous members
    pub fn get(&self, name: &str) -> FfiResult<Value> {
        let member = self.member(name)?;
        self.view()?.read_member(member, 0)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> FfiResult<()> {
        let member = self.member(name)?;
        self.view()?.write_member(member, 0, &value.into())
    }

    /// The member as an instance sharing this one's memory
    pub fn field(&self, name: &str) -> FfiResult<CData> {
        let member = self.member(name)?;
        if member.bits.is_some() {
            return Err(FfiError::NotAddressable {
                operation: "field",
                reason: format!("'{}' is a bit-field", name),
            });
        }
        Ok(CData {
            ty: member.ty.clone(),
            block: self.block.clone(),
            offset: self.offset + member.offset,
        })
    }

    /// Element count for arrays
    pub fn count(&self) -> Option<usize> {
        self.ty.element().map(|(_, count)| count)
    }

    /// Array element `index` as an instance sharing this one's memory
    pub fn at(&self, index: usize) -> FfiResult<CData> {
        let (element, count) = self
            .ty
            .element()
            .ok_or_else(|| FfiError::mismatch("at", "array", self.ty.name()))?;
        if index >= count {
            return Err(FfiError::OutOfBounds {
                operation: "at",
                offset: index.saturating_mul(element.size()) as isize,
                len: element.size(),
                size: self.ty.size(),
            });
        }
        Ok(CData {
            ty: element.clone(),
            block: self.block.clone(),
            offset: self.offset + index * element.size(),
        })
    }

    pub fn get_index(&self, index: usize) -> FfiResult<Value> {
        self.at(index)?.value()
    }

    pub fn set_index(&self, index: usize, value: impl Into<Value>) -> FfiResult<()> {
        self.at(index)?.set_value(value)
    }

    /// Raw bytes of the instance
    pub fn bytes(&self) -> FfiResult<Vec<u8>> {
        self.view()?.read_bytes(0, self.ty.size())
    }

    /// The same memory viewed as another type
    pub fn reinterpret(&self, ty: &TypeDescriptor) -> FfiResult<CData> {
        CData::from_block(ty, &self.block, self.offset)
    }

    /// `pointer(instance)`: a typed pointer to this instance
    pub fn pointer(&self) -> TypedPointer {
        TypedPointer::from_block(&self.ty, &self.block, self.offset)
    }
}

/// Instances are equal when they view the same memory as the same type
impl PartialEq for CData {
    fn eq(&self, other: &Self) -> bool {
        MemoryBlock::same(&self.block, &other.block) && self.offset == other.offset && self.ty == other.ty
    }
}

impl fmt::Debug for CData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CData")
            .field("type", &self.ty.name())
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}
