//! Layout engine - C-compatible struct and union layout
//!
//! Offsets are computed once, when a composite is defined:
//! - each field is placed at the next offset that is a multiple of its
//!   effective alignment (`min(natural, N)` under `Packing::Packed(N)`)
//! - the composite's alignment is the largest effective member alignment
//! - trailing padding rounds the size up to that alignment
//! - consecutive bit-fields share a storage unit of their declared type,
//!   filled from bit 0, until a field no longer fits
//! - union members all start at offset 0
//!
//! Anonymous composite fields have their members promoted into the
//! enclosing composite with absolute offsets, so member lookup never walks
//! nested layouts at access time.

use crate::error::{FfiError, FfiResult};
use crate::types::{TypeDescriptor, TypeKind};
use std::fmt;

/// Packing mode of a composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Packing {
    /// Natural alignment for every member
    #[default]
    Natural,
    /// `#pragma pack(N)`: member alignment capped at N
    Packed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    Struct,
    Union,
}

/// A field as declared
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: Option<String>,
    pub ty: TypeDescriptor,
    pub bits: Option<u32>,
}

impl FieldSpec {
    /// An ordinary named field
    pub fn new(name: impl Into<String>, ty: &TypeDescriptor) -> Self {
        Self {
            name: Some(name.into()),
            ty: ty.clone(),
            bits: None,
        }
    }

    /// An anonymous field; composite members are promoted
    pub fn anonymous(ty: &TypeDescriptor) -> Self {
        Self {
            name: None,
            ty: ty.clone(),
            bits: None,
        }
    }

    /// A named bit-field of `width` bits
    pub fn bits(name: impl Into<String>, ty: &TypeDescriptor, width: u32) -> Self {
        Self {
            name: Some(name.into()),
            ty: ty.clone(),
            bits: Some(width),
        }
    }

    /// An unnamed bit-field; width 0 closes the current storage unit
    pub fn padding_bits(ty: &TypeDescriptor, width: u32) -> Self {
        Self {
            name: None,
            ty: ty.clone(),
            bits: Some(width),
        }
    }
}

/// A placed field of a composite
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: Option<String>,
    pub ty: TypeDescriptor,
    /// Byte offset of the field, or of its storage unit for bit-fields
    pub offset: usize,
    pub bit_width: Option<u32>,
    /// Bit position inside the storage unit (0 for ordinary fields)
    pub bit_offset: u32,
}

/// Position of a bit-field inside its storage unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSlot {
    pub offset: u32,
    pub width: u32,
}

/// A name-resolvable member, with its absolute offset
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub ty: TypeDescriptor,
    pub offset: usize,
    pub bits: Option<BitSlot>,
}

/// Computed layout of a struct or union
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeLayout {
    name: String,
    kind: CompositeKind,
    packing: Packing,
    fields: Vec<FieldDescriptor>,
    members: Vec<Member>,
    size: usize,
    align: usize,
}

impl CompositeLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CompositeKind {
        self.kind
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Name-resolvable members, including promoted anonymous members
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Offset of a member by name
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.member(name).map(|m| m.offset)
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

fn invalid(composite: &str, field: &str, reason: impl Into<String>) -> FfiError {
    FfiError::InvalidField {
        composite: composite.to_string(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Open bit-field storage unit
struct BitRun {
    unit_offset: usize,
    unit_size: usize,
    used: u32,
}

/// Compute the layout of a composite from its declared fields
pub fn compute_layout(
    name: &str,
    kind: CompositeKind,
    fields: &[FieldSpec],
    packing: Packing,
) -> FfiResult<CompositeLayout> {
    let cap = match packing {
        Packing::Natural => usize::MAX,
        Packing::Packed(n) if n.is_power_of_two() => n,
        Packing::Packed(n) => {
            return Err(invalid(
                name,
                "_pack_",
                format!("packing must be a power of two, got {}", n),
            ))
        }
    };

    let mut placed = Vec::with_capacity(fields.len());
    let mut offset = 0usize;
    let mut size = 0usize;
    let mut align = 1usize;
    let mut run: Option<BitRun> = None;

    for spec in fields {
        let label = spec.name.as_deref().unwrap_or("<anonymous>");
        if spec.ty.is_void() {
            return Err(invalid(name, label, "fields cannot have type void"));
        }
        let field_align = spec.ty.align().min(cap);
        align = align.max(field_align);

        let Some(width) = spec.bits else {
            run = None;
            let field_offset = match kind {
                CompositeKind::Struct => align_up(offset, field_align),
                CompositeKind::Union => 0,
            };
            offset = field_offset + spec.ty.size();
            size = size.max(offset);
            placed.push(FieldDescriptor {
                name: spec.name.clone(),
                ty: spec.ty.clone(),
                offset: field_offset,
                bit_width: None,
                bit_offset: 0,
            });
            continue;
        };

        if !spec.ty.is_integral() {
            return Err(invalid(
                name,
                label,
                format!("bit-fields require an integer type, got {}", spec.ty.name()),
            ));
        }
        let storage_bits = (spec.ty.size() * 8) as u32;
        if width > storage_bits {
            return Err(invalid(
                name,
                label,
                format!(
                    "bit width {} exceeds the {} bits of {}",
                    width,
                    storage_bits,
                    spec.ty.name()
                ),
            ));
        }
        if width == 0 {
            if spec.name.is_some() {
                return Err(invalid(name, label, "zero-width bit-fields must be unnamed"));
            }
            run = None;
            if kind == CompositeKind::Struct {
                offset = align_up(offset, field_align);
                size = size.max(offset);
            }
            continue;
        }

        let (unit_offset, bit_offset) = match kind {
            CompositeKind::Union => {
                size = size.max(spec.ty.size());
                (0, 0)
            }
            CompositeKind::Struct => {
                let continued = run
                    .take()
                    .filter(|open| open.unit_size == spec.ty.size() && open.used + width <= storage_bits);
                let mut open = match continued {
                    Some(open) => open,
                    None => {
                        let unit_offset = align_up(offset, field_align);
                        offset = unit_offset + spec.ty.size();
                        size = size.max(offset);
                        BitRun {
                            unit_offset,
                            unit_size: spec.ty.size(),
                            used: 0,
                        }
                    }
                };
                let bit_offset = open.used;
                open.used += width;
                let unit_offset = open.unit_offset;
                run = Some(open);
                (unit_offset, bit_offset)
            }
        };

        placed.push(FieldDescriptor {
            name: spec.name.clone(),
            ty: spec.ty.clone(),
            offset: unit_offset,
            bit_width: Some(width),
            bit_offset,
        });
    }

    let members = resolve_members(name, &placed)?;

    Ok(CompositeLayout {
        name: name.to_string(),
        kind,
        packing,
        fields: placed,
        members,
        size: align_up(size, align),
        align,
    })
}

/// Flatten named fields and promoted anonymous members into one lookup table
fn resolve_members(composite: &str, fields: &[FieldDescriptor]) -> FfiResult<Vec<Member>> {
    let mut members: Vec<Member> = Vec::new();
    let mut push = |member: Member| -> FfiResult<()> {
        if members.iter().any(|m| m.name == member.name) {
            return Err(invalid(composite, &member.name, "duplicate member name"));
        }
        members.push(member);
        Ok(())
    };

    for field in fields {
        match (&field.name, field.ty.layout()) {
            (Some(name), _) => push(Member {
                name: name.clone(),
                ty: field.ty.clone(),
                offset: field.offset,
                bits: field.bit_width.map(|width| BitSlot {
                    offset: field.bit_offset,
                    width,
                }),
            })?,
            (None, Some(inner)) if field.bit_width.is_none() => {
                for member in inner.members() {
                    push(Member {
                        offset: field.offset + member.offset,
                        ..member.clone()
                    })?;
                }
            }
            // unnamed scalars and unnamed bit-fields are padding
            (None, _) => {}
        }
    }

    Ok(members)
}

impl fmt::Display for CompositeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self.kind {
            CompositeKind::Struct => "struct",
            CompositeKind::Union => "union",
        };
        write!(f, "{} {} (size {}, align {}", keyword, self.name, self.size, self.align)?;
        if let Packing::Packed(n) = self.packing {
            write!(f, ", packed {}", n)?;
        }
        write!(f, ")")?;

        for field in &self.fields {
            let name = field.name.as_deref().unwrap_or("<anonymous>");
            write!(f, "\n  [{}] {}: {}", field.offset, name, field.ty.name())?;
            if let Some(width) = field.bit_width {
                write!(f, " : {} @ bit {}", width, field.bit_offset)?;
            }
        }
        Ok(())
    }
}

/// Whether a layout contains unions or packing anywhere
pub(crate) fn has_irregular_members(layout: &CompositeLayout) -> bool {
    layout.kind == CompositeKind::Union
        || layout.packing != Packing::Natural
        || layout.fields.iter().any(|f| match f.ty.kind() {
            TypeKind::Struct(inner) | TypeKind::Union(inner) => has_irregular_members(inner),
            _ => false,
        })
}
