//! Memory view, instance and pointer integration tests

mod common;

use common::{assert_eq, ty};
use ctypes_engine::{
    buffer_string, create_string_buffer, create_unicode_buffer, read_cstring, CData, FfiError,
    FieldSpec, MemoryBlock, Packing, TypeRegistry, TypedPointer, Value,
};
use rstest::rstest;

fn point(registry: &TypeRegistry) -> ctypes_engine::TypeDescriptor {
    let int = registry.by_name("int").unwrap();
    registry
        .define_struct(
            "Point",
            vec![FieldSpec::new("x", &int), FieldSpec::new("y", &int)],
            Packing::Natural,
        )
        .unwrap()
}

// -----------------------------------------------------------------------------
// Scalar storage
// -----------------------------------------------------------------------------

#[rstest]
#[case("int8", Value::Int(-128))]
#[case("uint16", Value::UInt(65535))]
#[case("int32", Value::Int(-123_456))]
#[case("uint64", Value::UInt(u64::MAX))]
#[case("double", Value::Double(2.5))]
#[case("float", Value::Float(-0.75))]
#[case("bool", Value::Bool(true))]
fn test_scalar_storage(#[case] name: &str, #[case] value: Value) {
    let t = ty(name);
    let instance = CData::from_value(&t, value.clone()).unwrap();
    assert_eq!(instance.value().unwrap(), value);
}

#[test]
fn test_integer_storage_wraps_to_width() {
    let byte = CData::from_value(&ty("uint8"), 0x1ff).unwrap();
    assert_eq!(byte.value().unwrap(), Value::UInt(0xff));

    let signed = CData::from_value(&ty("int8"), 0x80).unwrap();
    assert_eq!(signed.value().unwrap(), Value::Int(-128));
}

#[test]
fn test_type_mismatch_on_store() {
    let err = CData::from_value(&ty("int"), "text").unwrap_err();
    assert!(matches!(err, FfiError::TypeMismatch { .. }));
}

#[test]
fn test_view_bounds_checked() {
    let block = MemoryBlock::allocate(4).unwrap();
    let view = block.view();
    assert!(view.write(&ty("int32"), 0, &Value::Int(1)).is_ok());
    let err = view.write(&ty("int32"), 2, &Value::Int(1)).unwrap_err();
    assert!(matches!(err, FfiError::OutOfBounds { size: 4, .. }));
    assert!(block.view_range(2, 4).is_err());
}

// -----------------------------------------------------------------------------
// Composites
// -----------------------------------------------------------------------------

#[test]
fn test_struct_members() {
    let registry = TypeRegistry::host();
    let p = CData::new(&point(&registry)).unwrap();
    p.set("x", 3).unwrap();
    p.set("y", -4).unwrap();

    assert_eq!(p.get("x").unwrap(), Value::Int(3));
    assert_eq!(
        p.value().unwrap(),
        Value::record([("x", Value::Int(3)), ("y", Value::Int(-4))])
    );
    assert!(matches!(p.get("z"), Err(FfiError::InvalidField { .. })));
}

#[test]
fn test_field_shares_memory() {
    let registry = TypeRegistry::host();
    let p = CData::new(&point(&registry)).unwrap();
    let y = p.field("y").unwrap();
    y.set_value(42).unwrap();
    assert_eq!(p.get("y").unwrap(), Value::Int(42));
    assert_eq!(y.address(), p.address() + 4);
}

#[test]
fn test_union_aliasing() {
    let registry = TypeRegistry::host();
    let word = registry
        .define_union(
            "Word",
            vec![
                FieldSpec::new("value", &ty("uint32")),
                FieldSpec::new("bytes", &registry.by_name("uint8[4]").unwrap()),
            ],
            Packing::Natural,
        )
        .unwrap();

    let w = CData::new(&word).unwrap();
    w.set("value", 0x1234_5678u32).unwrap();
    let bytes = w.get("bytes").unwrap();

    let expected: Vec<Value> = 0x1234_5678u32
        .to_ne_bytes()
        .iter()
        .map(|b| Value::UInt(*b as u64))
        .collect();
    assert_eq!(bytes, Value::List(expected));
    if cfg!(target_endian = "little") {
        assert_eq!(w.bytes().unwrap(), vec![0x78, 0x56, 0x34, 0x12]);
    }
}

#[test]
fn test_bitfield_truncation() {
    let registry = TypeRegistry::host();
    let u8_ty = ty("uint8");
    let flags = registry
        .define_struct(
            "Nibbles",
            vec![FieldSpec::bits("low", &u8_ty, 3), FieldSpec::bits("high", &u8_ty, 5)],
            Packing::Natural,
        )
        .unwrap();

    let f = CData::new(&flags).unwrap();
    f.set("high", 31).unwrap();
    f.set("low", 15).unwrap();
    assert_eq!(f.get("low").unwrap(), Value::UInt(7));
    assert_eq!(f.get("high").unwrap(), Value::UInt(31));
    assert_eq!(f.bytes().unwrap(), vec![0b1111_1111]);

    f.set("low", 0).unwrap();
    assert_eq!(f.get("high").unwrap(), Value::UInt(31));
    assert!(matches!(f.field("low"), Err(FfiError::NotAddressable { .. })));
}

#[test]
fn test_signed_bitfield_sign_extends() {
    let registry = TypeRegistry::host();
    let s = registry
        .define_struct(
            "Signed",
            vec![FieldSpec::bits("v", &ty("int32"), 4)],
            Packing::Natural,
        )
        .unwrap();
    let c = CData::new(&s).unwrap();
    c.set("v", -3).unwrap();
    assert_eq!(c.get("v").unwrap(), Value::Int(-3));
    c.set("v", 9).unwrap();
    assert_eq!(c.get("v").unwrap(), Value::Int(-7));
}

#[test]
fn test_array_indexing() {
    let arr = CData::from_value(
        &ty("int32[4]"),
        Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
    )
    .unwrap();
    assert_eq!(arr.count(), Some(4));
    assert_eq!(arr.get_index(2).unwrap(), Value::Int(3));
    assert_eq!(arr.get_index(3).unwrap(), Value::Int(0));
    arr.set_index(3, 9).unwrap();
    assert_eq!(arr.get_index(3).unwrap(), Value::Int(9));
    assert!(matches!(arr.at(4), Err(FfiError::OutOfBounds { .. })));
}

#[test]
fn test_copy_into_struct_member() {
    let registry = TypeRegistry::host();
    let pt = point(&registry);
    let line = registry
        .define_struct(
            "Line",
            vec![FieldSpec::new("a", &pt), FieldSpec::new("b", &pt)],
            Packing::Natural,
        )
        .unwrap();

    let start = CData::new(&pt).unwrap();
    start.set("x", 1).unwrap();
    start.set("y", 2).unwrap();

    let l = CData::new(&line).unwrap();
    l.set("b", start.clone()).unwrap();
    start.set("x", 100).unwrap();

    let b = l.field("b").unwrap();
    assert_eq!(b.get("x").unwrap(), Value::Int(1));
    assert_eq!(b.get("y").unwrap(), Value::Int(2));
}

#[test]
fn test_reinterpret() {
    let d = CData::from_value(&ty("double"), 1.0f64).unwrap();
    let bits = d.reinterpret(&ty("uint64")).unwrap();
    assert_eq!(bits.value().unwrap(), Value::UInt(1.0f64.to_bits()));
    assert!(d.reinterpret(&ty("int32[4]")).is_err());
}

// -----------------------------------------------------------------------------
// Pointers
// -----------------------------------------------------------------------------

#[test]
fn test_pointer_deref_and_store() {
    let int = ty("int32");
    let x = CData::from_value(&int, 10).unwrap();
    let p = x.pointer();

    assert_eq!(p.deref().unwrap(), Value::Int(10));
    p.set(11).unwrap();
    assert_eq!(x.value().unwrap(), Value::Int(11));
    assert_eq!(p.address(), x.address());
}

#[test]
fn test_null_pointer() {
    let p = TypedPointer::null(&ty("int32"));
    assert!(p.is_null());
    assert!(matches!(p.deref(), Err(FfiError::NullDereference { .. })));
    assert_eq!(p.to_string(), "<int32* NULL>");
}

#[test]
fn test_pointer_arithmetic_within_array() {
    let arr = CData::from_value(
        &ty("int16[3]"),
        Value::List(vec![Value::Int(5), Value::Int(6), Value::Int(7)]),
    )
    .unwrap();
    let first = arr.at(0).unwrap().pointer();

    assert_eq!(first.index(2).unwrap(), Value::Int(7));
    let second = first.offset(1);
    assert_eq!(second.deref().unwrap(), Value::Int(6));
    assert_eq!(second.index(-1).unwrap(), Value::Int(5));
    assert!(matches!(first.index(3), Err(FfiError::OutOfBounds { .. })));
}

#[test]
fn test_pointer_stored_in_struct_keeps_target_alive() {
    let registry = TypeRegistry::host();
    let int = registry.by_name("int").unwrap();
    let holder = registry
        .define_struct(
            "Holder",
            vec![FieldSpec::new("p", &registry.pointer_to(&int))],
            Packing::Natural,
        )
        .unwrap();

    let h = CData::new(&holder).unwrap();
    {
        let target = CData::from_value(&int, 77).unwrap();
        h.set("p", target.pointer()).unwrap();
    }

    let stored = h.get("p").unwrap();
    let ptr = stored.as_pointer().unwrap();
    assert!(!ptr.is_foreign());
    assert_eq!(ptr.deref().unwrap(), Value::Int(77));
}

#[test]
fn test_foreign_pointer_requires_grant() {
    let x = CData::from_value(&ty("int32"), 5).unwrap();
    let foreign = TypedPointer::wrap_foreign_pointer(x.address(), &ty("int32"));
    assert!(matches!(
        foreign.deref(),
        Err(FfiError::ForeignAccessDenied { .. })
    ));

    let granted = unsafe { foreign.grant_foreign_access() };
    assert_eq!(granted.deref().unwrap(), Value::Int(5));
}

#[test]
fn test_cast_views_same_address() {
    let x = CData::from_value(&ty("uint32"), 0x0102_0304u32).unwrap();
    let bytes = x.pointer().cast(&ty("uint8"));
    assert_eq!(bytes.address(), x.address());
    let first = bytes.deref().unwrap();
    let expected = 0x0102_0304u32.to_ne_bytes()[0] as u64;
    assert_eq!(first, Value::UInt(expected));
}

#[test]
fn test_address_of_requires_instance() {
    assert!(matches!(
        TypedPointer::address_of(&Value::Int(1)),
        Err(FfiError::NotAddressable { .. })
    ));
    let x = CData::new(&ty("double")).unwrap();
    let p = TypedPointer::address_of(&Value::CData(x.clone())).unwrap();
    assert_eq!(p.address(), x.address());
}

// -----------------------------------------------------------------------------
// Strings
// -----------------------------------------------------------------------------

#[test]
fn test_string_buffer() {
    let registry = TypeRegistry::host();
    let buf = create_string_buffer(&registry, b"hello").unwrap();
    assert_eq!(buf.size(), 6);
    assert_eq!(read_cstring(&buf.pointer(), None).unwrap(), "hello");
    assert!(matches!(
        create_string_buffer(&registry, b"a\0b"),
        Err(FfiError::InvalidString(_))
    ));
}

#[test]
fn test_string_pointer_member() {
    let registry = TypeRegistry::host();
    let rec = registry
        .define_struct(
            "Named",
            vec![FieldSpec::new("name", &ty("char*"))],
            Packing::Natural,
        )
        .unwrap();
    let r = CData::new(&rec).unwrap();
    assert_eq!(r.get("name").unwrap(), Value::Null);
    r.set("name", "widget").unwrap();
    assert_eq!(r.get("name").unwrap(), Value::Str("widget".to_string()));
}

#[test]
fn test_unicode_buffer() {
    let registry = TypeRegistry::host();
    let buf = create_unicode_buffer(&registry, "héllo", None).unwrap();
    let wchar = registry.by_name("wchar_t").unwrap();
    assert_eq!(buf.count(), Some(6));
    assert_eq!(buf.size(), 6 * wchar.size());
    assert_eq!(buffer_string(&buf).unwrap(), "héllo");
}
