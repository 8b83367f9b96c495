//! String buffers and string helpers
//!
//! Provides:
//! - `create_string_buffer` / `create_unicode_buffer`: mutable char arrays
//!   that native code can write into
//! - `read_cstring`: NUL-terminated reads through a typed pointer
//! - `BoundedOutput`: interpretation of `snprintf`-style bounded writes

use crate::error::{FfiError, FfiResult};
use crate::instance::CData;
use crate::pointer::TypedPointer;
use crate::types::{Primitive, TypeRegistry};
use crate::value::Value;
use std::ffi::{c_char, CStr};

/// A `char[len + 1]` buffer holding `init` followed by a NUL
pub fn create_string_buffer(registry: &TypeRegistry, init: &[u8]) -> FfiResult<CData> {
    if init.contains(&0) {
        return Err(FfiError::InvalidString(
            "initializer contains a NUL byte".to_string(),
        ));
    }
    let buffer = create_string_buffer_sized(registry, init.len() + 1)?;
    buffer.view()?.write_bytes(0, init)?;
    Ok(buffer)
}

/// A zero-filled `char[size]` buffer
pub fn create_string_buffer_sized(registry: &TypeRegistry, size: usize) -> FfiResult<CData> {
    let char_ty = registry.describe(Primitive::Int8)?;
    CData::new(&registry.array(&char_ty, size)?)
}

/// A `wchar_t[]` buffer holding `init`, sized to fit it when `size` is `None`
pub fn create_unicode_buffer(
    registry: &TypeRegistry,
    init: &str,
    size: Option<usize>,
) -> FfiResult<CData> {
    let wchar = registry.describe(Primitive::WChar)?;
    let encoded = encode_wide(init, wchar.size());
    let needed = encoded.len() / wchar.size();
    let count = size.unwrap_or(needed);
    if count < needed - 1 {
        return Err(FfiError::mismatch(
            "create_unicode_buffer",
            format!("wchar_t[{}]", count),
            format!("string of {} characters", needed - 1),
        ));
    }
    let buffer = CData::new(&registry.array(&wchar, count)?)?;
    let len = encoded.len().min(buffer.size());
    buffer.view()?.write_bytes(0, &encoded[..len])?;
    Ok(buffer)
}

/// Text of a `char` or `wchar_t` array up to its first NUL
pub fn buffer_string(buffer: &CData) -> FfiResult<String> {
    let bytes = buffer.bytes()?;
    if let Some((element, _)) = buffer.type_descriptor().element() {
        if element.size() > 1 {
            return Ok(decode_wide(&bytes, element.size()));
        }
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Read a NUL-terminated string through `ptr`, stopping after `max_len` bytes
///
/// Block-backed pointers never read past their block. Foreign pointers
/// need foreign access granted.
pub fn read_cstring(ptr: &TypedPointer, max_len: Option<usize>) -> FfiResult<String> {
    if ptr.is_null() {
        return Err(FfiError::NullDereference {
            operation: "read_cstring",
            target: "char".to_string(),
        });
    }

    let bytes = match ptr.block() {
        Some(block) => {
            let start = ptr.address() - block.address();
            let available = block.len().saturating_sub(start);
            let limit = max_len.map_or(available, |m| m.min(available));
            block.view().read_bytes(start, limit)?
        }
        None => {
            if !ptr.has_foreign_access() {
                return Err(FfiError::ForeignAccessDenied {
                    operation: "read_cstring",
                    address: ptr.address(),
                });
            }
            // Safety: access was granted for this foreign pointer
            unsafe { read_foreign_bytes(ptr.address(), max_len) }
        }
    };

    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// # Safety
///
/// `address` must point at readable memory holding a NUL within `max_len`
/// bytes (or anywhere, when `max_len` is `None`).
unsafe fn read_foreign_bytes(address: usize, max_len: Option<usize>) -> Vec<u8> {
    let p = address as *const u8;
    match max_len {
        None => CStr::from_ptr(p as *const c_char).to_bytes().to_vec(),
        Some(max) => {
            let mut bytes = Vec::new();
            for i in 0..max {
                let b = p.add(i).read();
                if b == 0 {
                    break;
                }
                bytes.push(b);
            }
            bytes
        }
    }
}

/// Encode `s` as `wchar_t` units including the terminating NUL
///
/// Two-byte units are UTF-16, four-byte units are UTF-32.
pub fn encode_wide(s: &str, wchar_size: usize) -> Vec<u8> {
    if wchar_size == 2 {
        s.encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_ne_bytes)
            .collect()
    } else {
        s.chars()
            .map(|c| c as u32)
            .chain(std::iter::once(0))
            .flat_map(u32::to_ne_bytes)
            .collect()
    }
}

/// Decode `wchar_t` units up to the first NUL unit
pub fn decode_wide(bytes: &[u8], wchar_size: usize) -> String {
    if wchar_size == 2 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .take_while(|&u| u != 0)
            .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

/// Decode a NUL-terminated wide string at a native address
///
/// # Safety
///
/// `address` must point at a readable, NUL-terminated `wchar_t` string.
pub(crate) unsafe fn read_wide_raw(address: usize, wchar_size: usize) -> String {
    let mut bytes = Vec::new();
    let mut p = address as *const u8;
    loop {
        let unit = std::slice::from_raw_parts(p, wchar_size);
        if unit.iter().all(|&b| b == 0) {
            break;
        }
        bytes.extend_from_slice(unit);
        p = p.add(wchar_size);
    }
    decode_wide(&bytes, wchar_size)
}

/// Result of a bounded write such as `snprintf(buf, n, ...)`
///
/// C99 `snprintf` returns the length the full output would have had, while
/// older runtimes (MSVC `_snprintf`) return a negative value on truncation
/// and may leave the buffer unterminated. `BoundedOutput` reports both
/// conventions the same way.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedOutput {
    /// The function's return value
    pub returned: i64,
    /// Capacity handed to the function
    pub buffer_len: usize,
    /// Buffer text up to the first NUL (or the whole buffer)
    pub contents: String,
}

impl BoundedOutput {
    pub fn inspect(returned: &Value, buffer: &CData) -> FfiResult<Self> {
        let returned = returned
            .as_i64()
            .ok_or_else(|| FfiError::mismatch("inspect", "integer return", returned.type_name()))?;
        Ok(Self {
            returned,
            buffer_len: buffer.size(),
            contents: buffer_string(buffer)?,
        })
    }

    /// Whether the output was cut short
    pub fn truncated(&self) -> bool {
        self.returned < 0 || self.returned as u64 >= self.buffer_len as u64
    }

    /// The text that actually landed in the buffer
    pub fn text(&self) -> &str {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_buffer_terminated() {
        let registry = TypeRegistry::host();
        let buf = create_string_buffer(&registry, b"hello").unwrap();
        assert_eq!(buf.size(), 6);
        assert_eq!(buf.bytes().unwrap(), b"hello\0".to_vec());
        assert_eq!(buffer_string(&buf).unwrap(), "hello");
    }

    #[test]
    fn test_string_buffer_rejects_nul() {
        let registry = TypeRegistry::host();
        assert!(matches!(
            create_string_buffer(&registry, b"a\0b"),
            Err(FfiError::InvalidString(_))
        ));
    }

    #[test]
    fn test_read_cstring_stops_at_block_end() {
        let registry = TypeRegistry::host();
        let buf = create_string_buffer_sized(&registry, 4).unwrap();
        buf.view().unwrap().write_bytes(0, b"abcd").unwrap();
        let p = buf.at(0).unwrap().pointer();
        assert_eq!(read_cstring(&p, None).unwrap(), "abcd");
        assert_eq!(read_cstring(&p, Some(2)).unwrap(), "ab");
    }

    #[test]
    fn test_wide_round_trip() {
        for size in [2, 4] {
            let bytes = encode_wide("héllo ✓", size);
            assert_eq!(bytes.len() % size, 0);
            assert_eq!(decode_wide(&bytes, size), "héllo ✓");
        }
    }

    #[test]
    fn test_unicode_buffer() {
        let registry = TypeRegistry::host();
        let buf = create_unicode_buffer(&registry, "hi", Some(8)).unwrap();
        assert_eq!(buf.count(), Some(8));
        let wchar = registry.describe(Primitive::WChar).unwrap();
        assert_eq!(decode_wide(&buf.bytes().unwrap(), wchar.size()), "hi");
        assert!(create_unicode_buffer(&registry, "toolong", Some(3)).is_err());
    }

    #[test]
    fn test_bounded_output_truncation() {
        let registry = TypeRegistry::host();
        let buf = create_string_buffer(&registry, b"Hel").unwrap();
        let c99 = BoundedOutput::inspect(&Value::Int(11), &buf).unwrap();
        assert!(c99.truncated());
        assert_eq!(c99.text(), "Hel");

        let msvc = BoundedOutput::inspect(&Value::Int(-1), &buf).unwrap();
        assert!(msvc.truncated());

        let fits = BoundedOutput::inspect(&Value::Int(3), &buf).unwrap();
        assert!(!fits.truncated());
    }
}
