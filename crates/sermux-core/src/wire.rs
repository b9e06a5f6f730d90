//! Binary serialization for [`VarMap`].
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! FE EF | version 01 | flags | entry* | EF FE
//! entry: u16 key_len | key bytes | u8 tag | value body
//! ```
//!
//! String and byte-array bodies are `u16 len` plus bytes; scalars are their
//! fixed-width little-endian encoding; decimals and GUIDs are raw 16 bytes;
//! a nested map is a complete recursive map starting with its own header.

use crate::{Decimal128, MapError, Value, ValueTag, VarMap, MAX_KEY_LEN, MAX_VALUE_LEN};
use uuid::Uuid;

/// Map header magic.
pub const MAP_MAGIC: [u8; 2] = [0xFE, 0xEF];
/// Map footer.
pub const MAP_FOOTER: [u8; 2] = [0xEF, 0xFE];
/// Format version.
pub const MAP_VERSION: u8 = 0x01;

impl VarMap {
    /// Serialize this map to its wire form.
    ///
    /// Fails with [`MapError::CycleDetected`] if the nested-map graph
    /// reaches itself (possible only through path-based sets).
    pub fn serialize(&self) -> Result<Vec<u8>, MapError> {
        let mut out = Vec::with_capacity(64);
        let mut stack = Vec::new();
        write_map(self, &mut out, &mut stack)?;
        Ok(out)
    }

    /// Deserialize a map from `buf`, which must contain exactly one map.
    pub fn deserialize(buf: &[u8]) -> Result<VarMap, MapError> {
        let mut r = Reader { buf, pos: 0 };
        let map = read_map(&mut r)?;
        Ok(map)
    }
}

fn write_map(map: &VarMap, out: &mut Vec<u8>, stack: &mut Vec<*const ()>) -> Result<(), MapError> {
    let ptr = map.shared_ptr();
    if stack.contains(&ptr) {
        return Err(MapError::CycleDetected);
    }
    stack.push(ptr);

    out.extend_from_slice(&MAP_MAGIC);
    out.push(MAP_VERSION);
    out.push(map.flags_byte());

    for (key, value) in map.snapshot_entries() {
        out.extend_from_slice(&(key.len() as u16).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.push(value.tag().as_u8());
        write_value(&value, out, stack)?;
    }

    out.extend_from_slice(&MAP_FOOTER);
    stack.pop();
    Ok(())
}

fn write_value(value: &Value, out: &mut Vec<u8>, stack: &mut Vec<*const ()>) -> Result<(), MapError> {
    match value {
        Value::Unspecified => {}
        Value::Str(s) => {
            out.extend_from_slice(&(s.len() as u16).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.extend_from_slice(&(b.len() as u16).to_le_bytes());
            out.extend_from_slice(b);
        }
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::U8(n) => out.push(*n),
        Value::I16(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::U16(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::I32(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::U32(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::I64(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::U64(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::F32(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::F64(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::Decimal(d) => out.extend_from_slice(d.as_bytes()),
        Value::Guid(g) => out.extend_from_slice(g.as_bytes()),
        Value::Map(m) => write_map(m, out, stack)?,
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MapError> {
        if self.pos + n > self.buf.len() {
            return Err(MapError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MapError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, MapError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn peek2(&self) -> Option<[u8; 2]> {
        if self.pos + 2 > self.buf.len() {
            return None;
        }
        Some([self.buf[self.pos], self.buf[self.pos + 1]])
    }
}

fn read_map(r: &mut Reader<'_>) -> Result<VarMap, MapError> {
    if r.take(2)? != MAP_MAGIC {
        return Err(MapError::Malformed("bad header magic"));
    }
    if r.u8()? != MAP_VERSION {
        return Err(MapError::Malformed("unsupported version"));
    }
    let flag_bits = r.u8()?;
    let flags = crate::MapFlags::from_bits_truncate(flag_bits);

    // Build unlocked; latch read-only after the entries are in.
    let map = VarMap::with_flags(flags & !crate::MapFlags::READ_ONLY);

    loop {
        match r.peek2() {
            Some(two) if two == MAP_FOOTER => {
                r.take(2)?;
                break;
            }
            Some(_) => {}
            None => return Err(MapError::Truncated),
        }

        let key_len = r.u16_le()? as usize;
        if key_len > MAX_KEY_LEN {
            return Err(MapError::Malformed("key length exceeds limit"));
        }
        let key = std::str::from_utf8(r.take(key_len)?)
            .map_err(|_| MapError::Malformed("key is not UTF-8"))?
            .to_owned();
        if key.contains('\0') {
            return Err(MapError::Malformed("key contains NUL"));
        }

        let tag = ValueTag::from_u8(r.u8()?).ok_or(MapError::Malformed("unknown value tag"))?;
        let value = read_value(tag, r)?;
        map.set_unchecked(&key, value)
            .map_err(|_| MapError::Malformed("entry rejected"))?;
    }

    if flags.contains(crate::MapFlags::READ_ONLY) {
        map.lock();
    }
    Ok(map)
}

fn read_value(tag: ValueTag, r: &mut Reader<'_>) -> Result<Value, MapError> {
    Ok(match tag {
        ValueTag::Unspecified => Value::Unspecified,
        ValueTag::Str => {
            let len = r.u16_le()? as usize;
            if len > MAX_VALUE_LEN {
                return Err(MapError::Malformed("string length exceeds limit"));
            }
            let s = std::str::from_utf8(r.take(len)?)
                .map_err(|_| MapError::Malformed("string is not UTF-8"))?;
            Value::Str(s.to_owned())
        }
        ValueTag::Bytes => {
            let len = r.u16_le()? as usize;
            if len > MAX_VALUE_LEN {
                return Err(MapError::Malformed("byte array length exceeds limit"));
            }
            Value::Bytes(r.take(len)?.to_vec())
        }
        ValueTag::Bool => match r.u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => return Err(MapError::Malformed("bool out of range")),
        },
        ValueTag::U8 => Value::U8(r.u8()?),
        ValueTag::I16 => Value::I16(i16::from_le_bytes(r.take(2)?.try_into().expect("2 bytes"))),
        ValueTag::U16 => Value::U16(r.u16_le()?),
        ValueTag::I32 => Value::I32(i32::from_le_bytes(r.take(4)?.try_into().expect("4 bytes"))),
        ValueTag::U32 => Value::U32(u32::from_le_bytes(r.take(4)?.try_into().expect("4 bytes"))),
        ValueTag::I64 => Value::I64(i64::from_le_bytes(r.take(8)?.try_into().expect("8 bytes"))),
        ValueTag::U64 => Value::U64(u64::from_le_bytes(r.take(8)?.try_into().expect("8 bytes"))),
        ValueTag::F32 => Value::F32(f32::from_le_bytes(r.take(4)?.try_into().expect("4 bytes"))),
        ValueTag::F64 => Value::F64(f64::from_le_bytes(r.take(8)?.try_into().expect("8 bytes"))),
        ValueTag::Decimal => Value::Decimal(Decimal128::from_bytes(
            r.take(16)?.try_into().expect("16 bytes"),
        )),
        ValueTag::Guid => Value::Guid(Uuid::from_bytes(
            r.take(16)?.try_into().expect("16 bytes"),
        )),
        ValueTag::Map => Value::Map(read_map(r)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MapFlags;

    #[test]
    fn known_bytes_for_two_entries() {
        let m = VarMap::new();
        m.set("n", -456789i32).unwrap();
        m.set("s", "hello").unwrap();

        let bytes = m.serialize().unwrap();
        let mut expected = vec![0xFE, 0xEF, 0x01, 0x00];
        expected.extend_from_slice(&[0x01, 0x00, b'n', 0x07, 0xAB, 0x07, 0xF9, 0xFF]);
        expected.extend_from_slice(&[0x01, 0x00, b's', 0x01, 0x05, 0x00]);
        expected.extend_from_slice(b"hello");
        expected.extend_from_slice(&[0xEF, 0xFE]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn empty_map_is_header_plus_footer() {
        let bytes = VarMap::new().serialize().unwrap();
        assert_eq!(bytes, vec![0xFE, 0xEF, 0x01, 0x00, 0xEF, 0xFE]);
    }

    #[test]
    fn roundtrip_all_value_kinds() {
        let nested = VarMap::new();
        nested.set("inner", "deep").unwrap();

        let m = VarMap::new();
        m.set("unspec", Value::Unspecified).unwrap();
        m.set("str", "text").unwrap();
        m.set("bool", true).unwrap();
        m.set("bytes", vec![1u8, 2, 3]).unwrap();
        m.set("u8", 200u8).unwrap();
        m.set("i16", -300i16).unwrap();
        m.set("u16", 60000u16).unwrap();
        m.set("i32", -70000i32).unwrap();
        m.set("u32", 3_000_000_000u32).unwrap();
        m.set("i64", i64::MIN).unwrap();
        m.set("u64", u64::MAX).unwrap();
        m.set("f32", 1.5f32).unwrap();
        m.set("f64", -2.25f64).unwrap();
        m.set("dec", Decimal128::from_bytes([7u8; 16])).unwrap();
        m.set("guid", Uuid::new_v4()).unwrap();
        m.set("map", nested).unwrap();

        let decoded = VarMap::deserialize(&m.serialize().unwrap()).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn roundtrip_preserves_flags() {
        let m = VarMap::with_flags(MapFlags::CASE_INSENSITIVE | MapFlags::CONCURRENT);
        m.set("K", 1u8).unwrap();
        m.lock();

        let bytes = m.serialize().unwrap();
        assert_eq!(bytes[3], 0b0000_0111);

        let decoded = VarMap::deserialize(&bytes).unwrap();
        assert!(decoded.is_case_insensitive());
        assert!(decoded.is_read_only());
        assert_eq!(decoded.get::<u8>("k"), Some(1));
    }

    #[test]
    fn deserialize_rejects_bad_magic() {
        assert_eq!(
            VarMap::deserialize(&[0xFE, 0xEE, 0x01, 0x00, 0xEF, 0xFE]),
            Err(MapError::Malformed("bad header magic"))
        );
    }

    #[test]
    fn deserialize_rejects_bad_version() {
        assert_eq!(
            VarMap::deserialize(&[0xFE, 0xEF, 0x02, 0x00, 0xEF, 0xFE]),
            Err(MapError::Malformed("unsupported version"))
        );
    }

    #[test]
    fn deserialize_rejects_unknown_tag() {
        let mut bytes = vec![0xFE, 0xEF, 0x01, 0x00];
        bytes.extend_from_slice(&[0x01, 0x00, b'x', 0xFF]);
        bytes.extend_from_slice(&[0xEF, 0xFE]);
        assert_eq!(
            VarMap::deserialize(&bytes),
            Err(MapError::Malformed("unknown value tag"))
        );
    }

    #[test]
    fn deserialize_truncated_input() {
        let m = VarMap::new();
        m.set("key", "value").unwrap();
        let bytes = m.serialize().unwrap();
        for cut in 1..bytes.len() {
            let err = VarMap::deserialize(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, MapError::Truncated | MapError::Malformed(_)),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn deserialize_rejects_oversize_lengths() {
        // Key length over the limit is malformed, not a bounds error.
        let mut bytes = vec![0xFE, 0xEF, 0x01, 0x00];
        bytes.extend_from_slice(&(200u16).to_le_bytes());
        bytes.extend_from_slice(&[b'a'; 200]);
        bytes.push(0x04);
        bytes.push(0);
        bytes.extend_from_slice(&[0xEF, 0xFE]);
        assert_eq!(
            VarMap::deserialize(&bytes),
            Err(MapError::Malformed("key length exceeds limit"))
        );
    }

    #[test]
    fn serialize_refuses_cycle_from_path_set() {
        let a = VarMap::new();
        let b = VarMap::new();
        a.set("b", b.clone()).unwrap();
        b.set_path("back", a.clone()).unwrap();
        assert_eq!(a.serialize(), Err(MapError::CycleDetected));
        assert_eq!(b.serialize(), Err(MapError::CycleDetected));
    }

    #[test]
    fn shared_submap_serializes_twice_without_error() {
        let shared = VarMap::new();
        shared.set("v", 9u8).unwrap();
        let root = VarMap::new();
        root.set("left", shared.clone()).unwrap();
        root.set("right", shared).unwrap();

        let decoded = VarMap::deserialize(&root.serialize().unwrap()).unwrap();
        assert_eq!(decoded.get_path::<u8>("left.v"), Some(9));
        assert_eq!(decoded.get_path::<u8>("right.v"), Some(9));
    }

    #[test]
    fn nested_map_roundtrip_three_levels() {
        let m = VarMap::new();
        m.set_path("a.b.c", "bottom").unwrap();
        let decoded = VarMap::deserialize(&m.serialize().unwrap()).unwrap();
        assert_eq!(decoded.get_path::<String>("a.b.c"), Some("bottom".into()));
    }
}
