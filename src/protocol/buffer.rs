//! Tagged value codec
//!
//! A [`WireBuffer`] holds one frame. Positions 0 and 1 carry the protocol
//! version and opcode, positions 2..6 carry the payload length (filled in by
//! [`WireBuffer::flush`]), and everything after that is a sequence of
//! self-describing values, each preceded by a one byte [`ValueKind`] tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use super::{PacketType, HEADER_SIZE};

const INITIAL_CAPACITY: usize = 16;
const GROWTH_FACTOR: usize = 2;

/// Nesting limit for arrays and maps read off the wire
const MAX_DEPTH: usize = 64;

/// Codec errors
///
/// Every variant is fatal to the frame being decoded.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Expected {expected} at position {position}, got tag {found} instead")]
    TagMismatch {
        expected: ValueKind,
        found: u8,
        position: usize,
    },

    #[error("Cannot decode unknown value tag {tag} at position {position}")]
    UnknownTag { tag: u8, position: usize },

    #[error("Truncated value at position {position}: needed {needed} bytes, {available} available")]
    Truncated {
        needed: usize,
        position: usize,
        available: usize,
    },

    #[error("Negative length {length} at position {position}")]
    NegativeLength { length: i32, position: usize },

    #[error("Length {0} does not fit a signed 32-bit prefix")]
    LengthOverflow(usize),

    #[error("Values nested too deeply at position {0}")]
    TooDeep(usize),

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Cursor expected at position {expected}, is at {found} instead")]
    Position { expected: usize, found: usize },

    #[error("Field `{field}` of {packet_type} expects {expected}, got {found}")]
    FieldMismatch {
        packet_type: PacketType,
        field: &'static str,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("{count} trailing bytes after the last field of {packet_type}")]
    TrailingBytes { count: usize, packet_type: PacketType },

    #[error("Opcode {0} is reserved for built-in packets")]
    ReservedOpcode(u8),
}

/// Wire kind of a tagged value. The discriminant is the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Bool = 0,
    UInt = 1,
    Int = 2,
    ULong = 3,
    Long = 4,
    Char = 5,
    Double = 6,
    Array = 7,
    Str = 8,
    Nil = 9,
    Map = 10,
}

impl ValueKind {
    /// The tag byte written before values of this kind
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            0 => ValueKind::Bool,
            1 => ValueKind::UInt,
            2 => ValueKind::Int,
            3 => ValueKind::ULong,
            4 => ValueKind::Long,
            5 => ValueKind::Char,
            6 => ValueKind::Double,
            7 => ValueKind::Array,
            8 => ValueKind::Str,
            9 => ValueKind::Nil,
            10 => ValueKind::Map,
            _ => return None,
        };
        Some(kind)
    }

    /// The kind actually written when a field prefers unsigned encoding
    pub fn unsigned(self) -> Self {
        match self {
            ValueKind::Int => ValueKind::UInt,
            ValueKind::Long => ValueKind::ULong,
            other => other,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::UInt => "uint32",
            ValueKind::Int => "int32",
            ValueKind::ULong => "uint64",
            ValueKind::Long => "int64",
            ValueKind::Char => "char16",
            ValueKind::Double => "float64",
            ValueKind::Array => "array",
            ValueKind::Str => "string",
            ValueKind::Nil => "nil",
            ValueKind::Map => "map",
        };
        write!(f, "{} ({})", name, self.tag())
    }
}

/// A decoded (or to-be-encoded) wire value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    UInt(u32),
    Int(i32),
    ULong(u64),
    Long(i64),
    /// UTF-16 code unit
    Char(u16),
    Double(f64),
    Array(Vec<Value>),
    Str(String),
    Nil,
    /// Entries in wire order; keys may be any value kind
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::UInt(_) => ValueKind::UInt,
            Value::Int(_) => ValueKind::Int,
            Value::ULong(_) => ValueKind::ULong,
            Value::Long(_) => ValueKind::Long,
            Value::Char(_) => ValueKind::Char,
            Value::Double(_) => ValueKind::Double,
            Value::Array(_) => ValueKind::Array,
            Value::Str(_) => ValueKind::Str,
            Value::Nil => ValueKind::Nil,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of any of the four integer kinds
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::UInt(v) => Some(i64::from(v)),
            Value::Int(v) => Some(i64::from(v)),
            Value::ULong(v) => Some(v as i64),
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    /// Look up a map entry by string key
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::ULong(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

/// Growable frame buffer with a single read/write cursor
#[derive(Debug, Clone)]
pub struct WireBuffer {
    data: BytesMut,
    cursor: usize,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(INITIAL_CAPACITY),
            cursor: 0,
        }
    }

    /// Copy a received frame for decoding, cursor at the start
    pub fn from_frame(frame: impl AsRef<[u8]>) -> Self {
        Self::from(BytesMut::from(frame.as_ref()))
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Number of bytes held
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Move the cursor back to the start without discarding content
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Discard all content, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }

    /// Whether tagged values remain after the cursor
    pub fn has_remaining(&self) -> bool {
        self.cursor.max(HEADER_SIZE) < self.data.len()
    }

    /// Bytes remaining after the cursor (metadata excluded)
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.cursor.max(HEADER_SIZE))
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        let capacity = self.data.capacity();
        if needed <= capacity {
            return;
        }
        let mut target = capacity.max(INITIAL_CAPACITY);
        while target < needed {
            target *= GROWTH_FACTOR;
        }
        self.data.reserve(target - self.data.len());
    }

    /// Drop everything after the cursor and make room for `additional`
    /// bytes. Writing past the opcode first pads out the length bytes, which
    /// are filled in by flush().
    fn prepare_write(&mut self, additional: usize) {
        if self.cursor > 1 && self.cursor < HEADER_SIZE {
            self.data.truncate(self.cursor);
            self.ensure_capacity(HEADER_SIZE - self.cursor);
            self.data.resize(HEADER_SIZE, 0);
            self.cursor = HEADER_SIZE;
        }
        self.data.truncate(self.cursor);
        self.ensure_capacity(additional);
    }

    fn write(&mut self, additional: usize, f: impl FnOnce(&mut BytesMut)) -> &mut Self {
        self.prepare_write(additional);
        f(&mut self.data);
        self.cursor = self.data.len();
        self
    }

    fn write_tagged(
        &mut self,
        kind: ValueKind,
        width: usize,
        f: impl FnOnce(&mut BytesMut),
    ) -> &mut Self {
        self.write(1 + width, |data| {
            data.put_u8(kind.tag());
            f(data);
        })
    }

    fn assert_position(&self, expected: usize) -> Result<(), CodecError> {
        if self.cursor != expected {
            return Err(CodecError::Position {
                expected,
                found: self.cursor,
            });
        }
        Ok(())
    }

    /// Write the protocol version. The cursor must be at position 0.
    pub fn put_version(&mut self, version: u8) -> Result<&mut Self, CodecError> {
        self.assert_position(0)?;
        Ok(self.write(1, |data| data.put_u8(version)))
    }

    /// Write the opcode. The cursor must be at position 1.
    pub fn put_opcode(&mut self, opcode: u8) -> Result<&mut Self, CodecError> {
        self.assert_position(1)?;
        Ok(self.write(1, |data| data.put_u8(opcode)))
    }

    pub fn version(&self) -> Option<u8> {
        self.data.first().copied()
    }

    pub fn opcode(&self) -> Option<u8> {
        self.data.get(1).copied()
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.write_tagged(ValueKind::Bool, 1, |data| data.put_u8(u8::from(value)))
    }

    pub fn put_uint(&mut self, value: u32) -> &mut Self {
        self.write_tagged(ValueKind::UInt, 4, |data| data.put_u32(value))
    }

    pub fn put_int(&mut self, value: i32) -> &mut Self {
        self.write_tagged(ValueKind::Int, 4, |data| data.put_i32(value))
    }

    pub fn put_ulong(&mut self, value: u64) -> &mut Self {
        self.write_tagged(ValueKind::ULong, 8, |data| data.put_u64(value))
    }

    pub fn put_long(&mut self, value: i64) -> &mut Self {
        self.write_tagged(ValueKind::Long, 8, |data| data.put_i64(value))
    }

    /// Chars travel as a 4-byte integer holding the UTF-16 code unit
    pub fn put_char(&mut self, value: u16) -> &mut Self {
        self.write_tagged(ValueKind::Char, 4, |data| data.put_i32(i32::from(value)))
    }

    pub fn put_double(&mut self, value: f64) -> &mut Self {
        self.write_tagged(ValueKind::Double, 8, |data| data.put_f64(value))
    }

    pub fn put_nil(&mut self) -> &mut Self {
        self.write_tagged(ValueKind::Nil, 0, |_| {})
    }

    fn put_length(&mut self, kind: ValueKind, len: usize) -> Result<&mut Self, CodecError> {
        let len = i32::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
        Ok(self.write_tagged(kind, 4, |data| data.put_i32(len)))
    }

    pub fn put_str(&mut self, value: &str) -> Result<&mut Self, CodecError> {
        self.put_length(ValueKind::Str, value.len())?;
        Ok(self.write(value.len(), |data| data.put_slice(value.as_bytes())))
    }

    pub fn put_array(&mut self, values: &[Value]) -> Result<&mut Self, CodecError> {
        self.put_length(ValueKind::Array, values.len())?;
        for value in values {
            self.put(value, false)?;
        }
        Ok(self)
    }

    pub fn put_map(&mut self, entries: &[(Value, Value)]) -> Result<&mut Self, CodecError> {
        self.put_length(ValueKind::Map, entries.len())?;
        for (key, value) in entries {
            self.put(key, false)?;
            self.put(value, false)?;
        }
        Ok(self)
    }

    /// Write any value, dispatching on its kind.
    ///
    /// With `prefer_unsigned`, signed integers are written with the unsigned
    /// tag of the same width (two's complement bits unchanged).
    pub fn put(&mut self, value: &Value, prefer_unsigned: bool) -> Result<&mut Self, CodecError> {
        match value {
            Value::Bool(v) => self.put_bool(*v),
            Value::UInt(v) => self.put_uint(*v),
            Value::Int(v) if prefer_unsigned => self.put_uint(*v as u32),
            Value::Int(v) => self.put_int(*v),
            Value::ULong(v) => self.put_ulong(*v),
            Value::Long(v) if prefer_unsigned => self.put_ulong(*v as u64),
            Value::Long(v) => self.put_long(*v),
            Value::Char(v) => self.put_char(*v),
            Value::Double(v) => self.put_double(*v),
            Value::Array(values) => self.put_array(values)?,
            Value::Str(s) => self.put_str(s)?,
            Value::Nil => self.put_nil(),
            Value::Map(entries) => self.put_map(entries)?,
        };
        Ok(self)
    }

    fn skip_meta(&mut self) {
        if self.cursor < HEADER_SIZE {
            self.cursor = HEADER_SIZE;
        }
    }

    /// Read `width` bytes at the cursor through `f`, then advance past them
    fn read<T>(&mut self, width: usize, f: impl FnOnce(&mut &[u8]) -> T) -> Result<T, CodecError> {
        let available = self.data.len().saturating_sub(self.cursor);
        if width > available {
            return Err(CodecError::Truncated {
                needed: width,
                position: self.cursor,
                available,
            });
        }
        let mut src = &self.data[self.cursor..self.cursor + width];
        let value = f(&mut src);
        self.cursor += width;
        Ok(value)
    }

    fn expect_tag(&mut self, expected: ValueKind) -> Result<(), CodecError> {
        self.skip_meta();
        let position = self.cursor;
        let found = self.read(1, |src| src.get_u8())?;
        if found != expected.tag() {
            return Err(CodecError::TagMismatch {
                expected,
                found,
                position,
            });
        }
        Ok(())
    }

    fn get_length(&mut self, kind: ValueKind) -> Result<usize, CodecError> {
        self.expect_tag(kind)?;
        let position = self.cursor;
        let length = self.read(4, |src| src.get_i32())?;
        usize::try_from(length).map_err(|_| CodecError::NegativeLength { length, position })
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        self.expect_tag(ValueKind::Bool)?;
        self.read(1, |src| src.get_u8() != 0)
    }

    pub fn get_uint(&mut self) -> Result<u32, CodecError> {
        self.expect_tag(ValueKind::UInt)?;
        self.read(4, |src| src.get_u32())
    }

    pub fn get_int(&mut self) -> Result<i32, CodecError> {
        self.expect_tag(ValueKind::Int)?;
        self.read(4, |src| src.get_i32())
    }

    pub fn get_ulong(&mut self) -> Result<u64, CodecError> {
        self.expect_tag(ValueKind::ULong)?;
        self.read(8, |src| src.get_u64())
    }

    pub fn get_long(&mut self) -> Result<i64, CodecError> {
        self.expect_tag(ValueKind::Long)?;
        self.read(8, |src| src.get_i64())
    }

    pub fn get_char(&mut self) -> Result<u16, CodecError> {
        self.expect_tag(ValueKind::Char)?;
        self.read(4, |src| src.get_i32() as u16)
    }

    pub fn get_double(&mut self) -> Result<f64, CodecError> {
        self.expect_tag(ValueKind::Double)?;
        self.read(8, |src| src.get_f64())
    }

    pub fn get_nil(&mut self) -> Result<(), CodecError> {
        self.expect_tag(ValueKind::Nil)
    }

    pub fn get_str(&mut self) -> Result<String, CodecError> {
        let len = self.get_length(ValueKind::Str)?;
        let bytes = self.read(len, |src| src.to_vec())?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn get_array(&mut self) -> Result<Vec<Value>, CodecError> {
        self.get_array_at(0)
    }

    pub fn get_map(&mut self) -> Result<Vec<(Value, Value)>, CodecError> {
        self.get_map_at(0)
    }

    /// Kind of the next value, without consuming it
    pub fn peek_kind(&mut self) -> Result<ValueKind, CodecError> {
        self.skip_meta();
        let position = self.cursor;
        let tag = *self.data.get(position).ok_or(CodecError::Truncated {
            needed: 1,
            position,
            available: 0,
        })?;
        ValueKind::from_tag(tag).ok_or(CodecError::UnknownTag { tag, position })
    }

    /// Read the next value, whatever its kind
    pub fn get_next(&mut self) -> Result<Value, CodecError> {
        self.get_next_at(0)
    }

    fn get_next_at(&mut self, depth: usize) -> Result<Value, CodecError> {
        let value = match self.peek_kind()? {
            ValueKind::Bool => Value::Bool(self.get_bool()?),
            ValueKind::UInt => Value::UInt(self.get_uint()?),
            ValueKind::Int => Value::Int(self.get_int()?),
            ValueKind::ULong => Value::ULong(self.get_ulong()?),
            ValueKind::Long => Value::Long(self.get_long()?),
            ValueKind::Char => Value::Char(self.get_char()?),
            ValueKind::Double => Value::Double(self.get_double()?),
            ValueKind::Array => Value::Array(self.get_array_at(depth)?),
            ValueKind::Str => Value::Str(self.get_str()?),
            ValueKind::Nil => {
                self.get_nil()?;
                Value::Nil
            }
            ValueKind::Map => Value::Map(self.get_map_at(depth)?),
        };
        Ok(value)
    }

    fn check_depth(&self, depth: usize) -> Result<(), CodecError> {
        if depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep(self.cursor));
        }
        Ok(())
    }

    fn get_array_at(&mut self, depth: usize) -> Result<Vec<Value>, CodecError> {
        self.check_depth(depth)?;
        let len = self.get_length(ValueKind::Array)?;
        // Every element takes at least one byte
        let mut values = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            values.push(self.get_next_at(depth + 1)?);
        }
        Ok(values)
    }

    fn get_map_at(&mut self, depth: usize) -> Result<Vec<(Value, Value)>, CodecError> {
        self.check_depth(depth)?;
        let len = self.get_length(ValueKind::Map)?;
        let mut entries = Vec::with_capacity(len.min(self.remaining() / 2));
        for _ in 0..len {
            let key = self.get_next_at(depth + 1)?;
            let value = self.get_next_at(depth + 1)?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Finalize the frame: write the payload length (bytes after the
    /// header), split off everything up to the cursor and reset the buffer
    /// for reuse.
    pub fn flush(&mut self) -> Result<Bytes, CodecError> {
        if self.cursor < HEADER_SIZE {
            self.data.truncate(self.cursor);
            self.ensure_capacity(HEADER_SIZE - self.cursor);
            self.data.resize(HEADER_SIZE, 0);
            self.cursor = HEADER_SIZE;
        }
        let payload = self.cursor - HEADER_SIZE;
        let length = i32::try_from(payload).map_err(|_| CodecError::LengthOverflow(payload))?;
        (&mut self.data[2..HEADER_SIZE]).put_i32(length);

        let frame = self.data.split_to(self.cursor).freeze();
        self.clear();
        Ok(frame)
    }
}

impl From<BytesMut> for WireBuffer {
    /// Take ownership of a received frame, cursor at the start
    fn from(data: BytesMut) -> Self {
        Self { data, cursor: 0 }
    }
}

impl Default for WireBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_buffer() -> WireBuffer {
        let mut buf = WireBuffer::new();
        buf.put_version(1).unwrap();
        buf.put_opcode(0).unwrap();
        buf
    }

    #[test]
    fn test_bool() {
        let mut buf = new_buffer();
        buf.put_bool(false).put_bool(true);
        buf.reset();
        assert!(!buf.get_bool().unwrap());
        assert!(buf.get_bool().unwrap());
    }

    #[test]
    fn test_integer_boundaries() {
        let mut buf = new_buffer();
        buf.put_uint(0)
            .put_uint(u32::MAX)
            .put_int(-1)
            .put_int(i32::MIN)
            .put_ulong(u64::MAX)
            .put_long(i64::MAX)
            .put_long(-1);
        buf.reset();
        assert_eq!(buf.get_uint().unwrap(), 0);
        assert_eq!(buf.get_uint().unwrap(), u32::MAX);
        assert_eq!(buf.get_int().unwrap(), -1);
        assert_eq!(buf.get_int().unwrap(), i32::MIN);
        assert_eq!(buf.get_ulong().unwrap(), u64::MAX);
        assert_eq!(buf.get_long().unwrap(), i64::MAX);
        assert_eq!(buf.get_long().unwrap(), -1);
    }

    #[test]
    fn test_char_and_double() {
        let mut buf = new_buffer();
        buf.put_char(u16::from(b'a')).put_char(0xFFFF).put_double(1.23456);
        buf.reset();
        assert_eq!(buf.get_char().unwrap(), u16::from(b'a'));
        assert_eq!(buf.get_char().unwrap(), 0xFFFF);
        assert!((buf.get_double().unwrap() - 1.23456).abs() < 1e-9);
    }

    #[test]
    fn test_arrays_keep_order_and_kind() {
        let ints: Vec<Value> = vec![1, 2, 3, 4].into_iter().map(Value::Int).collect();
        let strs = vec![Value::from("hello"), Value::from("world")];

        let mut buf = new_buffer();
        buf.put_array(&ints).unwrap().put_array(&strs).unwrap();
        buf.reset();

        assert_eq!(buf.get_array().unwrap(), ints);
        assert_eq!(buf.get_array().unwrap(), strs);
    }

    #[test]
    fn test_string_and_nil() {
        let mut buf = new_buffer();
        buf.put_str("hi").unwrap().put_nil().put_str("héllo ✓").unwrap();
        buf.reset();
        assert_eq!(buf.get_str().unwrap(), "hi");
        buf.get_nil().unwrap();
        assert_eq!(buf.get_str().unwrap(), "héllo ✓");
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_map() {
        let entries = vec![(Value::from("Hello"), Value::from("World"))];
        let mut buf = new_buffer();
        buf.put_map(&entries).unwrap();
        buf.reset();

        let map = Value::Map(buf.get_map().unwrap());
        assert_eq!(map.get("Hello"), Some(&Value::from("World")));
        assert_eq!(map, Value::Map(entries));
    }

    #[test]
    fn test_parse_flushed_frame() {
        let mut buf = new_buffer();
        buf.put(&Value::from("Hello World"), false).unwrap();
        let frame = buf.flush().unwrap();

        let mut parsed = WireBuffer::from_frame(frame.to_vec());
        assert_eq!(parsed.get_str().unwrap(), "Hello World");
    }

    #[test]
    fn test_type_mismatch() {
        let mut buf = new_buffer();
        buf.put_str("hi").unwrap();
        buf.reset();

        match buf.get_int() {
            Err(CodecError::TagMismatch {
                expected,
                found,
                position,
            }) => {
                assert_eq!(expected, ValueKind::Int);
                assert_eq!(found, ValueKind::Str.tag());
                assert_eq!(position, HEADER_SIZE);
            }
            other => panic!("expected tag mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_prefer_unsigned() {
        let mut buf = new_buffer();
        buf.put(&Value::Long(-1), true).unwrap();
        buf.put(&Value::Int(7), true).unwrap();
        buf.reset();
        assert_eq!(buf.get_next().unwrap(), Value::ULong(u64::MAX));
        assert_eq!(buf.get_next().unwrap(), Value::UInt(7));
    }

    #[test]
    fn test_flush_writes_payload_length() {
        let mut buf = new_buffer();
        buf.put_int(5);
        let frame = buf.flush().unwrap();

        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(&frame[..HEADER_SIZE], &[1, 0, 0, 0, 0, 5]);
        assert_eq!(buf.position(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_flush_zero_field_frame_keeps_full_header() {
        let frame = new_buffer().flush().unwrap();
        assert_eq!(&frame[..], &[1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_nil_is_a_single_byte() {
        let mut buf = new_buffer();
        buf.put_nil().put_bool(true);
        let frame = buf.flush().unwrap();
        assert_eq!(&frame[HEADER_SIZE..], &[9, 0, 1]);
    }

    #[test]
    fn test_buffer_grows_by_doubling() {
        let mut buf = new_buffer();
        let start = buf.capacity();
        for i in 0..64 {
            buf.put_long(i);
        }
        assert!(buf.capacity() >= HEADER_SIZE + 64 * 9);
        assert!(buf.capacity() >= start * 2);

        buf.reset();
        for i in 0..64 {
            assert_eq!(buf.get_long().unwrap(), i);
        }
    }

    #[test]
    fn test_header_positions_are_enforced() {
        let mut buf = WireBuffer::new();
        assert!(matches!(
            buf.put_opcode(3),
            Err(CodecError::Position { expected: 1, found: 0 })
        ));
        buf.put_version(1).unwrap();
        assert!(buf.put_version(1).is_err());
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = WireBuffer::from_frame(vec![1, 0, 0, 0, 0, 1, 42]);
        assert!(matches!(
            buf.get_next(),
            Err(CodecError::UnknownTag { tag: 42, position: 6 })
        ));
    }

    #[test]
    fn test_truncated_string() {
        // String claims 10 bytes, only 2 follow
        let mut buf = WireBuffer::from_frame(vec![1, 0, 0, 0, 0, 7, 8, 0, 0, 0, 10, b'h', b'i']);
        assert!(matches!(buf.get_str(), Err(CodecError::Truncated { needed: 10, .. })));
    }

    #[test]
    fn test_negative_array_length() {
        let mut frame = vec![1, 0, 0, 0, 0, 5, 7];
        frame.extend_from_slice(&(-3i32).to_be_bytes());
        let mut buf = WireBuffer::from_frame(frame);
        assert!(matches!(
            buf.get_array(),
            Err(CodecError::NegativeLength { length: -3, .. })
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut frame = vec![1, 0, 0, 0, 0, 0];
        for _ in 0..=MAX_DEPTH {
            frame.push(ValueKind::Array.tag());
            frame.extend_from_slice(&1i32.to_be_bytes());
        }
        frame.push(ValueKind::Nil.tag());
        let mut buf = WireBuffer::from_frame(frame);
        assert!(matches!(buf.get_next(), Err(CodecError::TooDeep(_))));
    }
}
