//! AMQP 0-9-1 primitive types: strings, decimals, field values, field tables
//!
//! Field value tags follow the 0-9-1 errata table, which is what RabbitMQ
//! and every interoperating client speak on the wire.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Error;

/// A string of at most 255 bytes, length-prefixed with a single octet
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortString(String);

impl ShortString {
    /// View the string as a `&str`
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner `String`
    pub fn into_string(self) -> String {
        self.0
    }

    /// Byte length of the string
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the string is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.0.len() as u8);
        dst.put_slice(self.0.as_bytes());
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 1)?;
        let len = src.get_u8() as usize;
        ensure(src, len)?;
        let raw = src.split_to(len);
        let s = String::from_utf8(raw.to_vec())?;
        Ok(Self(s))
    }
}

impl TryFrom<String> for ShortString {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() > 255 {
            return Err(Error::ShortStringTooLong(value.len()));
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for ShortString {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl fmt::Display for ShortString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ShortString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A byte string length-prefixed with a `u32`
///
/// Long strings carry arbitrary octets on the wire. SASL responses in
/// particular embed NUL separators.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LongString(Vec<u8>);

impl LongString {
    /// View the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the inner bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Lossy UTF-8 view, for strings known to be textual
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.0.len() as u32);
        dst.put_slice(&self.0);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 4)?;
        let len = src.get_u32() as usize;
        ensure(src, len)?;
        Ok(Self(src.split_to(len).to_vec()))
    }
}

impl From<Vec<u8>> for LongString {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<String> for LongString {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&str> for LongString {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// Fixed-point decimal: `mantissa / 10^scale`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    /// Number of decimal digits after the point
    pub scale: u8,
    /// Signed mantissa
    pub mantissa: i32,
}

/// POSIX timestamp in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(
    /// Seconds since the Unix epoch
    pub u64,
);

/// A sequence of field values, length-prefixed in bytes
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FieldArray(
    /// The values, in wire order
    pub Vec<FieldValue>,
);

/// A tagged field table value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t` — boolean
    Bool(bool),
    /// `b` — signed octet
    I8(i8),
    /// `B` — unsigned octet
    U8(u8),
    /// `U` — signed short
    I16(i16),
    /// `u` — unsigned short
    U16(u16),
    /// `I` — signed long
    I32(i32),
    /// `i` — unsigned long
    U32(u32),
    /// `L` — signed long long
    I64(i64),
    /// `l` — unsigned long long
    U64(u64),
    /// `f` — single precision float
    F32(f32),
    /// `d` — double precision float
    F64(f64),
    /// `D` — fixed-point decimal
    Decimal(Decimal),
    /// `s` — short string
    ShortString(ShortString),
    /// `S` — long string
    LongString(LongString),
    /// `T` — timestamp
    Timestamp(Timestamp),
    /// `A` — field array
    Array(FieldArray),
    /// `F` — nested field table
    Table(FieldTable),
    /// `V` — no value
    Void,
    /// `x` — byte array
    ByteArray(Vec<u8>),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            Self::Bool(_) => b't',
            Self::I8(_) => b'b',
            Self::U8(_) => b'B',
            Self::I16(_) => b'U',
            Self::U16(_) => b'u',
            Self::I32(_) => b'I',
            Self::U32(_) => b'i',
            Self::I64(_) => b'L',
            Self::U64(_) => b'l',
            Self::F32(_) => b'f',
            Self::F64(_) => b'd',
            Self::Decimal(_) => b'D',
            Self::ShortString(_) => b's',
            Self::LongString(_) => b'S',
            Self::Timestamp(_) => b'T',
            Self::Array(_) => b'A',
            Self::Table(_) => b'F',
            Self::Void => b'V',
            Self::ByteArray(_) => b'x',
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            Self::Bool(v) => dst.put_u8(*v as u8),
            Self::I8(v) => dst.put_i8(*v),
            Self::U8(v) => dst.put_u8(*v),
            Self::I16(v) => dst.put_i16(*v),
            Self::U16(v) => dst.put_u16(*v),
            Self::I32(v) => dst.put_i32(*v),
            Self::U32(v) => dst.put_u32(*v),
            Self::I64(v) => dst.put_i64(*v),
            Self::U64(v) => dst.put_u64(*v),
            Self::F32(v) => dst.put_f32(*v),
            Self::F64(v) => dst.put_f64(*v),
            Self::Decimal(v) => {
                dst.put_u8(v.scale);
                dst.put_i32(v.mantissa);
            }
            Self::ShortString(v) => v.encode(dst),
            Self::LongString(v) => v.encode(dst),
            Self::Timestamp(v) => dst.put_u64(v.0),
            Self::Array(v) => {
                let mut inner = BytesMut::new();
                for item in &v.0 {
                    item.encode(&mut inner);
                }
                dst.put_u32(inner.len() as u32);
                dst.put_slice(&inner);
            }
            Self::Table(v) => v.encode(dst),
            Self::Void => {}
            Self::ByteArray(v) => {
                dst.put_u32(v.len() as u32);
                dst.put_slice(v);
            }
        }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 1)?;
        let tag = src.get_u8();
        let value = match tag {
            b't' => {
                ensure(src, 1)?;
                Self::Bool(src.get_u8() != 0)
            }
            b'b' => {
                ensure(src, 1)?;
                Self::I8(src.get_i8())
            }
            b'B' => {
                ensure(src, 1)?;
                Self::U8(src.get_u8())
            }
            b'U' => {
                ensure(src, 2)?;
                Self::I16(src.get_i16())
            }
            b'u' => {
                ensure(src, 2)?;
                Self::U16(src.get_u16())
            }
            b'I' => {
                ensure(src, 4)?;
                Self::I32(src.get_i32())
            }
            b'i' => {
                ensure(src, 4)?;
                Self::U32(src.get_u32())
            }
            b'L' => {
                ensure(src, 8)?;
                Self::I64(src.get_i64())
            }
            b'l' => {
                ensure(src, 8)?;
                Self::U64(src.get_u64())
            }
            b'f' => {
                ensure(src, 4)?;
                Self::F32(src.get_f32())
            }
            b'd' => {
                ensure(src, 8)?;
                Self::F64(src.get_f64())
            }
            b'D' => {
                ensure(src, 5)?;
                Self::Decimal(Decimal {
                    scale: src.get_u8(),
                    mantissa: src.get_i32(),
                })
            }
            b's' => Self::ShortString(ShortString::decode(src)?),
            b'S' => Self::LongString(LongString::decode(src)?),
            b'T' => {
                ensure(src, 8)?;
                Self::Timestamp(Timestamp(src.get_u64()))
            }
            b'A' => {
                ensure(src, 4)?;
                let len = src.get_u32() as usize;
                ensure(src, len)?;
                let mut inner = src.split_to(len);
                let mut items = Vec::new();
                while inner.has_remaining() {
                    items.push(FieldValue::decode(&mut inner)?);
                }
                Self::Array(FieldArray(items))
            }
            b'F' => Self::Table(FieldTable::decode(src)?),
            b'V' => Self::Void,
            b'x' => {
                ensure(src, 4)?;
                let len = src.get_u32() as usize;
                ensure(src, len)?;
                Self::ByteArray(src.split_to(len).to_vec())
            }
            other => return Err(Error::UnknownFieldTag(other)),
        };
        Ok(value)
    }
}

/// An order-preserving map of short-string keys to field values
///
/// Insertion order is kept through encode and decode. Equality ignores
/// entry order, matching how peers compare tables.
#[derive(Debug, Default, Clone)]
pub struct FieldTable(Vec<(ShortString, FieldValue)>);

impl FieldTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any existing entry with the same key
    pub fn insert(&mut self, key: ShortString, value: FieldValue) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Looks a value up by key
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&ShortString, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let mut inner = BytesMut::new();
        for (key, value) in &self.0 {
            key.encode(&mut inner);
            value.encode(&mut inner);
        }
        dst.put_u32(inner.len() as u32);
        dst.put_slice(&inner);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 4)?;
        let len = src.get_u32() as usize;
        ensure(src, len)?;
        let mut inner = src.split_to(len);
        let mut entries = Vec::new();
        while inner.has_remaining() {
            let key = ShortString::decode(&mut inner)?;
            let value = FieldValue::decode(&mut inner)?;
            entries.push((key, value));
        }
        Ok(Self(entries))
    }
}

impl PartialEq for FieldTable {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .all(|(k, v)| other.get(k.as_str()) == Some(v))
    }
}

impl FromIterator<(ShortString, FieldValue)> for FieldTable {
    fn from_iter<T: IntoIterator<Item = (ShortString, FieldValue)>>(iter: T) -> Self {
        let mut table = Self::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

/// Fails with [`Error::Truncated`] when fewer than `n` bytes remain
pub(crate) fn ensure(src: &Bytes, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Truncated);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: FieldValue) -> FieldValue {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        let mut src = buf.freeze();
        let decoded = FieldValue::decode(&mut src).unwrap();
        assert!(!src.has_remaining());
        decoded
    }

    #[test]
    fn scalar_roundtrips() {
        for value in [
            FieldValue::Bool(true),
            FieldValue::I8(-3),
            FieldValue::U8(200),
            FieldValue::I16(-12345),
            FieldValue::U16(54321),
            FieldValue::I32(-7),
            FieldValue::U32(u32::MAX),
            FieldValue::I64(i64::MIN),
            FieldValue::U64(u64::MAX),
            FieldValue::F32(1.5),
            FieldValue::F64(-2.25),
            FieldValue::Decimal(Decimal {
                scale: 2,
                mantissa: -314,
            }),
            FieldValue::Timestamp(Timestamp(1_700_000_000)),
            FieldValue::Void,
            FieldValue::ByteArray(vec![0, 1, 2, 0xCE]),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn string_roundtrips() {
        let short = FieldValue::ShortString("hello".try_into().unwrap());
        assert_eq!(roundtrip(short.clone()), short);

        let long = FieldValue::LongString(LongString::from("a longer value with \x00 bytes"));
        assert_eq!(roundtrip(long.clone()), long);
    }

    #[test]
    fn short_string_rejects_over_255() {
        let long = "x".repeat(256);
        assert!(matches!(
            ShortString::try_from(long),
            Err(Error::ShortStringTooLong(256))
        ));
    }

    #[test]
    fn nested_table_preserves_order() {
        let mut inner = FieldTable::new();
        inner.insert("z".try_into().unwrap(), FieldValue::I32(1));
        inner.insert("a".try_into().unwrap(), FieldValue::I32(2));

        let mut table = FieldTable::new();
        table.insert("nested".try_into().unwrap(), FieldValue::Table(inner));
        table.insert(
            "list".try_into().unwrap(),
            FieldValue::Array(FieldArray(vec![
                FieldValue::Bool(false),
                FieldValue::LongString("x".into()),
            ])),
        );

        let mut buf = BytesMut::new();
        table.encode(&mut buf);
        let mut src = buf.freeze();
        let decoded = FieldTable::decode(&mut src).unwrap();

        let keys: Vec<_> = decoded.iter().map(|(k, _)| k.as_str().to_owned()).collect();
        assert_eq!(keys, ["nested", "list"]);
        match decoded.get("nested") {
            Some(FieldValue::Table(t)) => {
                let inner_keys: Vec<_> = t.iter().map(|(k, _)| k.as_str().to_owned()).collect();
                assert_eq!(inner_keys, ["z", "a"]);
            }
            other => panic!("expected nested table, got {other:?}"),
        }
    }

    #[test]
    fn table_equality_ignores_order() {
        let mut a = FieldTable::new();
        a.insert("x".try_into().unwrap(), FieldValue::I32(1));
        a.insert("y".try_into().unwrap(), FieldValue::Bool(true));

        let mut b = FieldTable::new();
        b.insert("y".try_into().unwrap(), FieldValue::Bool(true));
        b.insert("x".try_into().unwrap(), FieldValue::I32(1));

        assert_eq!(a, b);

        b.insert("x".try_into().unwrap(), FieldValue::I32(2));
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut src = Bytes::from_static(&[b'Z', 0, 0]);
        assert!(matches!(
            FieldValue::decode(&mut src),
            Err(Error::UnknownFieldTag(b'Z'))
        ));
    }

    #[test]
    fn truncated_value_is_rejected() {
        let mut src = Bytes::from_static(&[b'I', 0, 0]);
        assert!(matches!(
            FieldValue::decode(&mut src),
            Err(Error::Truncated)
        ));
    }
}
