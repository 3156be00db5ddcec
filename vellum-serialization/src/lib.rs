// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Binary serialization framework used across vellum.
//!
//! Every type with an on-wire or on-disk form gets a dedicated serializer and
//! deserializer struct implementing the [`Serializer`] / [`Deserializer`]
//! trait pair. Deserializers carry their validity bounds so that decoding
//! untrusted bytes rejects out-of-range values at the parsing layer.
//!
//! The wire format mixes varints (tags, counts, byte-string lengths) with
//! fixed-width little-endian integers (heights, credits, offsets); both
//! families of primitives live here.

use std::fmt::{Debug, Display};
use std::ops::{Bound, RangeBounds};

use displaydoc::Display;
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_data;
use nom::number::complete::{le_i64, le_u32, le_u64};
use nom::{IResult, Parser};
use thiserror::Error;
use unsigned_varint::nom as varint_nom;

/// Serialization error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum SerializeError {
    /// number {0} is too big to be serialized
    NumberTooBig(String),
    /// general error {0}
    GeneralError(String),
}

/// Error accumulated while deserializing a buffer, usable as the concrete
/// nom error type when calling [`Deserializer::deserialize`].
#[derive(Clone, Error)]
pub struct DeserializeError<'a> {
    trace: Vec<(&'a [u8], String)>,
}

impl<'a> ContextError<&'a [u8]> for DeserializeError<'a> {
    fn add_context(input: &'a [u8], ctx: &'static str, mut other: Self) -> Self {
        other.trace.push((input, ctx.to_string()));
        other
    }
}

impl<'a> ParseError<&'a [u8]> for DeserializeError<'a> {
    fn from_error_kind(input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        Self {
            trace: vec![(input, kind.description().to_string())],
        }
    }
    fn append(input: &'a [u8], kind: nom::error::ErrorKind, mut other: Self) -> Self {
        other.trace.push((input, kind.description().to_string()));
        other
    }
    fn from_char(input: &'a [u8], _: char) -> Self {
        Self::from_error_kind(input, nom::error::ErrorKind::Char)
    }
    fn or(self, other: Self) -> Self {
        other
    }
}

impl<'a> Display for DeserializeError<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (_, ctx) in self.trace.iter().rev() {
            write!(f, "{} / ", ctx)?;
        }
        Ok(())
    }
}

impl<'a> Debug for DeserializeError<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)?;
        if let Some((input, _)) = self.trace.first() {
            write!(f, "input: {:?}", input)?;
        }
        Ok(())
    }
}

/// Serializes a value of type `T` into a byte buffer.
pub trait Serializer<T> {
    /// Append the serialized form of `value` to `buffer`.
    fn serialize(&self, value: &T, buffer: &mut Vec<u8>) -> Result<(), SerializeError>;
}

/// Deserializes a value of type `T` from a byte buffer.
pub trait Deserializer<T> {
    /// Parse one `T` from the front of `buffer`, returning the rest.
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], T, E>;
}

/// Serializer for `u32` in unsigned-varint form.
#[derive(Clone, Default)]
pub struct U32VarIntSerializer;

impl U32VarIntSerializer {
    /// Creates a varint serializer for `u32`.
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<u32> for U32VarIntSerializer {
    fn serialize(&self, value: &u32, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(unsigned_varint::encode::u32(
            *value,
            &mut unsigned_varint::encode::u32_buffer(),
        ));
        Ok(())
    }
}

/// Deserializer for `u32` in unsigned-varint form, bounded to a range.
#[derive(Clone)]
pub struct U32VarIntDeserializer {
    range: (Bound<u32>, Bound<u32>),
}

impl U32VarIntDeserializer {
    /// Creates a varint deserializer for `u32` accepting values in `[min, max]`.
    pub const fn new(min: Bound<u32>, max: Bound<u32>) -> Self {
        Self { range: (min, max) }
    }
}

impl Deserializer<u32> for U32VarIntDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], u32, E> {
        context("Failed u32 varint deserialization", |input: &'a [u8]| {
            let (rest, value) = varint_nom::u32(input).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                ))
            })?;
            if !self.range.contains(&value) {
                return Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                )));
            }
            Ok((rest, value))
        })(buffer)
    }
}

/// Serializer for `u64` in unsigned-varint form.
#[derive(Clone, Default)]
pub struct U64VarIntSerializer;

impl U64VarIntSerializer {
    /// Creates a varint serializer for `u64`.
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<u64> for U64VarIntSerializer {
    fn serialize(&self, value: &u64, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(unsigned_varint::encode::u64(
            *value,
            &mut unsigned_varint::encode::u64_buffer(),
        ));
        Ok(())
    }
}

/// Deserializer for `u64` in unsigned-varint form, bounded to a range.
#[derive(Clone)]
pub struct U64VarIntDeserializer {
    range: (Bound<u64>, Bound<u64>),
}

impl U64VarIntDeserializer {
    /// Creates a varint deserializer for `u64` accepting values in `[min, max]`.
    pub const fn new(min: Bound<u64>, max: Bound<u64>) -> Self {
        Self { range: (min, max) }
    }
}

impl Deserializer<u64> for U64VarIntDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], u64, E> {
        context("Failed u64 varint deserialization", |input: &'a [u8]| {
            let (rest, value) = varint_nom::u64(input).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                ))
            })?;
            if !self.range.contains(&value) {
                return Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                )));
            }
            Ok((rest, value))
        })(buffer)
    }
}

/// Serializer for `u32` as 4 little-endian bytes.
#[derive(Clone, Default)]
pub struct U32LeSerializer;

impl U32LeSerializer {
    /// Creates a little-endian serializer for `u32`.
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<u32> for U32LeSerializer {
    fn serialize(&self, value: &u32, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Deserializer for `u32` from 4 little-endian bytes.
#[derive(Clone, Default)]
pub struct U32LeDeserializer;

impl U32LeDeserializer {
    /// Creates a little-endian deserializer for `u32`.
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<u32> for U32LeDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], u32, E> {
        context("Failed u32 le deserialization", le_u32)(buffer)
    }
}

/// Serializer for `u64` as 8 little-endian bytes.
#[derive(Clone, Default)]
pub struct U64LeSerializer;

impl U64LeSerializer {
    /// Creates a little-endian serializer for `u64`.
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<u64> for U64LeSerializer {
    fn serialize(&self, value: &u64, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Deserializer for `u64` from 8 little-endian bytes.
#[derive(Clone, Default)]
pub struct U64LeDeserializer;

impl U64LeDeserializer {
    /// Creates a little-endian deserializer for `u64`.
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<u64> for U64LeDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], u64, E> {
        context("Failed u64 le deserialization", le_u64)(buffer)
    }
}

/// Serializer for `i64` as 8 little-endian bytes.
#[derive(Clone, Default)]
pub struct I64LeSerializer;

impl I64LeSerializer {
    /// Creates a little-endian serializer for `i64`.
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<i64> for I64LeSerializer {
    fn serialize(&self, value: &i64, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Deserializer for `i64` from 8 little-endian bytes.
#[derive(Clone, Default)]
pub struct I64LeDeserializer;

impl I64LeDeserializer {
    /// Creates a little-endian deserializer for `i64`.
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<i64> for I64LeDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], i64, E> {
        context("Failed i64 le deserialization", le_i64)(buffer)
    }
}

/// Serializer for `bool` as a single 0/1 byte.
#[derive(Clone, Default)]
pub struct BoolSerializer;

impl BoolSerializer {
    /// Creates a serializer for `bool`.
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<bool> for BoolSerializer {
    fn serialize(&self, value: &bool, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.push(u8::from(*value));
        Ok(())
    }
}

/// Deserializer for `bool` from a single 0/1 byte. Any other byte is rejected.
#[derive(Clone, Default)]
pub struct BoolDeserializer;

impl BoolDeserializer {
    /// Creates a deserializer for `bool`.
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<bool> for BoolDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], bool, E> {
        context("Failed bool deserialization", |input: &'a [u8]| {
            match input.split_first() {
                Some((0, rest)) => Ok((rest, false)),
                Some((1, rest)) => Ok((rest, true)),
                _ => Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                ))),
            }
        })(buffer)
    }
}

/// Serializer for `Option<T>`: a presence byte (0/1) followed by the value.
#[derive(Clone)]
pub struct OptionSerializer<T, ST>
where
    ST: Serializer<T>,
{
    inner: ST,
    bool_serializer: BoolSerializer,
    _phantom: std::marker::PhantomData<T>,
}

impl<T, ST> OptionSerializer<T, ST>
where
    ST: Serializer<T>,
{
    /// Wraps `inner` into an option serializer.
    pub fn new(inner: ST) -> Self {
        Self {
            inner,
            bool_serializer: BoolSerializer::new(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T, ST> Serializer<Option<T>> for OptionSerializer<T, ST>
where
    ST: Serializer<T>,
{
    fn serialize(&self, value: &Option<T>, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        match value {
            Some(inner) => {
                self.bool_serializer.serialize(&true, buffer)?;
                self.inner.serialize(inner, buffer)
            }
            None => self.bool_serializer.serialize(&false, buffer),
        }
    }
}

/// Deserializer for `Option<T>`: a presence byte (0/1) followed by the value.
#[derive(Clone)]
pub struct OptionDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    inner: DT,
    bool_deserializer: BoolDeserializer,
    _phantom: std::marker::PhantomData<T>,
}

impl<T, DT> OptionDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    /// Wraps `inner` into an option deserializer.
    pub fn new(inner: DT) -> Self {
        Self {
            inner,
            bool_deserializer: BoolDeserializer::new(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T, DT> Deserializer<Option<T>> for OptionDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Option<T>, E> {
        context("Failed Option<_> deserialization", |input: &'a [u8]| {
            let (rest, present) = self.bool_deserializer.deserialize(input)?;
            if present {
                let (rest, value) = self.inner.deserialize(rest)?;
                Ok((rest, Some(value)))
            } else {
                Ok((rest, None))
            }
        })(buffer)
    }
}

/// Serializer for raw byte strings: varuint64 length followed by the bytes.
#[derive(Clone, Default)]
pub struct VecU8Serializer {
    len_serializer: U64VarIntSerializer,
}

impl VecU8Serializer {
    /// Creates a serializer for byte strings.
    pub fn new() -> Self {
        Self {
            len_serializer: U64VarIntSerializer::new(),
        }
    }
}

impl Serializer<Vec<u8>> for VecU8Serializer {
    fn serialize(&self, value: &Vec<u8>, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.len_serializer.serialize(&(value.len() as u64), buffer)?;
        buffer.extend_from_slice(value);
        Ok(())
    }
}

/// Deserializer for raw byte strings: varuint64 length followed by the bytes.
#[derive(Clone)]
pub struct VecU8Deserializer {
    len_deserializer: U64VarIntDeserializer,
}

impl VecU8Deserializer {
    /// Creates a deserializer for byte strings whose length must be in `[min, max]`.
    pub const fn new(min_length: Bound<u64>, max_length: Bound<u64>) -> Self {
        Self {
            len_deserializer: U64VarIntDeserializer::new(min_length, max_length),
        }
    }
}

impl Deserializer<Vec<u8>> for VecU8Deserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Vec<u8>, E> {
        context(
            "Failed Vec<u8> deserialization",
            length_data(|input| self.len_deserializer.deserialize(input)).map(|b: &[u8]| b.to_vec()),
        )
        .parse(buffer)
    }
}

/// Deserializer returning a fixed number of raw bytes.
#[derive(Clone)]
pub struct FixedBytesDeserializer {
    count: usize,
}

impl FixedBytesDeserializer {
    /// Creates a deserializer consuming exactly `count` bytes.
    pub const fn new(count: usize) -> Self {
        Self { count }
    }
}

impl Deserializer<Vec<u8>> for FixedBytesDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Vec<u8>, E> {
        context("Failed fixed bytes deserialization", take(self.count))
            .map(|b: &[u8]| b.to_vec())
            .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Bound::Included;

    #[test]
    fn test_u32_varint_round_trip() {
        let serializer = U32VarIntSerializer::new();
        let deserializer = U32VarIntDeserializer::new(Included(0), Included(u32::MAX));
        for value in [0u32, 1, 127, 128, 300, u32::MAX] {
            let mut buffer = Vec::new();
            serializer.serialize(&value, &mut buffer).unwrap();
            let (rest, decoded) = deserializer
                .deserialize::<DeserializeError>(&buffer)
                .unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_u32_varint_range_check() {
        let serializer = U32VarIntSerializer::new();
        let deserializer = U32VarIntDeserializer::new(Included(0), Included(100));
        let mut buffer = Vec::new();
        serializer.serialize(&101, &mut buffer).unwrap();
        assert!(deserializer
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }

    #[test]
    fn test_u64_le_round_trip() {
        let serializer = U64LeSerializer::new();
        let deserializer = U64LeDeserializer::new();
        let mut buffer = Vec::new();
        serializer.serialize(&0xdead_beef_cafe_f00d, &mut buffer).unwrap();
        assert_eq!(buffer.len(), 8);
        let (rest, decoded) = deserializer
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn test_bool_rejects_garbage() {
        let deserializer = BoolDeserializer::new();
        assert!(deserializer.deserialize::<DeserializeError>(&[2]).is_err());
        assert!(deserializer.deserialize::<DeserializeError>(&[]).is_err());
        let (_, value) = deserializer.deserialize::<DeserializeError>(&[1]).unwrap();
        assert!(value);
    }

    #[test]
    fn test_option_round_trip() {
        let serializer = OptionSerializer::new(U32LeSerializer::new());
        let deserializer = OptionDeserializer::new(U32LeDeserializer::new());
        for value in [Some(42u32), None] {
            let mut buffer = Vec::new();
            serializer.serialize(&value, &mut buffer).unwrap();
            let (rest, decoded) = deserializer
                .deserialize::<DeserializeError>(&buffer)
                .unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_vec_u8_round_trip() {
        let serializer = VecU8Serializer::new();
        let deserializer = VecU8Deserializer::new(Included(0), Included(u64::MAX));
        let data = vec![7u8; 300];
        let mut buffer = Vec::new();
        serializer.serialize(&data, &mut buffer).unwrap();
        let (rest, decoded) = deserializer
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, data);
    }
}
