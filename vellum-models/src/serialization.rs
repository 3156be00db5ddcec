// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Serialization helpers shared by the model types.

use nom::error::{context, ContextError, ParseError};
use nom::multi::length_data;
use nom::{IResult, Parser};
use std::ops::Bound::Included;
use vellum_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
};

/// Serializer for strings: varuint32 byte length followed by UTF-8 bytes.
#[derive(Clone, Default)]
pub struct StringSerializer {
    len_serializer: U32VarIntSerializer,
}

impl StringSerializer {
    /// Creates a new serializer for strings.
    pub fn new() -> Self {
        Self {
            len_serializer: U32VarIntSerializer::new(),
        }
    }
}

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        let len: u32 = value.len().try_into().map_err(|_| {
            SerializeError::GeneralError(format!("string length {} overflows u32", value.len()))
        })?;
        self.len_serializer.serialize(&len, buffer)?;
        buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Deserializer for strings: varuint32 byte length followed by UTF-8 bytes.
#[derive(Clone)]
pub struct StringDeserializer {
    len_deserializer: U32VarIntDeserializer,
}

impl StringDeserializer {
    /// Creates a new deserializer for strings of at most `max_length` bytes.
    pub const fn new(max_length: u32) -> Self {
        Self {
            len_deserializer: U32VarIntDeserializer::new(Included(0), Included(max_length)),
        }
    }
}

impl Deserializer<String> for StringDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], String, E> {
        context("Failed String deserialization", |input: &'a [u8]| {
            let (rest, bytes) =
                length_data(|input| self.len_deserializer.deserialize(input)).parse(input)?;
            let value = std::str::from_utf8(bytes).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                ))
            })?;
            Ok((rest, value.to_string()))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_serialization::DeserializeError;

    #[test]
    fn test_string_round_trip() {
        let serializer = StringSerializer::new();
        let deserializer = StringDeserializer::new(1024);
        for value in ["", "onblock", "état"] {
            let mut buffer = Vec::new();
            serializer.serialize(&value.to_string(), &mut buffer).unwrap();
            let (rest, decoded) = deserializer
                .deserialize::<DeserializeError>(&buffer)
                .unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let deserializer = StringDeserializer::new(16);
        // length 2, bytes are not valid utf-8
        assert!(deserializer
            .deserialize::<DeserializeError>(&[2, 0xff, 0xfe])
            .is_err());
    }
}
