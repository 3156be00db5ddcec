// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Fixed-size identifiers handed over by the chain runtime.
//!
//! Ids are opaque 32-byte values as far as the history service is concerned:
//! the chain computes them, the service only stores, compares and renders
//! them. Rendering uses bs58-check with a one-character kind prefix.

use crate::error::ModelsError;
use nom::bytes::complete::take;
use nom::error::{context, ContextError, ParseError};
use nom::IResult;
use std::str::FromStr;
use vellum_serialization::{Deserializer, SerializeError, Serializer};

/// Size in bytes of every chain identifier.
pub const ID_SIZE_BYTES: usize = 32;

const BLOCK_ID_PREFIX: char = 'B';
const TRANSACTION_ID_PREFIX: char = 'T';

/// Block identifier.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub [u8; ID_SIZE_BYTES]);

impl BlockId {
    /// block id as raw bytes
    pub fn to_bytes(&self) -> &[u8; ID_SIZE_BYTES] {
        &self.0
    }

    /// block id from raw bytes
    pub fn from_bytes(data: &[u8; ID_SIZE_BYTES]) -> BlockId {
        BlockId(*data)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            BLOCK_ID_PREFIX,
            bs58::encode(self.0).with_check().into_string()
        )
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for BlockId {
    type Err = ModelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match chars.next() {
            Some(prefix) if prefix == BLOCK_ID_PREFIX => {
                let data: String = chars.collect();
                let decoded = bs58::decode(data)
                    .with_check(None)
                    .into_vec()
                    .map_err(|_| ModelsError::IdParseError(s.to_string()))?;
                let bytes: [u8; ID_SIZE_BYTES] = decoded
                    .try_into()
                    .map_err(|_| ModelsError::IdParseError(s.to_string()))?;
                Ok(BlockId(bytes))
            }
            _ => Err(ModelsError::IdParseError(s.to_string())),
        }
    }
}

/// Transaction identifier.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId(pub [u8; ID_SIZE_BYTES]);

impl TransactionId {
    /// transaction id as raw bytes
    pub fn to_bytes(&self) -> &[u8; ID_SIZE_BYTES] {
        &self.0
    }

    /// transaction id from raw bytes
    pub fn from_bytes(data: &[u8; ID_SIZE_BYTES]) -> TransactionId {
        TransactionId(*data)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            TRANSACTION_ID_PREFIX,
            bs58::encode(self.0).with_check().into_string()
        )
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for TransactionId {
    type Err = ModelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match chars.next() {
            Some(prefix) if prefix == TRANSACTION_ID_PREFIX => {
                let data: String = chars.collect();
                let decoded = bs58::decode(data)
                    .with_check(None)
                    .into_vec()
                    .map_err(|_| ModelsError::IdParseError(s.to_string()))?;
                let bytes: [u8; ID_SIZE_BYTES] = decoded
                    .try_into()
                    .map_err(|_| ModelsError::IdParseError(s.to_string()))?;
                Ok(TransactionId(bytes))
            }
            _ => Err(ModelsError::IdParseError(s.to_string())),
        }
    }
}

/// Chain identifier reported in status results.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ChainId(pub [u8; ID_SIZE_BYTES]);

impl ChainId {
    /// chain id as raw bytes
    pub fn to_bytes(&self) -> &[u8; ID_SIZE_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", bs58::encode(self.0).with_check().into_string())
    }
}

/// Serializer for `BlockId`
#[derive(Clone, Default)]
pub struct BlockIdSerializer;

impl BlockIdSerializer {
    /// Creates a new serializer for `BlockId`
    pub fn new() -> Self {
        Self
    }
}

impl Serializer<BlockId> for BlockIdSerializer {
    fn serialize(&self, value: &BlockId, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `BlockId`
#[derive(Clone, Default)]
pub struct BlockIdDeserializer;

impl BlockIdDeserializer {
    /// Creates a new deserializer for `BlockId`
    pub fn new() -> Self {
        Self
    }
}

impl Deserializer<BlockId> for BlockIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockId, E> {
        context("Failed BlockId deserialization", |input: &'a [u8]| {
            let (rest, bytes) = take(ID_SIZE_BYTES)(input)?;
            // take(ID_SIZE_BYTES) guarantees the slice length
            let bytes: [u8; ID_SIZE_BYTES] = bytes.try_into().unwrap();
            Ok((rest, BlockId(bytes)))
        })(buffer)
    }
}

/// Serializer for `TransactionId`
#[derive(Clone, Default)]
pub struct TransactionIdSerializer;

impl TransactionIdSerializer {
    /// Creates a new serializer for `TransactionId`
    pub fn new() -> Self {
        Self
    }
}

impl Serializer<TransactionId> for TransactionIdSerializer {
    fn serialize(&self, value: &TransactionId, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `TransactionId`
#[derive(Clone, Default)]
pub struct TransactionIdDeserializer;

impl TransactionIdDeserializer {
    /// Creates a new deserializer for `TransactionId`
    pub fn new() -> Self {
        Self
    }
}

impl Deserializer<TransactionId> for TransactionIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], TransactionId, E> {
        context("Failed TransactionId deserialization", |input: &'a [u8]| {
            let (rest, bytes) = take(ID_SIZE_BYTES)(input)?;
            let bytes: [u8; ID_SIZE_BYTES] = bytes.try_into().unwrap();
            Ok((rest, TransactionId(bytes)))
        })(buffer)
    }
}

/// Serializer for `ChainId`
#[derive(Clone, Default)]
pub struct ChainIdSerializer;

impl ChainIdSerializer {
    /// Creates a new serializer for `ChainId`
    pub fn new() -> Self {
        Self
    }
}

impl Serializer<ChainId> for ChainIdSerializer {
    fn serialize(&self, value: &ChainId, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `ChainId`
#[derive(Clone, Default)]
pub struct ChainIdDeserializer;

impl ChainIdDeserializer {
    /// Creates a new deserializer for `ChainId`
    pub fn new() -> Self {
        Self
    }
}

impl Deserializer<ChainId> for ChainIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ChainId, E> {
        context("Failed ChainId deserialization", |input: &'a [u8]| {
            let (rest, bytes) = take(ID_SIZE_BYTES)(input)?;
            let bytes: [u8; ID_SIZE_BYTES] = bytes.try_into().unwrap();
            Ok((rest, ChainId(bytes)))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_serialization::DeserializeError;

    #[test]
    fn test_block_id_display_round_trip() {
        let id = BlockId([0xab; ID_SIZE_BYTES]);
        let rendered = id.to_string();
        assert!(rendered.starts_with('B'));
        assert_eq!(BlockId::from_str(&rendered).unwrap(), id);
    }

    #[test]
    fn test_block_id_rejects_wrong_prefix() {
        let id = TransactionId([3; ID_SIZE_BYTES]);
        assert!(BlockId::from_str(&id.to_string()).is_err());
    }

    #[test]
    fn test_id_serialization_round_trip() {
        let id = TransactionId([7; ID_SIZE_BYTES]);
        let mut buffer = Vec::new();
        TransactionIdSerializer::new()
            .serialize(&id, &mut buffer)
            .unwrap();
        assert_eq!(buffer.len(), ID_SIZE_BYTES);
        let (rest, decoded) = TransactionIdDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, id);
    }
}
