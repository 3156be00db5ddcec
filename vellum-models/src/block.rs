// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Block positions and the per-block summary delivered by the chain runtime.

use crate::ids::{
    BlockId, BlockIdDeserializer, BlockIdSerializer, TransactionId,
};
use nom::error::{context, ContextError, ParseError};
use nom::IResult;
use vellum_serialization::{
    Deserializer, SerializeError, Serializer, U32LeDeserializer, U32LeSerializer,
};

/// A point in the chain: height plus the id observed at that height.
///
/// Used both as a streaming cursor and as a fork check (two positions at the
/// same height with different ids are on different forks).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockPosition {
    /// block height
    pub block_num: u32,
    /// id of the block at that height
    pub block_id: BlockId,
}

/// Summary of an accepted block, handed to the service by the chain runtime.
///
/// `transaction_ids` lists the transactions in the order the block carries
/// them; the trace converter packs traces in exactly that order.
#[derive(Clone, Debug)]
pub struct BlockState {
    /// block height
    pub block_num: u32,
    /// id of this block
    pub block_id: BlockId,
    /// id of the parent block
    pub previous_id: BlockId,
    /// transaction ids in block order
    pub transaction_ids: Vec<TransactionId>,
}

impl BlockState {
    /// Position of this block.
    pub fn position(&self) -> BlockPosition {
        BlockPosition {
            block_num: self.block_num,
            block_id: self.block_id,
        }
    }
}

/// Serializer for `BlockPosition`
#[derive(Clone, Default)]
pub struct BlockPositionSerializer {
    num_serializer: U32LeSerializer,
    id_serializer: BlockIdSerializer,
}

impl BlockPositionSerializer {
    /// Creates a new serializer for `BlockPosition`
    pub fn new() -> Self {
        Self {
            num_serializer: U32LeSerializer::new(),
            id_serializer: BlockIdSerializer::new(),
        }
    }
}

impl Serializer<BlockPosition> for BlockPositionSerializer {
    fn serialize(&self, value: &BlockPosition, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.num_serializer.serialize(&value.block_num, buffer)?;
        self.id_serializer.serialize(&value.block_id, buffer)
    }
}

/// Deserializer for `BlockPosition`
#[derive(Clone, Default)]
pub struct BlockPositionDeserializer {
    num_deserializer: U32LeDeserializer,
    id_deserializer: BlockIdDeserializer,
}

impl BlockPositionDeserializer {
    /// Creates a new deserializer for `BlockPosition`
    pub fn new() -> Self {
        Self {
            num_deserializer: U32LeDeserializer::new(),
            id_deserializer: BlockIdDeserializer::new(),
        }
    }
}

impl Deserializer<BlockPosition> for BlockPositionDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockPosition, E> {
        context("Failed BlockPosition deserialization", |input| {
            let (rest, block_num) = self.num_deserializer.deserialize(input)?;
            let (rest, block_id) = self.id_deserializer.deserialize(rest)?;
            Ok((
                rest,
                BlockPosition {
                    block_num,
                    block_id,
                },
            ))
        })(buffer)
    }
}
