// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Typed request/result variants exchanged on the state-history channel.
//!
//! Every frame is `varuint32 tag` followed by the variant body. Integers are
//! fixed-width little-endian, options carry a presence byte, byte strings a
//! varuint length. The schema is frozen per protocol version and exposed to
//! clients as the ABI greeting.

use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::{IResult, Parser};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::ops::Bound::Included;
use vellum_models::block::{BlockPositionDeserializer, BlockPositionSerializer};
use vellum_models::ids::{ChainIdDeserializer, ChainIdSerializer};
use vellum_models::{BlockPosition, ChainId};
use vellum_serialization::{
    BoolDeserializer, BoolSerializer, Deserializer, OptionDeserializer, OptionSerializer,
    SerializeError, Serializer, U32LeDeserializer, U32LeSerializer, U32VarIntDeserializer,
    U32VarIntSerializer, VecU8Deserializer, VecU8Serializer,
};

/// Upper bound on the fork-negotiation positions a client may send.
const MAX_HAVE_POSITIONS: u32 = 4096;

/// Subscription request: stream block results starting at a cursor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocksRequestV0 {
    /// first block to send
    pub start_block_num: u32,
    /// one past the last block to send
    pub end_block_num: u32,
    /// send credit: how many result frames the server may emit
    pub max_messages_in_flight: u32,
    /// positions the client already holds, for fork negotiation
    pub have_positions: Vec<BlockPosition>,
    /// follow the irreversible head instead of the chain head
    pub irreversible_only: bool,
    /// include the packed block in results
    pub fetch_block: bool,
    /// include the trace log entry in results
    pub fetch_traces: bool,
    /// include the chain-state log entry in results
    pub fetch_deltas: bool,
}

/// Credit grant: allows the server to send `num_messages` more results.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocksAckRequestV0 {
    /// number of additional result frames allowed
    pub num_messages: u32,
}

/// Requests a client may send.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StateRequest {
    /// ask for the server status
    GetStatus,
    /// subscribe to block results
    GetBlocks(GetBlocksRequestV0),
    /// grant more send credit
    GetBlocksAck(GetBlocksAckRequestV0),
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Eq, PartialEq)]
#[repr(u32)]
enum RequestTypeId {
    GetStatus = 0u32,
    GetBlocks = 1u32,
    GetBlocksAck = 2u32,
}

/// Server status: head, irreversible head, chain id and the block ranges
/// covered by each log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetStatusResultV0 {
    /// chain head position
    pub head: BlockPosition,
    /// last irreversible position
    pub last_irreversible: BlockPosition,
    /// chain identifier
    pub chain_id: ChainId,
    /// first block held by the trace log (0 when disabled)
    pub trace_begin_block: u32,
    /// one past the last block held by the trace log (0 when disabled)
    pub trace_end_block: u32,
    /// first block held by the chain-state log (0 when disabled)
    pub chain_state_begin_block: u32,
    /// one past the last block held by the chain-state log (0 when disabled)
    pub chain_state_end_block: u32,
}

/// One streamed block, or a bare head update when the cursor has caught up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocksResultV0 {
    /// chain head position at send time
    pub head: BlockPosition,
    /// last irreversible position at send time
    pub last_irreversible: BlockPosition,
    /// position of the block this result carries
    pub this_block: Option<BlockPosition>,
    /// position of its parent
    pub prev_block: Option<BlockPosition>,
    /// packed signed block, when requested and available
    pub block: Option<Vec<u8>>,
    /// raw trace log entry payload, when requested and stored
    pub traces: Option<Vec<u8>>,
    /// raw chain-state log entry payload, when requested and stored
    pub deltas: Option<Vec<u8>>,
}

/// Results the server may send.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StateResult {
    /// status reply
    Status(GetStatusResultV0),
    /// streamed block reply
    GetBlocks(Box<GetBlocksResultV0>),
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Eq, PartialEq)]
#[repr(u32)]
enum ResultTypeId {
    Status = 0u32,
    GetBlocks = 1u32,
}

/// Serializer for `StateRequest`
pub struct StateRequestSerializer {
    tag_serializer: U32VarIntSerializer,
    u32_serializer: U32LeSerializer,
    count_serializer: U32VarIntSerializer,
    position_serializer: BlockPositionSerializer,
    bool_serializer: BoolSerializer,
}

impl StateRequestSerializer {
    /// Creates a new serializer for `StateRequest`
    pub fn new() -> Self {
        Self {
            tag_serializer: U32VarIntSerializer::new(),
            u32_serializer: U32LeSerializer::new(),
            count_serializer: U32VarIntSerializer::new(),
            position_serializer: BlockPositionSerializer::new(),
            bool_serializer: BoolSerializer::new(),
        }
    }
}

impl Default for StateRequestSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<StateRequest> for StateRequestSerializer {
    fn serialize(&self, value: &StateRequest, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        match value {
            StateRequest::GetStatus => {
                self.tag_serializer
                    .serialize(&u32::from(RequestTypeId::GetStatus), buffer)?;
            }
            StateRequest::GetBlocks(request) => {
                self.tag_serializer
                    .serialize(&u32::from(RequestTypeId::GetBlocks), buffer)?;
                self.u32_serializer
                    .serialize(&request.start_block_num, buffer)?;
                self.u32_serializer
                    .serialize(&request.end_block_num, buffer)?;
                self.u32_serializer
                    .serialize(&request.max_messages_in_flight, buffer)?;
                let count: u32 = request.have_positions.len().try_into().map_err(|_| {
                    SerializeError::GeneralError("too many have_positions".to_string())
                })?;
                self.count_serializer.serialize(&count, buffer)?;
                for position in &request.have_positions {
                    self.position_serializer.serialize(position, buffer)?;
                }
                self.bool_serializer
                    .serialize(&request.irreversible_only, buffer)?;
                self.bool_serializer.serialize(&request.fetch_block, buffer)?;
                self.bool_serializer
                    .serialize(&request.fetch_traces, buffer)?;
                self.bool_serializer
                    .serialize(&request.fetch_deltas, buffer)?;
            }
            StateRequest::GetBlocksAck(ack) => {
                self.tag_serializer
                    .serialize(&u32::from(RequestTypeId::GetBlocksAck), buffer)?;
                self.u32_serializer.serialize(&ack.num_messages, buffer)?;
            }
        }
        Ok(())
    }
}

/// Deserializer for `StateRequest`
pub struct StateRequestDeserializer {
    tag_deserializer: U32VarIntDeserializer,
    u32_deserializer: U32LeDeserializer,
    count_deserializer: U32VarIntDeserializer,
    position_deserializer: BlockPositionDeserializer,
    bool_deserializer: BoolDeserializer,
}

impl StateRequestDeserializer {
    /// Creates a new deserializer for `StateRequest`
    pub fn new() -> Self {
        Self {
            tag_deserializer: U32VarIntDeserializer::new(Included(0), Included(2)),
            u32_deserializer: U32LeDeserializer::new(),
            count_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(MAX_HAVE_POSITIONS),
            ),
            position_deserializer: BlockPositionDeserializer::new(),
            bool_deserializer: BoolDeserializer::new(),
        }
    }
}

impl Default for StateRequestDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<StateRequest> for StateRequestDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], StateRequest, E> {
        context("Failed StateRequest deserialization", |buffer: &'a [u8]| {
            let (input, tag) = self.tag_deserializer.deserialize(buffer)?;
            let id = RequestTypeId::try_from(tag).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    buffer,
                    nom::error::ErrorKind::Eof,
                ))
            })?;
            match id {
                RequestTypeId::GetStatus => Ok((input, StateRequest::GetStatus)),
                RequestTypeId::GetBlocks => {
                    let (rest, start_block_num) = self.u32_deserializer.deserialize(input)?;
                    let (rest, end_block_num) = self.u32_deserializer.deserialize(rest)?;
                    let (rest, max_messages_in_flight) =
                        self.u32_deserializer.deserialize(rest)?;
                    let (rest, have_positions) = length_count(
                        |input| self.count_deserializer.deserialize(input),
                        |input| self.position_deserializer.deserialize(input),
                    )
                    .parse(rest)?;
                    let (rest, irreversible_only) = self.bool_deserializer.deserialize(rest)?;
                    let (rest, fetch_block) = self.bool_deserializer.deserialize(rest)?;
                    let (rest, fetch_traces) = self.bool_deserializer.deserialize(rest)?;
                    let (rest, fetch_deltas) = self.bool_deserializer.deserialize(rest)?;
                    Ok((
                        rest,
                        StateRequest::GetBlocks(GetBlocksRequestV0 {
                            start_block_num,
                            end_block_num,
                            max_messages_in_flight,
                            have_positions,
                            irreversible_only,
                            fetch_block,
                            fetch_traces,
                            fetch_deltas,
                        }),
                    ))
                }
                RequestTypeId::GetBlocksAck => {
                    let (rest, num_messages) = self.u32_deserializer.deserialize(input)?;
                    Ok((
                        rest,
                        StateRequest::GetBlocksAck(GetBlocksAckRequestV0 { num_messages }),
                    ))
                }
            }
        })
        .parse(buffer)
    }
}

/// Serializer for `StateResult`
pub struct StateResultSerializer {
    tag_serializer: U32VarIntSerializer,
    u32_serializer: U32LeSerializer,
    position_serializer: BlockPositionSerializer,
    opt_position_serializer: OptionSerializer<BlockPosition, BlockPositionSerializer>,
    opt_bytes_serializer: OptionSerializer<Vec<u8>, VecU8Serializer>,
    chain_id_serializer: ChainIdSerializer,
}

impl StateResultSerializer {
    /// Creates a new serializer for `StateResult`
    pub fn new() -> Self {
        Self {
            tag_serializer: U32VarIntSerializer::new(),
            u32_serializer: U32LeSerializer::new(),
            position_serializer: BlockPositionSerializer::new(),
            opt_position_serializer: OptionSerializer::new(BlockPositionSerializer::new()),
            opt_bytes_serializer: OptionSerializer::new(VecU8Serializer::new()),
            chain_id_serializer: ChainIdSerializer::new(),
        }
    }
}

impl Default for StateResultSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<StateResult> for StateResultSerializer {
    fn serialize(&self, value: &StateResult, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        match value {
            StateResult::Status(status) => {
                self.tag_serializer
                    .serialize(&u32::from(ResultTypeId::Status), buffer)?;
                self.position_serializer.serialize(&status.head, buffer)?;
                self.position_serializer
                    .serialize(&status.last_irreversible, buffer)?;
                self.chain_id_serializer
                    .serialize(&status.chain_id, buffer)?;
                self.u32_serializer
                    .serialize(&status.trace_begin_block, buffer)?;
                self.u32_serializer
                    .serialize(&status.trace_end_block, buffer)?;
                self.u32_serializer
                    .serialize(&status.chain_state_begin_block, buffer)?;
                self.u32_serializer
                    .serialize(&status.chain_state_end_block, buffer)?;
            }
            StateResult::GetBlocks(result) => {
                self.tag_serializer
                    .serialize(&u32::from(ResultTypeId::GetBlocks), buffer)?;
                self.position_serializer.serialize(&result.head, buffer)?;
                self.position_serializer
                    .serialize(&result.last_irreversible, buffer)?;
                self.opt_position_serializer
                    .serialize(&result.this_block, buffer)?;
                self.opt_position_serializer
                    .serialize(&result.prev_block, buffer)?;
                self.opt_bytes_serializer.serialize(&result.block, buffer)?;
                self.opt_bytes_serializer
                    .serialize(&result.traces, buffer)?;
                self.opt_bytes_serializer
                    .serialize(&result.deltas, buffer)?;
            }
        }
        Ok(())
    }
}

/// Deserializer for `StateResult`
pub struct StateResultDeserializer {
    tag_deserializer: U32VarIntDeserializer,
    u32_deserializer: U32LeDeserializer,
    position_deserializer: BlockPositionDeserializer,
    opt_position_deserializer: OptionDeserializer<BlockPosition, BlockPositionDeserializer>,
    opt_bytes_deserializer: OptionDeserializer<Vec<u8>, VecU8Deserializer>,
    chain_id_deserializer: ChainIdDeserializer,
}

impl StateResultDeserializer {
    /// Creates a new deserializer for `StateResult`
    pub fn new() -> Self {
        Self {
            tag_deserializer: U32VarIntDeserializer::new(Included(0), Included(1)),
            u32_deserializer: U32LeDeserializer::new(),
            position_deserializer: BlockPositionDeserializer::new(),
            opt_position_deserializer: OptionDeserializer::new(BlockPositionDeserializer::new()),
            opt_bytes_deserializer: OptionDeserializer::new(VecU8Deserializer::new(
                Included(0),
                Included(u64::MAX),
            )),
            chain_id_deserializer: ChainIdDeserializer::new(),
        }
    }
}

impl Default for StateResultDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<StateResult> for StateResultDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], StateResult, E> {
        context("Failed StateResult deserialization", |buffer: &'a [u8]| {
            let (input, tag) = self.tag_deserializer.deserialize(buffer)?;
            let id = ResultTypeId::try_from(tag).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    buffer,
                    nom::error::ErrorKind::Eof,
                ))
            })?;
            match id {
                ResultTypeId::Status => {
                    let (rest, head) = self.position_deserializer.deserialize(input)?;
                    let (rest, last_irreversible) =
                        self.position_deserializer.deserialize(rest)?;
                    let (rest, chain_id) = self.chain_id_deserializer.deserialize(rest)?;
                    let (rest, trace_begin_block) = self.u32_deserializer.deserialize(rest)?;
                    let (rest, trace_end_block) = self.u32_deserializer.deserialize(rest)?;
                    let (rest, chain_state_begin_block) =
                        self.u32_deserializer.deserialize(rest)?;
                    let (rest, chain_state_end_block) =
                        self.u32_deserializer.deserialize(rest)?;
                    Ok((
                        rest,
                        StateResult::Status(GetStatusResultV0 {
                            head,
                            last_irreversible,
                            chain_id,
                            trace_begin_block,
                            trace_end_block,
                            chain_state_begin_block,
                            chain_state_end_block,
                        }),
                    ))
                }
                ResultTypeId::GetBlocks => {
                    let (rest, head) = self.position_deserializer.deserialize(input)?;
                    let (rest, last_irreversible) =
                        self.position_deserializer.deserialize(rest)?;
                    let (rest, this_block) = self.opt_position_deserializer.deserialize(rest)?;
                    let (rest, prev_block) = self.opt_position_deserializer.deserialize(rest)?;
                    let (rest, block) = self.opt_bytes_deserializer.deserialize(rest)?;
                    let (rest, traces) = self.opt_bytes_deserializer.deserialize(rest)?;
                    let (rest, deltas) = self.opt_bytes_deserializer.deserialize(rest)?;
                    Ok((
                        rest,
                        StateResult::GetBlocks(Box::new(GetBlocksResultV0 {
                            head,
                            last_irreversible,
                            this_block,
                            prev_block,
                            block,
                            traces,
                            deltas,
                        })),
                    ))
                }
            }
        })
        .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_models::{BlockId, ID_SIZE_BYTES};
    use vellum_serialization::DeserializeError;

    fn position(n: u32) -> BlockPosition {
        BlockPosition {
            block_num: n,
            block_id: BlockId([n as u8; ID_SIZE_BYTES]),
        }
    }

    fn round_trip_request(request: StateRequest) {
        let mut buffer = Vec::new();
        StateRequestSerializer::new()
            .serialize(&request, &mut buffer)
            .unwrap();
        let (rest, decoded) = StateRequestDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, request);
    }

    fn round_trip_result(result: StateResult) {
        let mut buffer = Vec::new();
        StateResultSerializer::new()
            .serialize(&result, &mut buffer)
            .unwrap();
        let (rest, decoded) = StateResultDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_request_round_trips() {
        round_trip_request(StateRequest::GetStatus);
        round_trip_request(StateRequest::GetBlocksAck(GetBlocksAckRequestV0 {
            num_messages: 12,
        }));
        round_trip_request(StateRequest::GetBlocks(GetBlocksRequestV0 {
            start_block_num: 10,
            end_block_num: 500,
            max_messages_in_flight: 3,
            have_positions: vec![position(8), position(9)],
            irreversible_only: true,
            fetch_block: true,
            fetch_traces: false,
            fetch_deltas: true,
        }));
    }

    #[test]
    fn test_result_round_trips() {
        round_trip_result(StateResult::Status(GetStatusResultV0 {
            head: position(42),
            last_irreversible: position(40),
            chain_id: ChainId([9; ID_SIZE_BYTES]),
            trace_begin_block: 1,
            trace_end_block: 43,
            chain_state_begin_block: 0,
            chain_state_end_block: 0,
        }));
        round_trip_result(StateResult::GetBlocks(Box::new(GetBlocksResultV0 {
            head: position(42),
            last_irreversible: position(40),
            this_block: Some(position(17)),
            prev_block: Some(position(16)),
            block: None,
            traces: Some(vec![1, 2, 3]),
            deltas: None,
        })));
        // bare head update
        round_trip_result(StateResult::GetBlocks(Box::new(GetBlocksResultV0 {
            head: position(42),
            last_irreversible: position(40),
            this_block: None,
            prev_block: None,
            block: None,
            traces: None,
            deltas: None,
        })));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        // tag 7 is not a known request
        assert!(StateRequestDeserializer::new()
            .deserialize::<DeserializeError>(&[7])
            .is_err());
    }

    #[test]
    fn test_truncated_request_rejected() {
        let mut buffer = Vec::new();
        StateRequestSerializer::new()
            .serialize(
                &StateRequest::GetBlocksAck(GetBlocksAckRequestV0 { num_messages: 1 }),
                &mut buffer,
            )
            .unwrap();
        buffer.pop();
        assert!(StateRequestDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }
}
