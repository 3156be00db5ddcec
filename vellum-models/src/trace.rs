// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Transaction execution traces as delivered by the chain runtime.

use crate::ids::{TransactionId, TransactionIdDeserializer, TransactionIdSerializer};
use crate::serialization::{StringDeserializer, StringSerializer};
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::{IResult, Parser};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::ops::Bound::Included;
use vellum_serialization::{
    BoolDeserializer, BoolSerializer, Deserializer, I64LeDeserializer, I64LeSerializer,
    OptionDeserializer, OptionSerializer, SerializeError, Serializer, U32LeDeserializer,
    U32LeSerializer, U32VarIntDeserializer, U32VarIntSerializer, U64LeDeserializer,
    U64LeSerializer, VecU8Deserializer, VecU8Serializer,
};

/// Account that hosts the synthetic per-block action.
pub const SYSTEM_ACCOUNT: &str = "system";
/// Name of the synthetic per-block action the chain runs before user transactions.
pub const ONBLOCK_ACTION: &str = "onblock";

const MAX_NAME_LENGTH: u32 = 64;
const MAX_CONSOLE_LENGTH: u32 = 1024 * 1024;
const MAX_ERROR_LENGTH: u32 = 64 * 1024;

/// Final status of a transaction inside a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TransactionStatus {
    /// executed successfully
    Executed = 0,
    /// objectively failed, error handler executed
    SoftFail = 1,
    /// objectively failed, error handler also failed
    HardFail = 2,
    /// scheduled for a later execution
    Delayed = 3,
    /// expired without executing
    Expired = 4,
}

/// One executed action inside a transaction trace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionTrace {
    /// account the action ran on
    pub receiver: String,
    /// action name
    pub action: String,
    /// action input data
    pub data: Vec<u8>,
    /// console output captured during execution
    pub console: String,
}

/// Per-account memory usage change caused by a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountDelta {
    /// account name
    pub account: String,
    /// signed usage change in bytes
    pub delta: i64,
}

/// Execution trace of one transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionTrace {
    /// transaction id
    pub id: TransactionId,
    /// final status
    pub status: TransactionStatus,
    /// CPU time billed, microseconds
    pub cpu_usage_us: u32,
    /// network usage billed, 8-byte words
    pub net_usage_words: u32,
    /// wall-clock execution time, microseconds
    pub elapsed_us: u64,
    /// true if the transaction was scheduled rather than user-submitted
    pub scheduled: bool,
    /// executed actions in order
    pub action_traces: Vec<ActionTrace>,
    /// memory usage changes (retained only in debug mode)
    pub account_ram_deltas: Vec<AccountDelta>,
    /// error description when status is a failure
    pub error_message: Option<String>,
}

impl TransactionTrace {
    /// True if this is the synthetic per-block trace the chain produces
    /// before user transactions.
    pub fn is_onblock(&self) -> bool {
        self.action_traces
            .first()
            .map(|action| action.receiver == SYSTEM_ACCOUNT && action.action == ONBLOCK_ACTION)
            .unwrap_or(false)
    }
}

/// A transaction's packed submission form: what the prunable part of a trace
/// log entry is built from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackedTransaction {
    /// transaction signatures
    pub signatures: Vec<Vec<u8>>,
    /// context-free data segments
    pub context_free_data: Vec<Vec<u8>>,
    /// packed transaction body
    pub packed_body: Vec<u8>,
}

/// A trace bundled with the packed transaction that produced it.
///
/// Implicit traces (onblock) have no packed transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AugmentedTransactionTrace {
    /// the execution trace
    pub trace: TransactionTrace,
    /// the packed transaction, when one exists
    pub packed: Option<PackedTransaction>,
}

/// Serializer for `ActionTrace`
#[derive(Clone, Default)]
pub struct ActionTraceSerializer {
    string_serializer: StringSerializer,
    data_serializer: VecU8Serializer,
}

impl ActionTraceSerializer {
    /// Creates a new serializer for `ActionTrace`
    pub fn new() -> Self {
        Self {
            string_serializer: StringSerializer::new(),
            data_serializer: VecU8Serializer::new(),
        }
    }
}

impl Serializer<ActionTrace> for ActionTraceSerializer {
    fn serialize(&self, value: &ActionTrace, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.string_serializer.serialize(&value.receiver, buffer)?;
        self.string_serializer.serialize(&value.action, buffer)?;
        self.data_serializer.serialize(&value.data, buffer)?;
        self.string_serializer.serialize(&value.console, buffer)
    }
}

/// Deserializer for `ActionTrace`
#[derive(Clone)]
pub struct ActionTraceDeserializer {
    name_deserializer: StringDeserializer,
    console_deserializer: StringDeserializer,
    data_deserializer: VecU8Deserializer,
}

impl ActionTraceDeserializer {
    /// Creates a new deserializer for `ActionTrace`
    pub fn new() -> Self {
        Self {
            name_deserializer: StringDeserializer::new(MAX_NAME_LENGTH),
            console_deserializer: StringDeserializer::new(MAX_CONSOLE_LENGTH),
            data_deserializer: VecU8Deserializer::new(Included(0), Included(u64::MAX)),
        }
    }
}

impl Deserializer<ActionTrace> for ActionTraceDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ActionTrace, E> {
        context("Failed ActionTrace deserialization", |input| {
            let (rest, receiver) = self.name_deserializer.deserialize(input)?;
            let (rest, action) = self.name_deserializer.deserialize(rest)?;
            let (rest, data) = self.data_deserializer.deserialize(rest)?;
            let (rest, console) = self.console_deserializer.deserialize(rest)?;
            Ok((
                rest,
                ActionTrace {
                    receiver,
                    action,
                    data,
                    console,
                },
            ))
        })(buffer)
    }
}

/// Serializer for `AccountDelta`
#[derive(Clone, Default)]
pub struct AccountDeltaSerializer {
    account_serializer: StringSerializer,
    delta_serializer: I64LeSerializer,
}

impl AccountDeltaSerializer {
    /// Creates a new serializer for `AccountDelta`
    pub fn new() -> Self {
        Self {
            account_serializer: StringSerializer::new(),
            delta_serializer: I64LeSerializer::new(),
        }
    }
}

impl Serializer<AccountDelta> for AccountDeltaSerializer {
    fn serialize(&self, value: &AccountDelta, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.account_serializer.serialize(&value.account, buffer)?;
        self.delta_serializer.serialize(&value.delta, buffer)
    }
}

/// Deserializer for `AccountDelta`
#[derive(Clone)]
pub struct AccountDeltaDeserializer {
    account_deserializer: StringDeserializer,
    delta_deserializer: I64LeDeserializer,
}

impl AccountDeltaDeserializer {
    /// Creates a new deserializer for `AccountDelta`
    pub fn new() -> Self {
        Self {
            account_deserializer: StringDeserializer::new(MAX_NAME_LENGTH),
            delta_deserializer: I64LeDeserializer::new(),
        }
    }
}

impl Deserializer<AccountDelta> for AccountDeltaDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], AccountDelta, E> {
        context("Failed AccountDelta deserialization", |input| {
            let (rest, account) = self.account_deserializer.deserialize(input)?;
            let (rest, delta) = self.delta_deserializer.deserialize(rest)?;
            Ok((rest, AccountDelta { account, delta }))
        })(buffer)
    }
}

/// Serializer for `TransactionTrace`
///
/// The id stays the leading field: the trace log pruner matches stored
/// transactions by reading those bytes in place.
#[derive(Clone)]
pub struct TransactionTraceSerializer {
    id_serializer: TransactionIdSerializer,
    u32_le_serializer: U32LeSerializer,
    u32_serializer: U32VarIntSerializer,
    u64_le_serializer: U64LeSerializer,
    bool_serializer: BoolSerializer,
    action_serializer: ActionTraceSerializer,
    ram_delta_serializer: AccountDeltaSerializer,
    error_serializer: OptionSerializer<String, StringSerializer>,
}

impl TransactionTraceSerializer {
    /// Creates a new serializer for `TransactionTrace`
    pub fn new() -> Self {
        Self {
            id_serializer: TransactionIdSerializer::new(),
            u32_le_serializer: U32LeSerializer::new(),
            u32_serializer: U32VarIntSerializer::new(),
            u64_le_serializer: U64LeSerializer::new(),
            bool_serializer: BoolSerializer::new(),
            action_serializer: ActionTraceSerializer::new(),
            ram_delta_serializer: AccountDeltaSerializer::new(),
            error_serializer: OptionSerializer::new(StringSerializer::new()),
        }
    }
}

impl Serializer<TransactionTrace> for TransactionTraceSerializer {
    fn serialize(
        &self,
        value: &TransactionTrace,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.id_serializer.serialize(&value.id, buffer)?;
        buffer.push(u8::from(value.status));
        self.u32_le_serializer.serialize(&value.cpu_usage_us, buffer)?;
        self.u32_serializer.serialize(&value.net_usage_words, buffer)?;
        self.u64_le_serializer.serialize(&value.elapsed_us, buffer)?;
        self.bool_serializer.serialize(&value.scheduled, buffer)?;
        let action_count: u32 = value.action_traces.len().try_into().map_err(|_| {
            SerializeError::GeneralError("action trace count overflows u32".to_string())
        })?;
        self.u32_serializer.serialize(&action_count, buffer)?;
        for action in &value.action_traces {
            self.action_serializer.serialize(action, buffer)?;
        }
        let delta_count: u32 = value.account_ram_deltas.len().try_into().map_err(|_| {
            SerializeError::GeneralError("ram delta count overflows u32".to_string())
        })?;
        self.u32_serializer.serialize(&delta_count, buffer)?;
        for delta in &value.account_ram_deltas {
            self.ram_delta_serializer.serialize(delta, buffer)?;
        }
        self.error_serializer.serialize(&value.error_message, buffer)
    }
}

/// Deserializer for `TransactionTrace`
#[derive(Clone)]
pub struct TransactionTraceDeserializer {
    id_deserializer: TransactionIdDeserializer,
    u32_le_deserializer: U32LeDeserializer,
    u32_deserializer: U32VarIntDeserializer,
    u64_le_deserializer: U64LeDeserializer,
    bool_deserializer: BoolDeserializer,
    action_deserializer: ActionTraceDeserializer,
    ram_delta_deserializer: AccountDeltaDeserializer,
    error_deserializer: OptionDeserializer<String, StringDeserializer>,
}

impl TransactionTraceDeserializer {
    /// Creates a new deserializer for `TransactionTrace`
    pub fn new() -> Self {
        Self {
            id_deserializer: TransactionIdDeserializer::new(),
            u32_le_deserializer: U32LeDeserializer::new(),
            u32_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            u64_le_deserializer: U64LeDeserializer::new(),
            bool_deserializer: BoolDeserializer::new(),
            action_deserializer: ActionTraceDeserializer::new(),
            ram_delta_deserializer: AccountDeltaDeserializer::new(),
            error_deserializer: OptionDeserializer::new(StringDeserializer::new(MAX_ERROR_LENGTH)),
        }
    }
}

impl Deserializer<TransactionTrace> for TransactionTraceDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], TransactionTrace, E> {
        context("Failed TransactionTrace deserialization", |input: &'a [u8]| {
            let (rest, id) = self.id_deserializer.deserialize(input)?;
            let (rest, status_byte) = nom::number::complete::le_u8(rest)?;
            let status = TransactionStatus::try_from(status_byte).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Fail,
                ))
            })?;
            let (rest, cpu_usage_us) = self.u32_le_deserializer.deserialize(rest)?;
            let (rest, net_usage_words) = self.u32_deserializer.deserialize(rest)?;
            let (rest, elapsed_us) = self.u64_le_deserializer.deserialize(rest)?;
            let (rest, scheduled) = self.bool_deserializer.deserialize(rest)?;
            let (rest, action_traces) = length_count(
                |input| self.u32_deserializer.deserialize(input),
                |input| self.action_deserializer.deserialize(input),
            )
            .parse(rest)?;
            let (rest, account_ram_deltas) = length_count(
                |input| self.u32_deserializer.deserialize(input),
                |input| self.ram_delta_deserializer.deserialize(input),
            )
            .parse(rest)?;
            let (rest, error_message) = self.error_deserializer.deserialize(rest)?;
            Ok((
                rest,
                TransactionTrace {
                    id,
                    status,
                    cpu_usage_us,
                    net_usage_words,
                    elapsed_us,
                    scheduled,
                    action_traces,
                    account_ram_deltas,
                    error_message,
                },
            ))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ID_SIZE_BYTES;
    use vellum_serialization::DeserializeError;

    fn sample_trace() -> TransactionTrace {
        TransactionTrace {
            id: TransactionId([9; ID_SIZE_BYTES]),
            status: TransactionStatus::Executed,
            cpu_usage_us: 1200,
            net_usage_words: 16,
            elapsed_us: 1534,
            scheduled: false,
            action_traces: vec![ActionTrace {
                receiver: "alice".to_string(),
                action: "transfer".to_string(),
                data: vec![1, 2, 3, 4],
                console: String::new(),
            }],
            account_ram_deltas: vec![AccountDelta {
                account: "alice".to_string(),
                delta: -128,
            }],
            error_message: None,
        }
    }

    #[test]
    fn test_trace_round_trip() {
        let trace = sample_trace();
        let mut buffer = Vec::new();
        TransactionTraceSerializer::new()
            .serialize(&trace, &mut buffer)
            .unwrap();
        let (rest, decoded) = TransactionTraceDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, trace);
    }

    #[test]
    fn test_trace_serialization_leads_with_id() {
        let trace = sample_trace();
        let mut buffer = Vec::new();
        TransactionTraceSerializer::new()
            .serialize(&trace, &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..ID_SIZE_BYTES], trace.id.to_bytes());
    }

    #[test]
    fn test_onblock_detection() {
        let mut trace = sample_trace();
        assert!(!trace.is_onblock());
        trace.action_traces.insert(
            0,
            ActionTrace {
                receiver: SYSTEM_ACCOUNT.to_string(),
                action: ONBLOCK_ACTION.to_string(),
                data: vec![],
                console: String::new(),
            },
        );
        assert!(trace.is_onblock());
    }

    #[test]
    fn test_trace_rejects_bad_status() {
        let trace = sample_trace();
        let mut buffer = Vec::new();
        TransactionTraceSerializer::new()
            .serialize(&trace, &mut buffer)
            .unwrap();
        buffer[ID_SIZE_BYTES] = 200;
        assert!(TransactionTraceDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }
}
