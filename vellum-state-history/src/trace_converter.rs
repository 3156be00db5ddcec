// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Assembles per-block trace payloads from in-flight transaction events.
//!
//! The converter accumulates the traces the chain applies while producing a
//! block and, when the block is accepted, packs them into one log entry body.
//! Version-1 bodies keep each transaction's signatures and context-free data
//! in a length-prefixed *prunable section* that can later be overwritten in
//! place without moving any other byte of the file.
//!
//! Version-1 body layout:
//!
//! ```text
//! varuint32 count
//! count * ( trace_len: u64 LE | trace_bytes | prunable_len: u64 LE | prunable_bytes )
//! prunable_bytes := 0x01 | varuint32 sig_count | sig* | varuint32 cfd_count | cfd*
//!                 | 0x00 | zero filler                      (after pruning)
//! ```
//!
//! `trace_bytes` leads with the 32-byte transaction id, which is how the
//! pruner matches records without decoding them.

use std::collections::BTreeMap;

use vellum_models::trace::{TransactionTraceDeserializer, TransactionTraceSerializer};
use vellum_models::{
    AugmentedTransactionTrace, BlockState, PackedTransaction, TransactionId, TransactionStatus,
    TransactionTrace, ID_SIZE_BYTES,
};
use vellum_serialization::{
    DeserializeError, Deserializer, Serializer, U32VarIntSerializer, VecU8Deserializer,
    VecU8Serializer,
};

use crate::error::StateHistoryError;
use crate::StateReader;

/// Prunable-section tag: section still carries its data.
const FULL_TAG: u8 = 1;
/// Prunable-section tag: section was overwritten in place.
const PRUNED_TAG: u8 = 0;

/// Decoded prunable section of a version-1 entry transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PrunableData {
    /// signatures and context-free data are still present
    Full {
        /// transaction signatures
        signatures: Vec<Vec<u8>>,
        /// context-free data segments
        context_free_data: Vec<Vec<u8>>,
    },
    /// section was pruned in place
    Pruned,
}

/// One transaction decoded out of a log entry body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryTransaction {
    /// the execution trace
    pub trace: TransactionTrace,
    /// prunable section; `None` for version-0 entries, which store traces only
    pub prunable: Option<PrunableData>,
}

/// Accumulates the current block's traces and packs them on acceptance.
#[derive(Default)]
pub struct TraceConverter {
    cached_traces: BTreeMap<TransactionId, AugmentedTransactionTrace>,
    onblock_trace: Option<AugmentedTransactionTrace>,
}

impl TraceConverter {
    /// Creates an empty converter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops everything accumulated so far. Called when the chain starts
    /// producing a block, including after a production restart at the same
    /// height: traces of the abandoned attempt must not leak into the new one.
    pub fn begin_block(&mut self) {
        self.cached_traces.clear();
        self.onblock_trace = None;
    }

    /// Records one applied transaction.
    ///
    /// The first onblock trace fills the dedicated slot. A scheduled
    /// execution that soft-failed is dropped: the chain retries it and only
    /// the final outcome per id is kept. Everything else is keyed by id,
    /// later attempts overwriting earlier ones.
    pub fn add_transaction(
        &mut self,
        trace: TransactionTrace,
        packed: Option<PackedTransaction>,
    ) {
        if trace.is_onblock() && self.onblock_trace.is_none() {
            self.onblock_trace = Some(AugmentedTransactionTrace { trace, packed });
            return;
        }
        if trace.scheduled && trace.status == TransactionStatus::SoftFail {
            return;
        }
        self.cached_traces
            .insert(trace.id, AugmentedTransactionTrace { trace, packed });
    }

    /// Packs the accumulated traces into the entry body for `block_state`,
    /// consuming the cache. Traces are emitted in the order the block lists
    /// its transactions, followed by implicit traces not reachable from that
    /// list (onblock first). Without `debug_mode` the RAM deltas are elided.
    pub fn pack(
        &mut self,
        db: &dyn StateReader,
        debug_mode: bool,
        block_state: &BlockState,
        version: u32,
    ) -> Result<Vec<u8>, StateHistoryError> {
        let ordered = self.ordered_traces(db, block_state)?;
        match version {
            0 => Self::pack_v0(ordered, debug_mode),
            1 => Self::pack_v1(ordered, debug_mode),
            other => Err(StateHistoryError::UnsupportedVersion(other)),
        }
    }

    fn ordered_traces(
        &mut self,
        db: &dyn StateReader,
        block_state: &BlockState,
    ) -> Result<Vec<AugmentedTransactionTrace>, StateHistoryError> {
        let mut ordered = Vec::with_capacity(self.cached_traces.len() + 1);
        for id in &block_state.transaction_ids {
            let mut augmented = self.cached_traces.remove(id).ok_or(
                StateHistoryError::MissingTrace(*id, block_state.block_num),
            )?;
            if augmented.packed.is_none() {
                augmented.packed = db.packed_transaction(id);
            }
            ordered.push(augmented);
        }
        if let Some(onblock) = self.onblock_trace.take() {
            ordered.push(onblock);
        }
        // whatever remains was not reachable from the block's list
        ordered.extend(std::mem::take(&mut self.cached_traces).into_values());
        Ok(ordered)
    }

    fn pack_v0(
        ordered: Vec<AugmentedTransactionTrace>,
        debug_mode: bool,
    ) -> Result<Vec<u8>, StateHistoryError> {
        let count_serializer = U32VarIntSerializer::new();
        let trace_serializer = TransactionTraceSerializer::new();
        let mut buffer = Vec::new();
        count_serializer.serialize(&(ordered.len() as u32), &mut buffer)?;
        for augmented in ordered {
            let trace = strip_debug(augmented.trace, debug_mode);
            trace_serializer.serialize(&trace, &mut buffer)?;
        }
        Ok(buffer)
    }

    fn pack_v1(
        ordered: Vec<AugmentedTransactionTrace>,
        debug_mode: bool,
    ) -> Result<Vec<u8>, StateHistoryError> {
        let count_serializer = U32VarIntSerializer::new();
        let trace_serializer = TransactionTraceSerializer::new();
        let mut buffer = Vec::new();
        count_serializer.serialize(&(ordered.len() as u32), &mut buffer)?;
        for augmented in ordered {
            let trace = strip_debug(augmented.trace, debug_mode);
            let mut trace_bytes = Vec::new();
            trace_serializer.serialize(&trace, &mut trace_bytes)?;
            let prunable = build_prunable(&augmented.packed)?;
            buffer.extend_from_slice(&(trace_bytes.len() as u64).to_le_bytes());
            buffer.extend_from_slice(&trace_bytes);
            buffer.extend_from_slice(&(prunable.len() as u64).to_le_bytes());
            buffer.extend_from_slice(&prunable);
        }
        Ok(buffer)
    }
}

fn strip_debug(mut trace: TransactionTrace, debug_mode: bool) -> TransactionTrace {
    if !debug_mode {
        trace.account_ram_deltas.clear();
    }
    trace
}

fn build_prunable(
    packed: &Option<PackedTransaction>,
) -> Result<Vec<u8>, StateHistoryError> {
    let count_serializer = U32VarIntSerializer::new();
    let bytes_serializer = VecU8Serializer::new();
    let mut section = vec![FULL_TAG];
    let (signatures, context_free_data): (&[Vec<u8>], &[Vec<u8>]) = match packed {
        Some(packed) => (&packed.signatures, &packed.context_free_data),
        None => (&[], &[]),
    };
    count_serializer.serialize(&(signatures.len() as u32), &mut section)?;
    for signature in signatures {
        bytes_serializer.serialize(signature, &mut section)?;
    }
    count_serializer.serialize(&(context_free_data.len() as u32), &mut section)?;
    for segment in context_free_data {
        bytes_serializer.serialize(segment, &mut section)?;
    }
    Ok(section)
}

/// Overwrites the prunable sections of `ids` inside a version-1 entry body,
/// in place. Matched ids are drained from `ids`. Returns the byte range
/// `(first_modified, end_of_last_modified)` relative to `payload`, or `None`
/// when nothing matched. Record offsets and lengths never change, so the
/// caller can rewrite exactly that region on disk.
pub fn prune_traces(
    payload: &mut [u8],
    version: u32,
    ids: &mut Vec<TransactionId>,
) -> Result<Option<(u64, u64)>, StateHistoryError> {
    if version != 1 {
        return Err(StateHistoryError::PruneUnsupported(version));
    }
    let (count, mut pos) = read_varu32(payload, 0)?;
    let mut first_modified: Option<u64> = None;
    let mut last_end = 0u64;
    for _ in 0..count {
        let (trace_len, after_len) = read_u64_le(payload, pos)?;
        pos = after_len;
        let id = read_id(payload, pos)?;
        pos = checked_advance(payload, pos, trace_len)?;
        let (prunable_len, after_len) = read_u64_le(payload, pos)?;
        pos = after_len;
        let section_start = pos;
        pos = checked_advance(payload, pos, prunable_len)?;
        if prunable_len == 0 {
            return Err(StateHistoryError::Corrupted(
                "empty prunable section".to_string(),
            ));
        }
        if let Some(found) = ids.iter().position(|candidate| *candidate == id) {
            ids.remove(found);
            payload[section_start] = PRUNED_TAG;
            for byte in &mut payload[section_start + 1..pos] {
                *byte = 0;
            }
            if first_modified.is_none() {
                first_modified = Some(section_start as u64);
            }
            last_end = pos as u64;
        }
    }
    Ok(first_modified.map(|start| (start, last_end)))
}

/// Decodes a log entry body back into its transactions. Handles both entry
/// versions; pruned sections decode as [`PrunableData::Pruned`].
pub fn unpack_traces(
    payload: &[u8],
    version: u32,
) -> Result<Vec<EntryTransaction>, StateHistoryError> {
    match version {
        0 => unpack_v0(payload),
        1 => unpack_v1(payload),
        other => Err(StateHistoryError::UnsupportedVersion(other)),
    }
}

fn unpack_v0(payload: &[u8]) -> Result<Vec<EntryTransaction>, StateHistoryError> {
    let trace_deserializer = TransactionTraceDeserializer::new();
    let (count, pos) = read_varu32(payload, 0)?;
    let mut rest = &payload[pos..];
    let mut transactions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (remaining, trace) = trace_deserializer
            .deserialize::<DeserializeError>(rest)
            .map_err(|e| StateHistoryError::DeserializeError(e.to_string()))?;
        rest = remaining;
        transactions.push(EntryTransaction {
            trace,
            prunable: None,
        });
    }
    Ok(transactions)
}

fn unpack_v1(payload: &[u8]) -> Result<Vec<EntryTransaction>, StateHistoryError> {
    let trace_deserializer = TransactionTraceDeserializer::new();
    let (count, mut pos) = read_varu32(payload, 0)?;
    let mut transactions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (trace_len, after_len) = read_u64_le(payload, pos)?;
        pos = after_len;
        let trace_end = checked_advance(payload, pos, trace_len)?;
        let (rest, trace) = trace_deserializer
            .deserialize::<DeserializeError>(&payload[pos..trace_end])
            .map_err(|e| StateHistoryError::DeserializeError(e.to_string()))?;
        if !rest.is_empty() {
            return Err(StateHistoryError::Corrupted(
                "trace bytes longer than the decoded trace".to_string(),
            ));
        }
        pos = trace_end;
        let (prunable_len, after_len) = read_u64_le(payload, pos)?;
        pos = after_len;
        let section_end = checked_advance(payload, pos, prunable_len)?;
        let prunable = decode_prunable(&payload[pos..section_end])?;
        pos = section_end;
        transactions.push(EntryTransaction {
            trace,
            prunable: Some(prunable),
        });
    }
    Ok(transactions)
}

fn decode_prunable(section: &[u8]) -> Result<PrunableData, StateHistoryError> {
    match section.first() {
        Some(&PRUNED_TAG) => Ok(PrunableData::Pruned),
        Some(&FULL_TAG) => {
            let bytes_deserializer = VecU8Deserializer::new(
                std::ops::Bound::Included(0),
                std::ops::Bound::Included(u64::MAX),
            );
            let (signature_count, pos) = read_varu32(section, 1)?;
            let mut rest = &section[pos..];
            let mut signatures = Vec::with_capacity(signature_count as usize);
            for _ in 0..signature_count {
                let (remaining, signature) = bytes_deserializer
                    .deserialize::<DeserializeError>(rest)
                    .map_err(|e| StateHistoryError::DeserializeError(e.to_string()))?;
                rest = remaining;
                signatures.push(signature);
            }
            let (segment_count, pos) = read_varu32(rest, 0)?;
            let mut rest = &rest[pos..];
            let mut context_free_data = Vec::with_capacity(segment_count as usize);
            for _ in 0..segment_count {
                let (remaining, segment) = bytes_deserializer
                    .deserialize::<DeserializeError>(rest)
                    .map_err(|e| StateHistoryError::DeserializeError(e.to_string()))?;
                rest = remaining;
                context_free_data.push(segment);
            }
            Ok(PrunableData::Full {
                signatures,
                context_free_data,
            })
        }
        _ => Err(StateHistoryError::Corrupted(
            "unknown prunable section tag".to_string(),
        )),
    }
}

fn read_varu32(payload: &[u8], pos: usize) -> Result<(u32, usize), StateHistoryError> {
    let slice = payload
        .get(pos..)
        .ok_or_else(|| StateHistoryError::Corrupted("truncated entry body".to_string()))?;
    let (value, rest) = unsigned_varint::decode::u32(slice)
        .map_err(|_| StateHistoryError::Corrupted("bad varint in entry body".to_string()))?;
    Ok((value, payload.len() - rest.len()))
}

fn read_u64_le(payload: &[u8], pos: usize) -> Result<(u64, usize), StateHistoryError> {
    let bytes = payload
        .get(pos..pos + 8)
        .ok_or_else(|| StateHistoryError::Corrupted("truncated entry body".to_string()))?;
    Ok((
        u64::from_le_bytes(bytes.try_into().unwrap()),
        pos + 8,
    ))
}

fn read_id(payload: &[u8], pos: usize) -> Result<TransactionId, StateHistoryError> {
    let bytes = payload
        .get(pos..pos + ID_SIZE_BYTES)
        .ok_or_else(|| StateHistoryError::Corrupted("truncated entry body".to_string()))?;
    Ok(TransactionId(bytes.try_into().unwrap()))
}

fn checked_advance(
    payload: &[u8],
    pos: usize,
    len: u64,
) -> Result<usize, StateHistoryError> {
    let len = usize::try_from(len)
        .map_err(|_| StateHistoryError::Corrupted("oversized entry field".to_string()))?;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| StateHistoryError::Corrupted("truncated entry body".to_string()))?;
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_models::{ActionTrace, BlockId};

    struct EmptyState;

    impl StateReader for EmptyState {
        fn packed_transaction(&self, _id: &TransactionId) -> Option<PackedTransaction> {
            None
        }
        fn table_deltas(&self, _full_snapshot: bool) -> Vec<vellum_models::TableDelta> {
            Vec::new()
        }
    }

    fn tx_id(n: u8) -> TransactionId {
        TransactionId([n; ID_SIZE_BYTES])
    }

    fn user_trace(n: u8) -> TransactionTrace {
        TransactionTrace {
            id: tx_id(n),
            status: TransactionStatus::Executed,
            cpu_usage_us: 100 * n as u32,
            net_usage_words: n as u32,
            elapsed_us: 50,
            scheduled: false,
            action_traces: vec![ActionTrace {
                receiver: "alice".to_string(),
                action: "transfer".to_string(),
                data: vec![n],
                console: String::new(),
            }],
            account_ram_deltas: vec![vellum_models::AccountDelta {
                account: "alice".to_string(),
                delta: 64,
            }],
            error_message: None,
        }
    }

    fn onblock_trace() -> TransactionTrace {
        TransactionTrace {
            id: tx_id(0xb0),
            status: TransactionStatus::Executed,
            cpu_usage_us: 10,
            net_usage_words: 0,
            elapsed_us: 5,
            scheduled: false,
            action_traces: vec![ActionTrace {
                receiver: vellum_models::trace::SYSTEM_ACCOUNT.to_string(),
                action: vellum_models::trace::ONBLOCK_ACTION.to_string(),
                data: vec![],
                console: String::new(),
            }],
            account_ram_deltas: vec![],
            error_message: None,
        }
    }

    fn packed(n: u8) -> PackedTransaction {
        PackedTransaction {
            signatures: vec![vec![n; 65]],
            context_free_data: vec![vec![n, n]],
            packed_body: vec![n; 8],
        }
    }

    fn block_state(ids: &[TransactionId]) -> BlockState {
        BlockState {
            block_num: 7,
            block_id: BlockId([7; ID_SIZE_BYTES]),
            previous_id: BlockId([6; ID_SIZE_BYTES]),
            transaction_ids: ids.to_vec(),
        }
    }

    fn pack_three(version: u32) -> (Vec<u8>, [TransactionId; 3]) {
        let mut converter = TraceConverter::new();
        converter.begin_block();
        converter.add_transaction(user_trace(1), Some(packed(1)));
        converter.add_transaction(user_trace(2), Some(packed(2)));
        converter.add_transaction(user_trace(3), Some(packed(3)));
        let state = block_state(&[tx_id(1), tx_id(2), tx_id(3)]);
        let payload = converter
            .pack(&EmptyState, false, &state, version)
            .unwrap();
        (payload, [tx_id(1), tx_id(2), tx_id(3)])
    }

    #[test]
    fn test_onblock_routed_to_slot() {
        let mut converter = TraceConverter::new();
        converter.begin_block();
        converter.add_transaction(onblock_trace(), None);
        converter.add_transaction(user_trace(1), Some(packed(1)));
        let state = block_state(&[tx_id(1)]);
        let payload = converter.pack(&EmptyState, false, &state, 0).unwrap();
        let transactions = unpack_traces(&payload, 0).unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].trace.id, tx_id(1));
        assert!(transactions[1].trace.is_onblock());
    }

    #[test]
    fn test_begin_block_clears_previous_attempt() {
        let mut converter = TraceConverter::new();
        converter.begin_block();
        converter.add_transaction(user_trace(1), Some(packed(1)));
        converter.begin_block();
        let state = block_state(&[]);
        let payload = converter.pack(&EmptyState, false, &state, 0).unwrap();
        assert!(unpack_traces(&payload, 0).unwrap().is_empty());
    }

    #[test]
    fn test_scheduled_soft_fail_not_cached() {
        let mut converter = TraceConverter::new();
        converter.begin_block();
        let mut retried = user_trace(1);
        retried.scheduled = true;
        retried.status = TransactionStatus::SoftFail;
        converter.add_transaction(retried, None);
        let mut final_attempt = user_trace(1);
        final_attempt.scheduled = true;
        converter.add_transaction(final_attempt.clone(), None);
        let state = block_state(&[tx_id(1)]);
        let payload = converter.pack(&EmptyState, false, &state, 0).unwrap();
        let transactions = unpack_traces(&payload, 0).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].trace.status, TransactionStatus::Executed);
    }

    #[test]
    fn test_duplicate_trace_overwrites() {
        let mut converter = TraceConverter::new();
        converter.begin_block();
        let mut failed = user_trace(2);
        failed.status = TransactionStatus::HardFail;
        converter.add_transaction(failed, Some(packed(2)));
        converter.add_transaction(user_trace(2), Some(packed(2)));
        let state = block_state(&[tx_id(2)]);
        let payload = converter.pack(&EmptyState, false, &state, 0).unwrap();
        let transactions = unpack_traces(&payload, 0).unwrap();
        assert_eq!(transactions[0].trace.status, TransactionStatus::Executed);
    }

    #[test]
    fn test_missing_listed_trace_is_an_error() {
        let mut converter = TraceConverter::new();
        converter.begin_block();
        let state = block_state(&[tx_id(9)]);
        assert!(matches!(
            converter.pack(&EmptyState, false, &state, 0),
            Err(StateHistoryError::MissingTrace(_, 7))
        ));
    }

    #[test]
    fn test_debug_mode_controls_ram_deltas() {
        for (debug_mode, expect_deltas) in [(false, 0usize), (true, 1usize)] {
            let mut converter = TraceConverter::new();
            converter.begin_block();
            converter.add_transaction(user_trace(1), Some(packed(1)));
            let state = block_state(&[tx_id(1)]);
            let payload = converter
                .pack(&EmptyState, debug_mode, &state, 0)
                .unwrap();
            let transactions = unpack_traces(&payload, 0).unwrap();
            assert_eq!(
                transactions[0].trace.account_ram_deltas.len(),
                expect_deltas
            );
        }
    }

    #[test]
    fn test_v1_round_trip_keeps_prunable_data() {
        let (payload, ids) = pack_three(1);
        let transactions = unpack_traces(&payload, 1).unwrap();
        assert_eq!(transactions.len(), 3);
        for (n, transaction) in transactions.iter().enumerate() {
            assert_eq!(transaction.trace.id, ids[n]);
            assert_eq!(
                transaction.prunable,
                Some(PrunableData::Full {
                    signatures: vec![vec![(n + 1) as u8; 65]],
                    context_free_data: vec![vec![(n + 1) as u8, (n + 1) as u8]],
                })
            );
        }
    }

    #[test]
    fn test_prune_marks_only_requested_ids() {
        let (mut payload, _) = pack_three(1);
        let unknown = tx_id(0xee);
        let mut ids = vec![tx_id(2), unknown];
        let range = prune_traces(&mut payload, 1, &mut ids).unwrap().unwrap();
        // only the unknown id is left for the caller
        assert_eq!(ids, vec![unknown]);
        assert!(range.0 < range.1);

        let transactions = unpack_traces(&payload, 1).unwrap();
        assert!(matches!(
            transactions[0].prunable,
            Some(PrunableData::Full { .. })
        ));
        assert_eq!(transactions[1].prunable, Some(PrunableData::Pruned));
        assert!(matches!(
            transactions[2].prunable,
            Some(PrunableData::Full { .. })
        ));
        // traces themselves are untouched
        assert_eq!(transactions[1].trace, {
            let mut t = user_trace(2);
            t.account_ram_deltas.clear();
            t
        });
    }

    #[test]
    fn test_prune_touches_exactly_the_returned_range() {
        let (mut payload, _) = pack_three(1);
        let pristine = payload.clone();
        let mut ids = vec![tx_id(2)];
        let (start, end) = prune_traces(&mut payload, 1, &mut ids).unwrap().unwrap();
        assert_eq!(payload.len(), pristine.len());
        assert_eq!(payload[..start as usize], pristine[..start as usize]);
        assert_eq!(payload[end as usize..], pristine[end as usize..]);
        assert_ne!(payload[start as usize..end as usize], pristine[start as usize..end as usize]);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let (mut payload, _) = pack_three(1);
        let mut ids = vec![tx_id(1), tx_id(3)];
        prune_traces(&mut payload, 1, &mut ids).unwrap();
        let once = payload.clone();
        let mut ids = vec![tx_id(1), tx_id(3)];
        prune_traces(&mut payload, 1, &mut ids).unwrap();
        assert_eq!(payload, once);
    }

    #[test]
    fn test_prune_nothing_matched_returns_none() {
        let (mut payload, _) = pack_three(1);
        let pristine = payload.clone();
        let mut ids = vec![tx_id(0xaa)];
        assert!(prune_traces(&mut payload, 1, &mut ids).unwrap().is_none());
        assert_eq!(payload, pristine);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_prune_rejects_v0() {
        let (mut payload, _) = pack_three(0);
        let mut ids = vec![tx_id(1)];
        assert!(matches!(
            prune_traces(&mut payload, 0, &mut ids),
            Err(StateHistoryError::PruneUnsupported(0))
        ));
    }
}
