// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Packing of per-block chain-state deltas into log entry bodies.
//!
//! Chain-state entries are version 0: a plain packed sequence with no
//! prunable sections. The first entry of a fresh log holds a full snapshot
//! of every table instead of the per-block changes, so consumers can
//! reconstruct state without replaying from genesis.

use vellum_models::delta::{TableDeltaDeserializer, TableDeltaSerializer};
use vellum_models::TableDelta;
use vellum_serialization::{
    DeserializeError, Deserializer, Serializer, U32VarIntSerializer,
};

use crate::error::StateHistoryError;

/// Packs table deltas into a chain-state entry body.
pub fn pack_deltas(deltas: &[TableDelta]) -> Result<Vec<u8>, StateHistoryError> {
    let count_serializer = U32VarIntSerializer::new();
    let delta_serializer = TableDeltaSerializer::new();
    let mut buffer = Vec::new();
    count_serializer.serialize(&(deltas.len() as u32), &mut buffer)?;
    for delta in deltas {
        delta_serializer.serialize(delta, &mut buffer)?;
    }
    Ok(buffer)
}

/// Decodes a chain-state entry body back into table deltas.
pub fn unpack_deltas(payload: &[u8]) -> Result<Vec<TableDelta>, StateHistoryError> {
    let delta_deserializer = TableDeltaDeserializer::new();
    let (count, mut rest) = unsigned_varint::decode::u32(payload)
        .map_err(|_| StateHistoryError::DeserializeError("bad delta count".to_string()))?;
    let mut deltas = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (remaining, delta) = delta_deserializer
            .deserialize::<DeserializeError>(rest)
            .map_err(|e| StateHistoryError::DeserializeError(e.to_string()))?;
        rest = remaining;
        deltas.push(delta);
    }
    Ok(deltas)
}
