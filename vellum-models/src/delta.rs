// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Chain-state deltas: per-table row changes recorded for each block.

use crate::serialization::{StringDeserializer, StringSerializer};
use nom::error::{context, ContextError, ParseError};
use nom::multi::length_count;
use nom::{IResult, Parser};
use std::ops::Bound::Included;
use vellum_serialization::{
    BoolDeserializer, BoolSerializer, Deserializer, SerializeError, Serializer,
    U32VarIntDeserializer, U32VarIntSerializer, VecU8Deserializer, VecU8Serializer,
};

const MAX_TABLE_NAME_LENGTH: u32 = 256;

/// One changed row: the row's serialized state, or a deletion marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeltaRow {
    /// true if the row exists after the block, false if it was deleted
    pub present: bool,
    /// serialized row state (empty on deletion)
    pub data: Vec<u8>,
}

/// All row changes of one chain-database table for one block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableDelta {
    /// table name
    pub name: String,
    /// changed rows
    pub rows: Vec<DeltaRow>,
}

/// Serializer for `TableDelta`
#[derive(Clone, Default)]
pub struct TableDeltaSerializer {
    name_serializer: StringSerializer,
    count_serializer: U32VarIntSerializer,
    bool_serializer: BoolSerializer,
    data_serializer: VecU8Serializer,
}

impl TableDeltaSerializer {
    /// Creates a new serializer for `TableDelta`
    pub fn new() -> Self {
        Self {
            name_serializer: StringSerializer::new(),
            count_serializer: U32VarIntSerializer::new(),
            bool_serializer: BoolSerializer::new(),
            data_serializer: VecU8Serializer::new(),
        }
    }
}

impl Serializer<TableDelta> for TableDeltaSerializer {
    fn serialize(&self, value: &TableDelta, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.name_serializer.serialize(&value.name, buffer)?;
        let count: u32 = value.rows.len().try_into().map_err(|_| {
            SerializeError::GeneralError(format!("row count {} overflows u32", value.rows.len()))
        })?;
        self.count_serializer.serialize(&count, buffer)?;
        for row in &value.rows {
            self.bool_serializer.serialize(&row.present, buffer)?;
            self.data_serializer.serialize(&row.data, buffer)?;
        }
        Ok(())
    }
}

/// Deserializer for `TableDelta`
#[derive(Clone)]
pub struct TableDeltaDeserializer {
    name_deserializer: StringDeserializer,
    count_deserializer: U32VarIntDeserializer,
    bool_deserializer: BoolDeserializer,
    data_deserializer: VecU8Deserializer,
}

impl TableDeltaDeserializer {
    /// Creates a new deserializer for `TableDelta`
    pub fn new() -> Self {
        Self {
            name_deserializer: StringDeserializer::new(MAX_TABLE_NAME_LENGTH),
            count_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            bool_deserializer: BoolDeserializer::new(),
            data_deserializer: VecU8Deserializer::new(Included(0), Included(u64::MAX)),
        }
    }
}

impl Deserializer<TableDelta> for TableDeltaDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], TableDelta, E> {
        context("Failed TableDelta deserialization", |input| {
            let (rest, name) = self.name_deserializer.deserialize(input)?;
            let (rest, rows) = length_count(
                |input| self.count_deserializer.deserialize(input),
                |input| {
                    let (rest, present) = self.bool_deserializer.deserialize(input)?;
                    let (rest, data) = self.data_deserializer.deserialize(rest)?;
                    Ok((rest, DeltaRow { present, data }))
                },
            )
            .parse(rest)?;
            Ok((rest, TableDelta { name, rows }))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_serialization::DeserializeError;

    #[test]
    fn test_table_delta_round_trip() {
        let delta = TableDelta {
            name: "accounts".to_string(),
            rows: vec![
                DeltaRow {
                    present: true,
                    data: vec![1, 2, 3],
                },
                DeltaRow {
                    present: false,
                    data: vec![],
                },
            ],
        };
        let mut buffer = Vec::new();
        TableDeltaSerializer::new()
            .serialize(&delta, &mut buffer)
            .unwrap();
        let (rest, decoded) = TableDeltaDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, delta);
    }
}
