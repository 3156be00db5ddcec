// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Chain-facing data model of the vellum state-history service.
//!
//! Everything the chain runtime hands to the service (block states, execution
//! traces, packed transactions, state deltas) and everything that crosses the
//! wire as a typed field (ids, block positions) is defined here, together
//! with the matching serializer/deserializer pairs.

pub mod block;
pub mod delta;
pub mod error;
pub mod ids;
pub mod serialization;
pub mod trace;

pub use block::{BlockPosition, BlockState};
pub use delta::{DeltaRow, TableDelta};
pub use error::ModelsError;
pub use ids::{BlockId, ChainId, TransactionId, ID_SIZE_BYTES};
pub use trace::{
    AccountDelta, ActionTrace, AugmentedTransactionTrace, PackedTransaction, TransactionStatus,
    TransactionTrace,
};
