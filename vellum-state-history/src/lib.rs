// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Per-block execution history: append-only logs, trace packing, wire protocol.
//!
//! This crate holds everything the state-history server persists and serves,
//! independent of any transport:
//! * [`log::HistoryLog`] — an append-only file of per-block entries with a
//!   parallel index file, used once for transaction traces and once for
//!   chain-state deltas;
//! * [`trace_converter::TraceConverter`] — turns the stream of per-transaction
//!   execution events into one packed, prunable payload per accepted block;
//! * [`chain_state`] — packing of per-block table deltas;
//! * [`protocol`] — the typed request/result variants exchanged on the wire;
//! * [`abi`] — the frozen schema greeting sent to every client.

#![warn(missing_docs)]

pub mod abi;
pub mod chain_state;
pub mod error;
pub mod log;
pub mod protocol;
pub mod trace_converter;

use vellum_models::{PackedTransaction, TableDelta, TransactionId};

pub use error::StateHistoryError;

/// Entry format written to the trace log: prunable per-transaction records.
pub const TRACE_LOG_ENTRY_VERSION: u32 = 1;
/// Entry format written to the chain-state log: plain packed deltas.
pub const CHAIN_STATE_LOG_ENTRY_VERSION: u32 = 0;

/// Read-only view of the chain database, supplied by the host node.
///
/// The history service never interprets chain state itself; it only asks for
/// the few pieces the log payloads are built from.
pub trait StateReader: Send + Sync {
    /// Packed form of a transaction known to the chain, if still available.
    /// Queried for traces whose packed transaction did not accompany the
    /// execution event (scheduled executions).
    fn packed_transaction(&self, id: &TransactionId) -> Option<PackedTransaction>;

    /// Table changes of the block being stored. With `full_snapshot` the
    /// entire current state is returned instead of the per-block changes;
    /// requested for the first entry of a fresh chain-state log.
    fn table_deltas(&self, full_snapshot: bool) -> Vec<TableDelta>;
}
