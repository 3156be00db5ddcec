// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Read-only facade over the chain runtime.

use vellum_models::{BlockId, BlockPosition, ChainId};
use vellum_state_history::StateReader;

/// What the history service is allowed to ask the chain.
///
/// Implementations are queried from session tasks and from the chain-event
/// hooks; they must be cheap and must never block on chain progress.
pub trait BlockAccessor: Send + Sync {
    /// Packed signed block at `block_num`, if the chain still holds it.
    /// Absence is not an error; the result is simply served without it.
    fn fetch_block_by_number(&self, block_num: u32) -> Option<Vec<u8>>;

    /// Id of the block at `block_num`, if known to the chain.
    fn block_id_for_number(&self, block_num: u32) -> Option<BlockId>;

    /// Current chain head.
    fn head(&self) -> BlockPosition;

    /// Last irreversible block.
    fn last_irreversible(&self) -> BlockPosition;

    /// Identifier of the chain being served.
    fn chain_id(&self) -> ChainId;

    /// Read handle over the chain database, used when packing entries.
    fn state_reader(&self) -> &dyn StateReader;
}
