// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Test fixtures: an in-memory chain the service can run against.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::TempDir;
use vellum_models::{
    ActionTrace, BlockId, BlockPosition, BlockState, ChainId, PackedTransaction, TableDelta,
    TransactionId, TransactionStatus, TransactionTrace, ID_SIZE_BYTES,
};
use vellum_state_history::StateReader;

use crate::{BlockAccessor, StateHistoryConfig, StateHistoryService};

pub(crate) fn block_id(n: u32) -> BlockId {
    let mut bytes = [0u8; ID_SIZE_BYTES];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    BlockId(bytes)
}

pub(crate) fn forked_block_id(n: u32) -> BlockId {
    let mut bytes = [0xf0u8; ID_SIZE_BYTES];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    BlockId(bytes)
}

pub(crate) fn tx_id(n: u8) -> TransactionId {
    TransactionId([n; ID_SIZE_BYTES])
}

pub(crate) fn user_trace(n: u8) -> TransactionTrace {
    TransactionTrace {
        id: tx_id(n),
        status: TransactionStatus::Executed,
        cpu_usage_us: 250,
        net_usage_words: 4,
        elapsed_us: 90,
        scheduled: false,
        action_traces: vec![ActionTrace {
            receiver: "alice".to_string(),
            action: "transfer".to_string(),
            data: vec![n],
            console: String::new(),
        }],
        account_ram_deltas: vec![],
        error_message: None,
    }
}

pub(crate) fn packed_tx(n: u8) -> PackedTransaction {
    PackedTransaction {
        signatures: vec![vec![n; 65]],
        context_free_data: vec![],
        packed_body: vec![n; 16],
    }
}

#[derive(Default)]
struct MockChainState {
    head: Option<BlockPosition>,
    last_irreversible: Option<BlockPosition>,
    block_ids: HashMap<u32, BlockId>,
    packed_blocks: HashMap<u32, Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct MockStateReader {
    packed: RwLock<HashMap<TransactionId, PackedTransaction>>,
    deltas: RwLock<Vec<TableDelta>>,
}

impl StateReader for MockStateReader {
    fn packed_transaction(&self, id: &TransactionId) -> Option<PackedTransaction> {
        self.packed.read().get(id).cloned()
    }

    fn table_deltas(&self, _full_snapshot: bool) -> Vec<TableDelta> {
        self.deltas.read().clone()
    }
}

/// A chain the tests drive by hand.
#[derive(Default)]
pub(crate) struct MockChain {
    state: RwLock<MockChainState>,
    reader: MockStateReader,
}

impl MockChain {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_head(&self, position: BlockPosition) {
        let mut state = self.state.write();
        state.block_ids.insert(position.block_num, position.block_id);
        state.head = Some(position);
        if state.last_irreversible.is_none() {
            state.last_irreversible = Some(position);
        }
    }

    pub(crate) fn set_last_irreversible(&self, position: BlockPosition) {
        self.state.write().last_irreversible = Some(position);
    }

    pub(crate) fn insert_block(&self, block_num: u32, id: BlockId, packed: Vec<u8>) {
        let mut state = self.state.write();
        state.block_ids.insert(block_num, id);
        state.packed_blocks.insert(block_num, packed);
    }

    pub(crate) fn insert_packed_transaction(&self, id: TransactionId, packed: PackedTransaction) {
        self.reader.packed.write().insert(id, packed);
    }

    pub(crate) fn set_deltas(&self, deltas: Vec<TableDelta>) {
        *self.reader.deltas.write() = deltas;
    }
}

impl BlockAccessor for MockChain {
    fn fetch_block_by_number(&self, block_num: u32) -> Option<Vec<u8>> {
        self.state.read().packed_blocks.get(&block_num).cloned()
    }

    fn block_id_for_number(&self, block_num: u32) -> Option<BlockId> {
        self.state.read().block_ids.get(&block_num).copied()
    }

    fn head(&self) -> BlockPosition {
        self.state.read().head.unwrap_or(BlockPosition {
            block_num: 0,
            block_id: block_id(0),
        })
    }

    fn last_irreversible(&self) -> BlockPosition {
        self.state.read().last_irreversible.unwrap_or(BlockPosition {
            block_num: 0,
            block_id: block_id(0),
        })
    }

    fn chain_id(&self) -> ChainId {
        ChainId([0xcc; ID_SIZE_BYTES])
    }

    fn state_reader(&self) -> &dyn StateReader {
        &self.reader
    }
}

pub(crate) fn test_config(dir: &TempDir) -> StateHistoryConfig {
    StateHistoryConfig {
        state_history_dir: dir.path().to_path_buf(),
        trace_history: true,
        chain_state_history: true,
        ..Default::default()
    }
}

pub(crate) fn block_state_for(
    block_num: u32,
    previous_id: BlockId,
    transaction_ids: Vec<TransactionId>,
) -> BlockState {
    BlockState {
        block_num,
        block_id: block_id(block_num),
        previous_id,
        transaction_ids,
    }
}

/// Runs the three chain hooks for one block carrying `traces`, advancing the
/// mock chain's head first so sessions observe a consistent view.
pub(crate) fn drive_block(
    service: &StateHistoryService,
    chain: &MockChain,
    block_num: u32,
    traces: Vec<(TransactionTrace, Option<PackedTransaction>)>,
) {
    service.block_started(block_num);
    let transaction_ids = traces.iter().map(|(trace, _)| trace.id).collect();
    for (trace, packed) in traces {
        service.transaction_applied(trace, packed);
    }
    let block_state = block_state_for(block_num, block_id(block_num - 1), transaction_ids);
    chain.set_head(block_state.position());
    service
        .block_accepted(&block_state)
        .expect("block store failed");
}
