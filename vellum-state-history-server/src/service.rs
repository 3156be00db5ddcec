// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! The service singleton: log ownership, chain hooks, fan-out, listener.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use vellum_models::{
    BlockId, BlockState, PackedTransaction, TransactionId, TransactionTrace,
};
use vellum_state_history::log::HistoryLog;
use vellum_state_history::protocol::GetStatusResultV0;
use vellum_state_history::trace_converter::TraceConverter;
use vellum_state_history::{
    chain_state, CHAIN_STATE_LOG_ENTRY_VERSION, TRACE_LOG_ENTRY_VERSION,
};

use crate::accessor::BlockAccessor;
use crate::config::StateHistoryConfig;
use crate::error::StateHistoryServerError;
use crate::session;

const TRACE_LOG_NAME: &str = "trace_history";
const CHAIN_STATE_LOG_NAME: &str = "chain_state_history";
/// Send/receive buffer size of the listener sockets.
const SOCKET_BUFFER_BYTES: usize = 1024 * 1024;
/// Fan-out channel depth; sessions that lag further re-sync from the logs.
const BLOCK_EVENT_CAPACITY: usize = 256;

/// Notification fanned out to sessions when a block was stored.
#[derive(Clone, Copy, Debug)]
pub struct BlockEvent {
    /// height of the accepted block
    pub block_num: u32,
    /// id of the accepted block
    pub block_id: BlockId,
}

/// Owns the history logs, the trace converter and the session set, and
/// bridges the chain's block lifecycle into client-visible streams.
pub struct StateHistoryService {
    config: StateHistoryConfig,
    chain: Arc<dyn BlockAccessor>,
    trace_log: Option<RwLock<HistoryLog>>,
    chain_state_log: Option<RwLock<HistoryLog>>,
    converter: Mutex<TraceConverter>,
    block_events: broadcast::Sender<BlockEvent>,
    stop: watch::Sender<bool>,
    sessions: Mutex<HashSet<u64>>,
    next_session_id: AtomicU64,
}

impl StateHistoryService {
    /// Creates the service: validates the chain configuration, prepares the
    /// state-history directory and opens the enabled logs.
    pub fn new(
        config: StateHistoryConfig,
        chain: Arc<dyn BlockAccessor>,
    ) -> Result<Arc<Self>, StateHistoryServerError> {
        if config.replay_optimizations {
            return Err(StateHistoryServerError::ReplayOptimizationsEnabled);
        }
        if config.delete_state_history {
            info!("deleting state history");
            match std::fs::remove_dir_all(&config.state_history_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        std::fs::create_dir_all(&config.state_history_dir)?;

        let trace_log = config
            .trace_history
            .then(|| HistoryLog::open(&config.state_history_dir, TRACE_LOG_NAME))
            .transpose()?
            .map(RwLock::new);
        let chain_state_log = config
            .chain_state_history
            .then(|| HistoryLog::open(&config.state_history_dir, CHAIN_STATE_LOG_NAME))
            .transpose()?
            .map(RwLock::new);

        let (block_events, _) = broadcast::channel(BLOCK_EVENT_CAPACITY);
        let (stop, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            chain,
            trace_log,
            chain_state_log,
            converter: Mutex::new(TraceConverter::new()),
            block_events,
            stop,
            sessions: Mutex::new(HashSet::new()),
            next_session_id: AtomicU64::new(0),
        }))
    }

    /// True once [`stop`](Self::stop) was called; hooks and queued session
    /// work observe this and return without effect.
    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Disconnects the service: sessions close, the listener drains, hooks
    /// become no-ops.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Chain hook: block production starts at `block_num`. Clears the trace
    /// converter, dropping any traces of an abandoned production attempt.
    pub fn block_started(&self, _block_num: u32) {
        if self.is_stopping() {
            return;
        }
        if self.trace_log.is_some() {
            self.converter.lock().begin_block();
        }
    }

    /// Chain hook: one transaction was applied while producing the current
    /// block.
    pub fn transaction_applied(
        &self,
        trace: TransactionTrace,
        packed: Option<PackedTransaction>,
    ) {
        if self.is_stopping() {
            return;
        }
        if self.trace_log.is_some() {
            self.converter.lock().add_transaction(trace, packed);
        }
    }

    /// Chain hook: `block_state` was accepted into the chain. Packs and
    /// appends the entries for the enabled logs, then notifies every
    /// session. An error here is fatal to history collection; the host node
    /// must treat it as such rather than continue with silent gaps.
    pub fn block_accepted(
        &self,
        block_state: &BlockState,
    ) -> Result<(), StateHistoryServerError> {
        if self.is_stopping() {
            return Ok(());
        }
        if let Some(log) = &self.trace_log {
            let body = self.converter.lock().pack(
                self.chain.state_reader(),
                self.config.trace_history_debug_mode,
                block_state,
                TRACE_LOG_ENTRY_VERSION,
            )?;
            log.write().store(
                block_state.block_num,
                &block_state.block_id,
                &block_state.previous_id,
                TRACE_LOG_ENTRY_VERSION,
                &body,
            )?;
        }
        if let Some(log) = &self.chain_state_log {
            let full_snapshot = log.read().is_empty();
            let deltas = self.chain.state_reader().table_deltas(full_snapshot);
            let body = chain_state::pack_deltas(&deltas)?;
            log.write().store(
                block_state.block_num,
                &block_state.block_id,
                &block_state.previous_id,
                CHAIN_STATE_LOG_ENTRY_VERSION,
                &body,
            )?;
        }
        // no receiver just means no session is connected
        let _ = self.block_events.send(BlockEvent {
            block_num: block_state.block_num,
            block_id: block_state.block_id,
        });
        Ok(())
    }

    /// Prunes signatures and context-free data of `ids` from the trace log
    /// entry at `block_num`. Matched ids are drained from `ids`.
    pub fn prune_transactions(
        &self,
        block_num: u32,
        ids: &mut Vec<TransactionId>,
    ) -> Result<(), StateHistoryServerError> {
        let log = self
            .trace_log
            .as_ref()
            .ok_or_else(|| StateHistoryServerError::ServeError("trace history disabled".into()))?;
        log.write().prune_transactions(block_num, ids)?;
        Ok(())
    }

    /// Server status served to `get_status_request_v0`.
    pub fn status_result(&self) -> GetStatusResultV0 {
        let (trace_begin_block, trace_end_block) = self.log_range(&self.trace_log);
        let (chain_state_begin_block, chain_state_end_block) =
            self.log_range(&self.chain_state_log);
        GetStatusResultV0 {
            head: self.chain.head(),
            last_irreversible: self.chain.last_irreversible(),
            chain_id: self.chain.chain_id(),
            trace_begin_block,
            trace_end_block,
            chain_state_begin_block,
            chain_state_end_block,
        }
    }

    fn log_range(&self, log: &Option<RwLock<HistoryLog>>) -> (u32, u32) {
        log.as_ref()
            .map(|log| {
                let log = log.read();
                (log.begin_block(), log.end_block())
            })
            .unwrap_or((0, 0))
    }

    /// Looks up the id of the block at `block_num`: trace log first, then
    /// chain-state log, then the chain itself.
    pub fn resolve_block_id(&self, block_num: u32) -> Option<BlockId> {
        for log in [&self.trace_log, &self.chain_state_log] {
            if let Some(log) = log {
                let log = log.read();
                if log.contains(block_num) {
                    return log.get_block_id(block_num).ok();
                }
            }
        }
        self.chain.block_id_for_number(block_num)
    }

    pub(crate) fn chain(&self) -> &dyn BlockAccessor {
        self.chain.as_ref()
    }

    pub(crate) fn trace_log(&self) -> Option<&RwLock<HistoryLog>> {
        self.trace_log.as_ref()
    }

    pub(crate) fn chain_state_log(&self) -> Option<&RwLock<HistoryLog>> {
        self.chain_state_log.as_ref()
    }

    pub(crate) fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_events.subscribe()
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn register_session(&self) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(session_id);
        info!("incoming connection, session {}", session_id);
        session_id
    }

    pub(crate) fn unregister_session(&self, session_id: u64) {
        self.sessions.lock().remove(&session_id);
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Binds the configured endpoint and serves WebSocket sessions until
    /// [`stop`](Self::stop) is called. Per-connection accept errors are
    /// absorbed by the HTTP stack, which keeps accepting.
    pub async fn serve(self: &Arc<Self>) -> Result<(), StateHistoryServerError> {
        let listener = bind_listener(self.config.endpoint)?;
        let router = Router::new()
            .route("/", get(ws_handler))
            .with_state(self.clone());
        let mut stop = self.subscribe_stop();
        info!("state history listening on {}", self.config.endpoint);
        axum::Server::from_tcp(listener)
            .map_err(|err| StateHistoryServerError::ServeError(err.to_string()))?
            .tcp_nodelay(true)
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            })
            .await
            .map_err(|err| StateHistoryServerError::ServeError(err.to_string()))
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<StateHistoryService>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if service.is_stopping() {
            return;
        }
        let session_id = service.register_session();
        session::run_session(service, socket, session_id).await;
    })
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    if let Err(err) = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!("could not size send buffer: {}", err);
    }
    if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!("could not size receive buffer: {}", err);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    // connection backlog, matching what tokio uses
    socket.listen(1024)?;
    Ok(socket.into())
}
