// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Per-connection state machine.
//!
//! A session sends the ABI greeting as its only text frame, then loops over
//! three wake-ups: an incoming client frame, a block notification from the
//! service, and the stopping flag. One result frame is in flight at a time;
//! after every wake-up the session drains as many updates as its credit
//! allows. Any error closes the session without touching the rest of the
//! service.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vellum_models::BlockPosition;
use vellum_serialization::{DeserializeError, Deserializer, Serializer};
use vellum_state_history::abi::STATE_HISTORY_ABI;
use vellum_state_history::protocol::{
    GetBlocksRequestV0, GetBlocksResultV0, StateRequest, StateRequestDeserializer, StateResult,
    StateResultSerializer,
};

use crate::error::StateHistoryServerError;
use crate::service::StateHistoryService;

/// Cursor, credit and filters of one session, independent of the socket.
#[derive(Default)]
pub(crate) struct SessionCore {
    pub(crate) current_request: Option<GetBlocksRequestV0>,
    pub(crate) need_to_send_update: bool,
}

impl SessionCore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs a subscription after rewinding its cursor to the deepest
    /// height where the client's positions still agree with ours. Positions
    /// at or above the requested start are ignored; the negotiation set is
    /// consumed here.
    pub(crate) fn install_request(
        &mut self,
        mut request: GetBlocksRequestV0,
        service: &StateHistoryService,
    ) {
        for position in std::mem::take(&mut request.have_positions) {
            if request.start_block_num <= position.block_num {
                continue;
            }
            let known = service.resolve_block_id(position.block_num);
            if known != Some(position.block_id) {
                request.start_block_num = request.start_block_num.min(position.block_num);
            }
        }
        self.current_request = Some(request);
        self.need_to_send_update = true;
    }

    /// Grants more send credit. Ignored without an active subscription.
    pub(crate) fn add_credit(&mut self, num_messages: u32) {
        if let Some(request) = &mut self.current_request {
            request.max_messages_in_flight =
                request.max_messages_in_flight.saturating_add(num_messages);
        }
    }

    /// Reacts to an accepted block: a block below the cursor means a shorter
    /// fork has overtaken the stream, so the cursor rewinds to it.
    pub(crate) fn on_block_accepted(&mut self, block_num: u32) {
        if let Some(request) = &mut self.current_request {
            if block_num < request.start_block_num {
                request.start_block_num = block_num;
            }
        }
        self.need_to_send_update = true;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.need_to_send_update = true;
    }

    /// Produces at most one result frame, spending one credit. Returns
    /// `None` when there is nothing to send: no subscription, no credit, or
    /// the tail-follower flag is clear.
    ///
    /// A cursor within range is advanced even when the block id cannot be
    /// resolved; such blocks are skipped rather than blocking the stream.
    pub(crate) fn next_update(
        &mut self,
        service: &StateHistoryService,
    ) -> Result<Option<GetBlocksResultV0>, StateHistoryServerError> {
        let request = match &mut self.current_request {
            Some(request) => request,
            None => return Ok(None),
        };
        if !self.need_to_send_update || request.max_messages_in_flight == 0 {
            return Ok(None);
        }
        let head = service.chain().head();
        let last_irreversible = service.chain().last_irreversible();
        let current = if request.irreversible_only {
            last_irreversible.block_num
        } else {
            head.block_num
        };
        let mut result = GetBlocksResultV0 {
            head,
            last_irreversible,
            this_block: None,
            prev_block: None,
            block: None,
            traces: None,
            deltas: None,
        };
        if request.start_block_num <= current && request.start_block_num < request.end_block_num {
            let block_num = request.start_block_num;
            if let Some(block_id) = service.resolve_block_id(block_num) {
                result.this_block = Some(BlockPosition {
                    block_num,
                    block_id,
                });
                if let Some(prev_num) = block_num.checked_sub(1) {
                    if let Some(prev_id) = service.resolve_block_id(prev_num) {
                        result.prev_block = Some(BlockPosition {
                            block_num: prev_num,
                            block_id: prev_id,
                        });
                    }
                }
                if request.fetch_block {
                    result.block = service.chain().fetch_block_by_number(block_num);
                }
                if request.fetch_traces {
                    if let Some(log) = service.trace_log() {
                        let log = log.read();
                        if log.contains(block_num) {
                            result.traces = Some(log.get_log_entry(block_num)?.payload);
                        }
                    }
                }
                if request.fetch_deltas {
                    if let Some(log) = service.chain_state_log() {
                        let log = log.read();
                        if log.contains(block_num) {
                            result.deltas = Some(log.get_log_entry(block_num)?.payload);
                        }
                    }
                }
            }
            request.start_block_num += 1;
        }
        request.max_messages_in_flight -= 1;
        self.need_to_send_update = request.start_block_num <= current
            && request.start_block_num < request.end_block_num;
        Ok(Some(result))
    }
}

/// Runs one session to completion and removes it from the registry.
pub(crate) async fn run_session(
    service: Arc<StateHistoryService>,
    socket: WebSocket,
    session_id: u64,
) {
    match session_loop(&service, socket).await {
        Ok(()) => info!("session {} closed", session_id),
        Err(err) => warn!("session {} closed: {}", session_id, err),
    }
    service.unregister_session(session_id);
}

async fn session_loop(
    service: &Arc<StateHistoryService>,
    mut socket: WebSocket,
) -> Result<(), StateHistoryServerError> {
    // the greeting is the only text frame; everything after is binary
    socket
        .send(Message::Text(STATE_HISTORY_ABI.to_string()))
        .await
        .map_err(|_| StateHistoryServerError::ConnectionDropped)?;

    let mut block_events = service.subscribe_blocks();
    let mut stop = service.subscribe_stop();
    let mut core = SessionCore::new();
    let request_deserializer = StateRequestDeserializer::new();
    let result_serializer = StateResultSerializer::new();

    loop {
        tokio::select! {
            message = socket.recv() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    // client went away
                    Some(Err(_)) | None => return Ok(()),
                };
                match message {
                    Message::Binary(bytes) => {
                        let request = decode_request(&request_deserializer, &bytes)?;
                        handle_request(
                            request,
                            &mut core,
                            service,
                            &mut socket,
                            &result_serializer,
                        )
                        .await?;
                    }
                    Message::Close(_) => return Ok(()),
                    Message::Ping(payload) => {
                        socket
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|_| StateHistoryServerError::ConnectionDropped)?;
                    }
                    Message::Pong(_) => {}
                    Message::Text(_) => {
                        return Err(StateHistoryServerError::ProtocolError(
                            "unexpected text frame".to_string(),
                        ));
                    }
                }
            }
            event = block_events.recv() => {
                match event {
                    Ok(event) => core.on_block_accepted(event.block_num),
                    // fell behind the fan-out; the logs still have everything
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("session lagged {} block events", skipped);
                        core.mark_dirty();
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
                drain_updates(&mut core, service, &mut socket, &result_serializer).await?;
            }
            _ = stop.changed() => return Ok(()),
        }
    }
}

fn decode_request(
    deserializer: &StateRequestDeserializer,
    bytes: &[u8],
) -> Result<StateRequest, StateHistoryServerError> {
    let (rest, request) = deserializer
        .deserialize::<DeserializeError>(bytes)
        .map_err(|err| StateHistoryServerError::ProtocolError(err.to_string()))?;
    if !rest.is_empty() {
        return Err(StateHistoryServerError::ProtocolError(
            "trailing bytes after request".to_string(),
        ));
    }
    Ok(request)
}

async fn handle_request(
    request: StateRequest,
    core: &mut SessionCore,
    service: &Arc<StateHistoryService>,
    socket: &mut WebSocket,
    serializer: &StateResultSerializer,
) -> Result<(), StateHistoryServerError> {
    match request {
        StateRequest::GetStatus => {
            send_result(
                socket,
                serializer,
                &StateResult::Status(service.status_result()),
            )
            .await?;
        }
        StateRequest::GetBlocks(request) => {
            core.install_request(request, service);
        }
        StateRequest::GetBlocksAck(ack) => {
            core.add_credit(ack.num_messages);
        }
    }
    drain_updates(core, service, socket, serializer).await
}

async fn drain_updates(
    core: &mut SessionCore,
    service: &Arc<StateHistoryService>,
    socket: &mut WebSocket,
    serializer: &StateResultSerializer,
) -> Result<(), StateHistoryServerError> {
    while let Some(result) = core.next_update(service)? {
        send_result(
            socket,
            serializer,
            &StateResult::GetBlocks(Box::new(result)),
        )
        .await?;
    }
    Ok(())
}

async fn send_result(
    socket: &mut WebSocket,
    serializer: &StateResultSerializer,
    result: &StateResult,
) -> Result<(), StateHistoryServerError> {
    let mut buffer = Vec::new();
    serializer.serialize(result, &mut buffer)?;
    socket
        .send(Message::Binary(buffer))
        .await
        .map_err(|_| StateHistoryServerError::ConnectionDropped)
}
