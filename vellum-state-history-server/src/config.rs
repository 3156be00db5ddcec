// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Static configuration of the state-history service.
#[derive(Clone, Debug)]
pub struct StateHistoryConfig {
    /// Directory holding the log/index file pairs.
    pub state_history_dir: PathBuf,
    /// Endpoint the WebSocket listener binds to. Only expose this port to a
    /// trusted network: there is no authentication.
    pub endpoint: SocketAddr,
    /// Keep a log of per-block transaction traces.
    pub trace_history: bool,
    /// Keep a log of per-block chain-state deltas.
    pub chain_state_history: bool,
    /// Include RAM deltas in stored traces.
    pub trace_history_debug_mode: bool,
    /// Purge the state-history directory on startup.
    pub delete_state_history: bool,
    /// Whether the host chain runs replay optimizations that elide trace
    /// data. The service refuses to start when set.
    pub replay_optimizations: bool,
}

impl Default for StateHistoryConfig {
    fn default() -> Self {
        Self {
            state_history_dir: PathBuf::from("state-history"),
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            trace_history: false,
            chain_state_history: false,
            trace_history_debug_mode: false,
            delete_state_history: false,
            replay_optimizations: false,
        }
    }
}
