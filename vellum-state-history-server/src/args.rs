// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;

use crate::config::StateHistoryConfig;

/// Command-line surface of the state-history service, flattened into the
/// host node's CLI.
#[derive(Debug, Clone, Args)]
pub struct StateHistoryArgs {
    /// Location of the state-history directory
    #[arg(long, default_value = "state-history")]
    pub state_history_dir: PathBuf,

    /// Clear state-history files on startup
    #[arg(long)]
    pub delete_state_history: bool,

    /// Enable trace history
    #[arg(long)]
    pub trace_history: bool,

    /// Enable chain-state history
    #[arg(long)]
    pub chain_state_history: bool,

    /// Include RAM deltas in trace history
    #[arg(long)]
    pub trace_history_debug_mode: bool,

    /// Endpoint to listen on. Caution: only expose this port to your
    /// internal network.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub state_history_endpoint: SocketAddr,
}

impl StateHistoryArgs {
    /// Builds the service configuration. `replay_optimizations` reflects the
    /// host chain's replay settings; the service refuses to start when the
    /// chain would elide trace data.
    pub fn into_config(self, replay_optimizations: bool) -> StateHistoryConfig {
        StateHistoryConfig {
            state_history_dir: self.state_history_dir,
            endpoint: self.state_history_endpoint,
            trace_history: self.trace_history,
            chain_state_history: self.chain_state_history,
            trace_history_debug_mode: self.trace_history_debug_mode,
            delete_state_history: self.delete_state_history,
            replay_optimizations,
        }
    }
}
