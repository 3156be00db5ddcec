// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>

use displaydoc::Display;
use thiserror::Error;
use vellum_serialization::SerializeError;
use vellum_state_history::StateHistoryError;

/// State-history server error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum StateHistoryServerError {
    /// io error: {0}
    IoError(#[from] std::io::Error),
    /// the chain is configured with replay optimizations that elide trace data
    ReplayOptimizationsEnabled,
    /// history error: {0}
    HistoryError(#[from] StateHistoryError),
    /// serialization error: {0}
    SerializeError(#[from] SerializeError),
    /// protocol error: {0}
    ProtocolError(String),
    /// server error: {0}
    ServeError(String),
    /// session channel closed
    ConnectionDropped,
}
