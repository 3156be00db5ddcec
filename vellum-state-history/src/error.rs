// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>

use displaydoc::Display;
use thiserror::Error;
use vellum_models::{ModelsError, TransactionId};
use vellum_serialization::SerializeError;

/// State-history error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum StateHistoryError {
    /// io error: {0}
    IoError(#[from] std::io::Error),
    /// storing block {got} would leave a gap: next expected height is {expected}
    Gap {
        /// next height the log accepts
        expected: u32,
        /// height that was offered
        got: u32,
    },
    /// block {0} is outside the log range
    OutOfRange(u32),
    /// parent id mismatch while storing block {0}
    ForkMismatch(u32),
    /// corrupted log entry: {0}
    Corrupted(String),
    /// log entry version {0} does not support pruning
    PruneUnsupported(u32),
    /// unsupported log entry version: {0}
    UnsupportedVersion(u32),
    /// no cached trace for transaction {0} listed in block {1}
    MissingTrace(TransactionId, u32),
    /// serialization error: {0}
    SerializeError(#[from] SerializeError),
    /// deserialization error: {0}
    DeserializeError(String),
    /// models error: {0}
    ModelsError(#[from] ModelsError),
}
