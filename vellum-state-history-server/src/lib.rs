// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Streaming server exposing the node's per-block execution history.
//!
//! The host node drives the service through three hooks, in this order for
//! every block: [`StateHistoryService::block_started`], zero or more
//! [`StateHistoryService::transaction_applied`], then
//! [`StateHistoryService::block_accepted`]. Accepted blocks are packed and
//! appended to the enabled history logs, then fanned out to every connected
//! session, which streams them to its client over a framed binary WebSocket
//! channel with credit-based flow control.
//!
//! The chain itself stays behind the [`BlockAccessor`] trait; the service
//! never executes or validates blocks.
//!
//! Log files are written from the `block_accepted` hook and read from
//! session tasks; a reader/writer lock per log serializes the two sides.
//! File reads are blocking, which is acceptable for the small set of
//! trusted consumers this listener is meant to serve.

mod accessor;
mod args;
mod config;
mod error;
mod service;
mod session;

pub use accessor::BlockAccessor;
pub use args::StateHistoryArgs;
pub use config::StateHistoryConfig;
pub use error::StateHistoryServerError;
pub use service::{BlockEvent, StateHistoryService};

#[cfg(test)]
mod tests;
