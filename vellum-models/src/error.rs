// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>

use displaydoc::Display;
use thiserror::Error;
use vellum_serialization::SerializeError;

/// Models error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum ModelsError {
    /// id parsing error: {0}
    IdParseError(String),
    /// unknown transaction status discriminant: {0}
    InvalidStatus(u8),
    /// serialization error: {0}
    SerializeError(#[from] SerializeError),
    /// deserialization error: {0}
    DeserializeError(String),
}
