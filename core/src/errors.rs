// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

/// Coarse grouping of [`CoreError`] used by callers to decide how a node is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The node must enroll again. Never retried server side.
    Authentication,
    /// The request was malformed; the node may retry with corrected input.
    Validation,
    /// The addressed record does not exist.
    NotFound,
    /// Storage or a collaborator is unavailable; the node retries on its own schedule.
    Transient,
    /// A carve archive could not be handed to its backend.
    Reconstruction,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("unknown environment")]
    UnknownEnvironment,
    #[error("invalid enroll secret")]
    InvalidEnrollSecret,
    #[error("invalid node key")]
    InvalidNodeKey,
    #[error("enroll window expired")]
    EnrollExpired,
    #[error("remove window expired")]
    RemoveExpired,
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("logger error: {0}")]
    LoggerError(String),
    #[error("carve reconstruction failed: {0}")]
    ReconstructionError(String),
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidEnrollSecret
            | Self::InvalidNodeKey
            | Self::EnrollExpired
            | Self::RemoveExpired => ErrorClass::Authentication,
            Self::ValidationError(_) => ErrorClass::Validation,
            Self::UnknownEnvironment | Self::NotFound(_) => ErrorClass::NotFound,
            Self::StorageError(_) | Self::LoggerError(_) => ErrorClass::Transient,
            Self::ReconstructionError(_) => ErrorClass::Reconstruction,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(source: serde_json::Error) -> Self {
        tracing::error!("{:?}", source);
        CoreError::ValidationError(source.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(source: std::io::Error) -> Self {
        tracing::error!("{:?}", source);
        CoreError::StorageError(source.to_string())
    }
}
