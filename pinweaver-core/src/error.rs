use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::hash_tree::{Label, TreeError};
use crate::storage::StorageError;

/// Error outputs from the PinWeaver manager.
#[derive(Debug, Error)]
pub enum PinWeaverError {
    /// The low-entropy or reset secret did not match. The attempt was
    /// recorded.
    #[error("wrong_secret")]
    WrongSecret,
    /// Too many wrong attempts; retry after the delay or reset the leaf.
    #[error("locked_out: retry in {delay_seconds}s")]
    LockedOut {
        /// Seconds until the next attempt is allowed, `u32::MAX` for a
        /// permanent lockout.
        delay_seconds: u32,
    },
    /// The label is not in use.
    #[error("not_found: label {label}")]
    NotFound {
        /// The requested label.
        label: Label,
    },
    /// Local and backend root hashes disagree and replay did not help.
    #[error("out_of_sync")]
    OutOfSync,
    /// Every label in the tree is in use.
    #[error("resource_exhausted: no free label")]
    ResourceExhausted,
    /// Local tree data failed a self-consistency check.
    #[error("corruption: {reason}")]
    Corruption {
        /// What failed.
        reason: String,
    },
    /// The backend could not be reached or reported a hardware fault.
    #[error("backend_unavailable: {reason}")]
    BackendUnavailable {
        /// Backend diagnostic.
        reason: String,
    },
    /// The manager hit an unrecoverable persistence failure; every further
    /// operation fails with this error.
    #[error("locked")]
    Locked,
    /// The operation cannot run in the current state.
    #[error("failed_precondition: {reason}")]
    FailedPrecondition {
        /// Which precondition failed.
        reason: String,
    },
    /// The leaf's expiration window has passed; a strong reset renews it.
    #[error("expired")]
    Expired,
    /// None of the leaf's policies matches the current platform state.
    #[error("policy_not_match")]
    PolicyNotMatch,
    /// `init()` has not completed.
    #[error("not_initialized")]
    NotInitialized,
    /// A caller-supplied argument was rejected.
    #[error("invalid_argument: {reason}")]
    InvalidArgument {
        /// What was wrong.
        reason: String,
    },
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A storage operation failed for an environmental reason.
    #[error(transparent)]
    Storage(StorageError),
}

impl PinWeaverError {
    /// Creates a corruption error.
    pub fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    /// Creates a failed precondition error.
    pub fn failed_precondition(reason: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for PinWeaverError {
    fn from(error: StorageError) -> Self {
        if error.is_corruption() {
            Self::corruption(error.to_string())
        } else {
            Self::Storage(error)
        }
    }
}

impl From<TreeError> for PinWeaverError {
    fn from(error: TreeError) -> Self {
        match error {
            TreeError::NotFound { label } | TreeError::InvalidLabel { label } => {
                Self::NotFound { label }
            }
            TreeError::InvalidGeometry { reason } => Self::InvalidArgument { reason },
            TreeError::Corruption { reason } => Self::Corruption { reason },
            TreeError::Storage(error) => error.into(),
        }
    }
}

impl From<BackendError> for PinWeaverError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::OutOfSync => Self::OutOfSync,
            BackendError::LockedOut { delay_seconds } => Self::LockedOut { delay_seconds },
            BackendError::Expired => Self::Expired,
            BackendError::PolicyNotMatch => Self::PolicyNotMatch,
            BackendError::InvalidLeaf { reason } => Self::Corruption { reason },
            BackendError::InvalidArgument { reason } => Self::InvalidArgument { reason },
            BackendError::ChannelNotPaired { channel } => {
                Self::failed_precondition(format!("auth channel {channel} is not paired"))
            }
            BackendError::NotProvisioned => {
                Self::failed_precondition("backend tree is not provisioned")
            }
            BackendError::Hardware { reason } => Self::BackendUnavailable { reason },
        }
    }
}

/// Result type for manager operations.
pub type PinWeaverResult<T> = Result<T, PinWeaverError>;
