//! Error types for spmd
//!
//! Every fallible operation in the workspace returns [`Result`]. Errors carry
//! a stable numeric code so they can be turned into a [`Status`] at the API
//! boundary instead of escaping as panics or opaque strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for spmd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for spmd
#[derive(Debug, Error)]
pub enum Error {
    // Metadata errors
    #[error("metadata seal is broken: declared {declared}, computed {computed}")]
    SealBroken { declared: String, computed: String },

    #[error("metadata overflow: {size} bytes do not fit in {capacity}")]
    MetadataOverflow { size: usize, capacity: usize },

    #[error("metadata key not allowed: {0}")]
    KeyNotAllowed(String),

    #[error("invalid metadata value for {key}: {value:?}")]
    MetadataDecode { key: String, value: String },

    #[error("metadata key {0} is missing")]
    MetadataMissing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Parameter and state errors
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: String, value: String },

    #[error("illegal domain state transition for {domain}: {from} -> {to}")]
    IllegalStateTransition {
        domain: String,
        from: String,
        to: String,
    },

    #[error("operation already in progress: {0}")]
    OperationInProgress(String),

    #[error("description too long: {len} characters, max {max}")]
    DescriptionTooLong { len: usize, max: usize },

    // Domain errors
    #[error("storage domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("storage domain {domain} already attached to pool {pool}")]
    DomainAlreadyAttached { domain: String, pool: String },

    #[error("storage domain {domain} is not attached to pool {pool}")]
    DomainNotAttached { domain: String, pool: String },

    #[error("storage domain {0} is not active")]
    DomainNotActive(String),

    #[error("unsupported storage domain version: {0}")]
    UnsupportedDomainVersion(u32),

    #[error("current domain version {current} is more advanced than {target}")]
    CurrentVersionTooAdvanced { current: u32, target: u32 },

    #[error("ISO domain {0} cannot be master")]
    IsoCannotBeMaster(String),

    #[error("backup domain {0} cannot be master")]
    BackupCannotBeMaster(String),

    #[error("master tree of domain {domain} is invalid: {reason}")]
    InvalidMasterTree { domain: String, reason: String },

    // Lease errors
    #[error("domain {domain} is already locked by host {host_id}")]
    DomainAlreadyLocked { domain: String, host_id: u32 },

    #[error("cluster lock of domain {0} is not held")]
    LockNotHeld(String),

    #[error("cannot acquire cluster lock of domain {domain}: {reason}")]
    AcquireLock { domain: String, reason: String },

    // Pool errors
    #[error("wrong master domain or its version: pool {pool}, master {master}, version {version}")]
    PoolWrongMaster {
        pool: String,
        master: String,
        version: i64,
    },

    #[error("cannot find master domain of pool {0}")]
    PoolMasterNotFound(String),

    #[error("storage pool already exists: {0}")]
    PoolAlreadyExists(String),

    #[error("storage pool {0} is not connected")]
    PoolNotConnected(String),

    #[error("pool {pool} has another potential master: {domain}")]
    PoolHasPotentialMaster { pool: String, domain: String },

    #[error("cannot copy master tree to domain {domain}: {reason}")]
    MasterCopy { domain: String, reason: String },

    #[error("too many domains in pool {pool}: max {max}")]
    TooManyDomains { pool: String, max: usize },

    #[error("SPM parameters mismatch: expected id {expected_id} lver {expected_lver}, found id {id} lver {lver}")]
    SpmParamsMismatch {
        expected_id: i64,
        expected_lver: i64,
        id: i64,
        lver: i64,
    },

    #[error("SPM is not started on pool {0}")]
    SpmNotStarted(String),

    // Mailbox errors
    #[error("mailbox of host {0} is full")]
    MailboxFull(u32),

    #[error("mailbox is not running")]
    MailboxNotRunning,

    #[error("invalid mailbox message: {0}")]
    InvalidMessage(String),

    #[error("mailbox reply does not match request in slot {slot}")]
    ReplyMismatch { slot: usize },

    #[error("volume extend failed: {0}")]
    ExtendFailed(String),

    // External collaborators
    #[error("volume backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(name: impl Into<String>, value: impl ToString) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
        }
    }

    /// Create a volume backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invalid mailbox message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Check if this error was raised before any mutation took place
    #[must_use]
    pub const fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalStateTransition { .. }
                | Self::OperationInProgress(_)
                | Self::PoolWrongMaster { .. }
                | Self::PoolAlreadyExists(_)
                | Self::DomainNotActive(_)
        )
    }

    /// Stable numeric status code reported across the API boundary
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::SealBroken { .. } => 101,
            Self::MetadataOverflow { .. } => 102,
            Self::KeyNotAllowed(_) => 103,
            Self::MetadataDecode { .. } => 104,
            Self::MetadataMissing(_) => 105,
            Self::Io(_) => 106,

            Self::InvalidParameter { .. } => 201,
            Self::IllegalStateTransition { .. } => 202,
            Self::OperationInProgress(_) => 203,
            Self::DescriptionTooLong { .. } => 204,

            Self::DomainNotFound(_) => 301,
            Self::DomainAlreadyAttached { .. } => 302,
            Self::DomainNotAttached { .. } => 303,
            Self::DomainNotActive(_) => 304,
            Self::UnsupportedDomainVersion(_) => 305,
            Self::CurrentVersionTooAdvanced { .. } => 306,
            Self::IsoCannotBeMaster(_) => 307,
            Self::BackupCannotBeMaster(_) => 308,
            Self::InvalidMasterTree { .. } => 309,
            Self::DomainAlreadyLocked { .. } => 310,
            Self::LockNotHeld(_) => 311,
            Self::AcquireLock { .. } => 312,

            Self::PoolWrongMaster { .. } => 401,
            Self::PoolMasterNotFound(_) => 402,
            Self::PoolAlreadyExists(_) => 403,
            Self::PoolNotConnected(_) => 404,
            Self::PoolHasPotentialMaster { .. } => 405,
            Self::MasterCopy { .. } => 406,
            Self::TooManyDomains { .. } => 407,
            Self::SpmParamsMismatch { .. } => 408,
            Self::SpmNotStarted(_) => 409,

            Self::MailboxFull(_) => 501,
            Self::MailboxNotRunning => 502,
            Self::InvalidMessage(_) => 503,
            Self::ReplyMismatch { .. } => 504,
            Self::ExtendFailed(_) => 505,

            Self::Backend(_) => 601,
            Self::Configuration(_) => 602,
            Self::Internal(_) => 900,
        }
    }
}

/// Structured result returned across the API boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    /// Success status
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: "OK".to_string(),
        }
    }

    /// Whether this status reports success
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Convert an operation result into a status, discarding the value
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::from(e),
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_per_group() {
        assert_eq!(Error::internal("x").code(), 900);
        assert_eq!(Error::MailboxFull(3).code(), 501);
        assert_ne!(
            Error::DomainNotActive("a".into()).code(),
            Error::DomainNotFound("a".into()).code()
        );
    }

    #[test]
    fn test_status_from_result() {
        let ok: Result<u32> = Ok(7);
        assert!(Status::from_result(&ok).is_ok());

        let err: Result<u32> = Err(Error::PoolAlreadyExists("p".into()));
        let status = Status::from_result(&err);
        assert_eq!(status.code, 403);
        assert!(status.message.contains("already exists"));
    }

    #[test]
    fn test_state_errors() {
        assert!(Error::OperationInProgress("connect".into()).is_state_error());
        assert!(!Error::internal("boom").is_state_error());
    }
}
