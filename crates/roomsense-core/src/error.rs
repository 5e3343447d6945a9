//! Unified error types for the roomsense core library.
//!
//! This module provides a unified error type [`RoomsenseError`] that covers all
//! failure modes across the presence-tracking core. Hardware-facing modules
//! also define narrower error types ([`crate::classic::ExecError`]) for
//! internal use; those convert into the unified type at the crate boundary.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Soft degradation**: Hardware noise degrades to "no value" plus a recovery
//!   action (unlock, reset) instead of propagating; only misuse and genuine
//!   contention surface as errors

use thiserror::Error;

/// The unified error type for all roomsense core operations.
#[derive(Debug, Error)]
pub enum RoomsenseError {
    // =========================================================================
    // ADAPTER ARBITRATION ERRORS
    // =========================================================================
    /// The adapter is already locked for an exclusive inquiry.
    #[error("hci{0} is already locked for an inquiry. Retry after the current holder releases it.")]
    AdapterAlreadyLocked(u16),

    /// The adapter is currently being reset and cannot be locked.
    #[error("hci{0} is resetting and cannot be locked until the reset completes.")]
    AdapterResetting(u16),

    /// A reset was requested while another reset is still in progress.
    #[error("hci{0} is already resetting.")]
    AdapterAlreadyResetting(u16),

    // =========================================================================
    // LOW-ENERGY CONNECTION ERRORS
    // =========================================================================
    /// The peripheral does not advertise itself as connectable.
    #[error("peripheral '{0}' is not connectable")]
    NonConnectable(String),

    /// A connection attempt to this peripheral is already in flight.
    #[error("a connection attempt to peripheral '{0}' is already in progress")]
    AlreadyConnecting(String),

    /// The connection could not be established before the overall deadline.
    #[error("connection to peripheral '{peripheral}' timed out")]
    ConnectionTimedOut {
        /// Peripheral identifier.
        peripheral: String,
    },

    /// The connection failed after exhausting the retry budget.
    #[error("connection to peripheral '{peripheral}' failed after {attempts} attempts")]
    ConnectionRetriesExceeded {
        /// Peripheral identifier.
        peripheral: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The radio driver reported a failure for a scan or bindings operation.
    #[error("radio driver error: {0}")]
    Driver(String),

    // =========================================================================
    // ENTITY REGISTRY ERRORS
    // =========================================================================
    /// An entity with this id has already been registered.
    #[error("entity id '{0}' is already registered; entity ids are unique and immutable")]
    DuplicateEntityId(String),

    // =========================================================================
    // CONFIGURATION & I/O ERRORS
    // =========================================================================
    /// The configuration file exists but could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    /// The configuration was parsed but contains invalid values.
    #[error("configuration validation failed: {field}: {message}")]
    ConfigValidation {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for roomsense core operations.
pub type Result<T> = std::result::Result<T, RoomsenseError>;

impl RoomsenseError {
    /// Returns `true` if this error is adapter-lock contention or an active
    /// reset. Callers are expected to retry on their own schedule rather than
    /// wait; the manager never queues lockers.
    #[inline]
    #[must_use]
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            Self::AdapterAlreadyLocked(_)
                | Self::AdapterResetting(_)
                | Self::AdapterAlreadyResetting(_)
        )
    }

    /// Returns `true` if this error is a low-energy connection failure.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NonConnectable(_)
                | Self::AlreadyConnecting(_)
                | Self::ConnectionTimedOut { .. }
                | Self::ConnectionRetriesExceeded { .. }
        )
    }

    /// Returns `true` if this error represents caller misuse that should not
    /// be retried (duplicate registration, invalid configuration).
    #[inline]
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::DuplicateEntityId(_) | Self::ConfigParse(_) | Self::ConfigValidation { .. }
        )
    }

    /// Returns a machine-readable error code for logs and external alerting.
    #[inline]
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AdapterAlreadyLocked(_) => "ADAPTER_ALREADY_LOCKED",
            Self::AdapterResetting(_) => "ADAPTER_RESETTING",
            Self::AdapterAlreadyResetting(_) => "ADAPTER_ALREADY_RESETTING",
            Self::NonConnectable(_) => "NON_CONNECTABLE",
            Self::AlreadyConnecting(_) => "ALREADY_CONNECTING",
            Self::ConnectionTimedOut { .. } => "CONNECTION_TIMED_OUT",
            Self::ConnectionRetriesExceeded { .. } => "CONNECTION_RETRIES_EXCEEDED",
            Self::Driver(_) => "DRIVER_ERROR",
            Self::DuplicateEntityId(_) => "DUPLICATE_ENTITY_ID",
            Self::ConfigParse(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidation { .. } => "CONFIG_VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_lock_contention_classification() {
        assert!(RoomsenseError::AdapterAlreadyLocked(0).is_lock_contention());
        assert!(RoomsenseError::AdapterResetting(1).is_lock_contention());
        assert!(RoomsenseError::AdapterAlreadyResetting(1).is_lock_contention());

        assert!(!RoomsenseError::NonConnectable("aa:bb".into()).is_lock_contention());
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(RoomsenseError::NonConnectable("x".into()).is_connection_error());
        assert!(RoomsenseError::AlreadyConnecting("x".into()).is_connection_error());
        assert!(RoomsenseError::ConnectionTimedOut {
            peripheral: "x".into()
        }
        .is_connection_error());
        assert!(RoomsenseError::ConnectionRetriesExceeded {
            peripheral: "x".into(),
            attempts: 5
        }
        .is_connection_error());

        assert!(!RoomsenseError::AdapterAlreadyLocked(0).is_connection_error());
    }

    #[test]
    fn test_misuse_classification() {
        assert!(RoomsenseError::DuplicateEntityId("door".into()).is_misuse());
        assert!(RoomsenseError::ConfigParse("bad toml".into()).is_misuse());
        assert!(!RoomsenseError::AdapterAlreadyLocked(0).is_misuse());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RoomsenseError::AdapterAlreadyLocked(0).error_code(),
            "ADAPTER_ALREADY_LOCKED"
        );
        assert_eq!(
            RoomsenseError::DuplicateEntityId("x".into()).error_code(),
            "DUPLICATE_ENTITY_ID"
        );
    }

    #[test]
    fn test_display_messages() {
        let err = RoomsenseError::AdapterAlreadyLocked(1);
        assert!(format!("{err}").contains("hci1"));

        let err = RoomsenseError::ConnectionRetriesExceeded {
            peripheral: "f0:99".into(),
            attempts: 5,
        };
        assert!(format!("{err}").contains("5 attempts"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "missing");
        let err: RoomsenseError = io_err.into();
        assert!(matches!(err, RoomsenseError::Io(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RoomsenseError>();
        assert_sync::<RoomsenseError>();
    }
}
