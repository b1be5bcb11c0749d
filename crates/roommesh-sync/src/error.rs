//! # Sync Error Types
//!
//! Error types for room sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐  │
//! │  │  Configuration  │  │    Transfer     │  │     Protocol            │  │
//! │  │                 │  │                 │  │                         │  │
//! │  │  InvalidConfig  │  │  PortInUse      │  │  InvalidMessage         │  │
//! │  │  ConfigLoad/    │  │  ConnectFailed  │  │  SerializationFailed    │  │
//! │  │  SaveFailed     │  │  Timeout        │  │  UnexpectedMessage      │  │
//! │  │                 │  │  PayloadTooLarge│  │                         │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘  │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐  │
//! │  │    Session      │  │     Bundles     │  │      Internal           │  │
//! │  │                 │  │                 │  │                         │  │
//! │  │  NotInSession   │  │  BundleRead     │  │  Cancelled              │  │
//! │  │  UnknownPeer    │  │                 │  │  ShuttingDown           │  │
//! │  │                 │  │                 │  │  Internal               │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;

use roommesh_core::{CoreError, PeerRef, TransferKind};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all room sync failures.
///
/// ## Propagation
/// - Transfer errors stay local to the task that hit them; the node logs
///   them and reports a `TransferFailed` event, the store is untouched.
/// - Session errors reach the role state machine.
/// - Config errors surface at startup.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transfer Errors
    // =========================================================================
    /// Listener could not bind its port (collision or misconfiguration).
    #[error("Port for {kind} already in use at {addr}: {reason}")]
    PortInUse {
        kind: TransferKind,
        addr: SocketAddr,
        reason: String,
    },

    /// Could not reach the advertised endpoint.
    #[error("Connection to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Socket error in the middle of a transfer.
    #[error("Transfer I/O error: {0}")]
    Io(String),

    /// A bounded wait ran out.
    #[error("Timed out waiting for {what} after {secs} seconds")]
    Timeout { what: &'static str, secs: u64 },

    /// Payload exceeded the configured limit.
    #[error("Payload exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Stream ended before the declared frame was complete.
    #[error("Stream closed before the payload was complete")]
    Truncated,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Inbound control message could not be decoded.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize or parse a control message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A message arrived that the current role/state does not handle.
    #[error("Unexpected message {message} for {role} in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        role: String,
        state: String,
    },

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// No session (or no master) to address yet.
    #[error("Not in a session")]
    NotInSession,

    /// Addressed peer is not a member of the room.
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerRef),

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Bundle file could not be listed or read.
    #[error("Bundle read failed for {path}: {reason}")]
    BundleRead { path: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The node shut down while the operation was in flight.
    #[error("Operation cancelled by node shutdown")]
    Cancelled,

    /// Node is shutting down.
    #[error("Node is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the requesting side may simply re-issue its request.
    ///
    /// ## Retryable Errors
    /// - Connection failures, mid-stream I/O errors
    /// - Timeouts
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors, port collisions
    /// - Protocol mismatches
    /// - Shutdown
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectFailed { .. }
                | SyncError::Io(_)
                | SyncError::Timeout { .. }
                | SyncError::Truncated
        )
    }

    /// Returns true if this error abandoned a single bulk transfer.
    pub fn is_transfer_failure(&self) -> bool {
        matches!(
            self,
            SyncError::PortInUse { .. }
                | SyncError::ConnectFailed { .. }
                | SyncError::Io(_)
                | SyncError::Timeout { .. }
                | SyncError::PayloadTooLarge { .. }
                | SyncError::Truncated
                | SyncError::Cancelled
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::UnexpectedMessage { .. }
        )
    }
}
