//! # Error Types
//!
//! Domain-specific error types for roommesh-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  roommesh-core errors (this file)                                      │
//! │  └── CoreError        - Invalid port layout, unknown names             │
//! │                                                                         │
//! │  roommesh-sync errors (separate crate)                                 │
//! │  └── SyncError        - Config, transfer, protocol, session failures   │
//! │                                                                         │
//! │  Flow: CoreError → SyncError::InvalidConfig → host                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core domain errors.
///
/// These are raised while building the static pieces of a node (port layout,
/// parsed names) and never during a transfer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The base port leaves no room for every transfer kind.
    ///
    /// ## When This Occurs
    /// - `base` is 0 (ephemeral ports cannot be derived by the peer)
    /// - `base + MAX_PORT_OFFSET` overflows the 16-bit port range
    #[error("Invalid base port {base}: need {base} + {max_offset} <= 65535 and base > 0")]
    InvalidBasePort { base: u16, max_offset: u16 },

    /// Platform name could not be parsed.
    #[error("Unknown platform: '{0}'. Valid options: android, hololens, desktop")]
    UnknownPlatform(String),

    /// Role name could not be parsed.
    #[error("Unknown role: '{0}'. Valid options: master, client")]
    UnknownRole(String),
}
