//! # roommesh-core: Pure Domain Types for Room Mesh Sync
//!
//! This crate is the I/O-free half of the room mesh protocol. It holds the
//! shared mesh store, the fixed port layout, and the identity types that
//! travel inside control-plane messages.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Room Mesh Sync Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Host (renderer, capture, session)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          roommesh-sync (control plane + bulk channels)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ roommesh-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐    │   │
//! │  │   │    store    │  │    ports    │  │        types        │    │   │
//! │  │   │ SharedStore │  │PortAllocator│  │ PeerRef, Role,      │    │   │
//! │  │   │  MeshBlob   │  │TransferKind │  │ Platform            │    │   │
//! │  │   └─────────────┘  └─────────────┘  └─────────────────────┘    │   │
//! │  │                                                                 │   │
//! │  │   NO SOCKETS • NO FILES • NO ASYNC RUNTIME                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use roommesh_core::{PortAllocator, SharedStore, TransferKind};
//!
//! let store = SharedStore::new();
//! store.replace(vec![1, 2, 3]);
//! store.append(vec![4]);
//! assert_eq!(store.snapshot().unwrap().bytes.as_ref(), &[1, 2, 3, 4]);
//!
//! let ports = PortAllocator::new(9000).unwrap();
//! assert_eq!(ports.port_for(TransferKind::IncrementalAdd), 9004);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod ports;
pub mod store;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::CoreError;
pub use ports::{PortAllocator, TransferKind, MAX_PORT_OFFSET};
pub use store::{MeshBlob, SharedStore};
pub use types::{PeerRef, Platform, Role};
