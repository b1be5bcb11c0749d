//! # roommesh-sync: Room Mesh Sync Engine
//!
//! Keeps one shared environment mesh consistent across every participant
//! of a room, and ships per-platform asset bundles from the room's master
//! to joining clients.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Room Node Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    Node (command dispatcher)                     │  │
//! │  │                                                                  │  │
//! │  │  One per participant. Role fixed at start: Master or Client.    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  ControlPlane  │  │ TransferService│  │  SharedStore           │    │
//! │  │                │  │                │  │  (roommesh-core)       │    │
//! │  │ Small JSON     │  │ One-shot TCP   │  │                        │    │
//! │  │ messages via   │  │ bulk channels  │  │ Current mesh, read by  │    │
//! │  │ session layer  │  │ on base+offset │  │ the host's renderer    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  Control plane says WHERE to dial; bulk channels carry the bytes.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`node`] - `Node` dispatcher, handle, status and observer events
//! - [`master`] - Room owner state machine
//! - [`client`] - Room member state machine and version gate
//! - [`session`] - `ControlPlane` seam and the in-process `LocalSession`
//! - [`protocol`] - Control-plane messages and transfer descriptors
//! - [`transfer`] - Port leases, one-shot transfers, snapshot server
//! - [`channel`] - Bulk TCP channel (raw or length-prefixed)
//! - [`bundles`] - Bundle catalog and client-side bundle sink
//! - [`config`] - TOML config with environment overrides
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use roommesh_sync::{LocalSession, NodeBuilder, SyncConfig};
//!
//! let session = LocalSession::new();
//! let endpoint = session.endpoint();
//!
//! let config = SyncConfig::load_or_default(None);
//! let node = NodeBuilder::new(config).start(Arc::new(endpoint.clone()))?;
//! endpoint.attach(Arc::new(node.clone()));
//! endpoint.join("lab-room");
//!
//! let status = node.status().await;
//! println!("{} bytes of mesh at v{}", status.store_len, status.version);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bundles;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod master;
pub mod node;
pub mod protocol;
pub mod session;
pub mod transfer;

// =============================================================================
// Re-exports
// =============================================================================

pub use bundles::{BundleCatalog, BundleEntry, BundleSink, DiscardBundles, MemoryBundleSink};
pub use channel::{BulkListener, BulkStream, ChannelOptions};
pub use client::ClientRole;
pub use config::{BundleSettings, Framing, NodeConfig, SessionConfig, SyncConfig, TransferSettings};
pub use error::{SyncError, SyncResult};
pub use master::MasterRole;
pub use node::{
    LocalIntent, NoOpObserver, NodeBuilder, NodeEvent, NodeHandle, NodeObserver, NodeState,
    NodeStatus,
};
pub use protocol::{ControlMessage, TransferDescriptor};
pub use session::{
    ControlPlane, Delivered, LocalEndpoint, LocalSession, SessionEvent, SessionSink, Target,
};
pub use transfer::{PendingTransfer, TransferService};

pub use roommesh_core::{
    MeshBlob, PeerRef, Platform, PortAllocator, Role, SharedStore, TransferKind, MAX_PORT_OFFSET,
};
