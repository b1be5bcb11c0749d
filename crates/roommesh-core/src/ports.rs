//! # Port Layout
//!
//! Deterministic mapping from one configured base port to the port used by
//! each transfer kind.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Transfer Port Layout                             │
//! │                                                                         │
//! │   base + 0   MeshPull          master's permanent snapshot server       │
//! │   base + 1   MeshReplace       one-shot full-mesh transfer              │
//! │   base + 2   Bundle(Android)   one-shot bundle file                     │
//! │   base + 3   Bundle(HoloLens)  one-shot bundle file                     │
//! │   base + 4   IncrementalAdd    one-shot append payload                  │
//! │   base + 5   Bundle(Desktop)   one-shot bundle file                     │
//! │                                                                         │
//! │  Both sides derive the same numbers without a discovery round-trip.    │
//! │  The base must therefore be unique per reachable room.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Platform;

/// Largest offset any transfer kind adds to the base port.
pub const MAX_PORT_OFFSET: u16 = 5;

// =============================================================================
// Transfer Kind
// =============================================================================

/// What a bulk transfer carries, and therefore which port it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "platform", rename_all = "snake_case")]
pub enum TransferKind {
    /// Anyone dialing the master to pull the current snapshot.
    MeshPull,

    /// One full mesh, offered by whichever side holds it.
    MeshReplace,

    /// An append payload merged into the master's mesh.
    IncrementalAdd,

    /// One bundle file for the given platform.
    Bundle(Platform),
}

impl TransferKind {
    /// Offset from the base port.
    pub const fn offset(&self) -> u16 {
        match self {
            TransferKind::MeshPull => 0,
            TransferKind::MeshReplace => 1,
            TransferKind::Bundle(Platform::Android) => 2,
            TransferKind::Bundle(Platform::HoloLens) => 3,
            TransferKind::IncrementalAdd => 4,
            TransferKind::Bundle(Platform::Desktop) => 5,
        }
    }

    /// Every kind a node may listen on.
    pub fn all() -> [TransferKind; 6] {
        [
            TransferKind::MeshPull,
            TransferKind::MeshReplace,
            TransferKind::Bundle(Platform::Android),
            TransferKind::Bundle(Platform::HoloLens),
            TransferKind::IncrementalAdd,
            TransferKind::Bundle(Platform::Desktop),
        ]
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::MeshPull => write!(f, "mesh-pull"),
            TransferKind::MeshReplace => write!(f, "mesh-replace"),
            TransferKind::IncrementalAdd => write!(f, "incremental-add"),
            TransferKind::Bundle(platform) => write!(f, "bundle/{}", platform),
        }
    }
}

impl From<Platform> for TransferKind {
    fn from(platform: Platform) -> Self {
        TransferKind::Bundle(platform)
    }
}

// =============================================================================
// Port Allocator
// =============================================================================

/// Fixed, statically computed kind → port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base: u16,
}

impl PortAllocator {
    /// Validates `base` and builds the layout.
    pub fn new(base: u16) -> Result<Self, CoreError> {
        if base == 0 || base.checked_add(MAX_PORT_OFFSET).is_none() {
            return Err(CoreError::InvalidBasePort {
                base,
                max_offset: MAX_PORT_OFFSET,
            });
        }
        Ok(PortAllocator { base })
    }

    /// The configured base port.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Port used for `kind`.
    pub fn port_for(&self, kind: TransferKind) -> u16 {
        // `new` guarantees base + MAX_PORT_OFFSET fits
        self.base + kind.offset()
    }

    /// Port used for a platform's bundles.
    pub fn bundle_port(&self, platform: Platform) -> u16 {
        self.port_for(TransferKind::Bundle(platform))
    }

    /// Every (kind, port) pair of this layout.
    pub fn all_ports(&self) -> Vec<(TransferKind, u16)> {
        TransferKind::all()
            .into_iter()
            .map(|kind| (kind, self.port_for(kind)))
            .collect()
    }

    /// Returns true if `port` falls inside this layout.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && port <= self.base + MAX_PORT_OFFSET
    }
}
