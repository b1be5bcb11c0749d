//! # Control-Plane Messages
//!
//! Small signaling messages exchanged through the session layer.
//! They announce intent and carry an address; bulk bytes never travel here.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Control-Plane Messages                             │
//! │                                                                         │
//! │  JOIN                                                                   │
//! │  ────                                                                   │
//! │  CLIENT ───► RequestMeshFrom { peer }                                   │
//! │  MASTER ───► DeliverMeshAt { td(MeshReplace), version }   (if any)      │
//! │  CLIENT ───► RequestBundles { peer, platform }                          │
//! │  MASTER ───► BundleReadyAt { td(Bundle), path }            (per file)   │
//! │                                                                         │
//! │  CLIENT PUSH (reversed direction)                                       │
//! │  ────────────────────────────────                                       │
//! │  CLIENT ───► DeliverMeshAt { td(MeshReplace on client), version }       │
//! │  MASTER ───► PropagateMeshUpdated { td(MeshPull), version } (others)    │
//! │                                                                         │
//! │  INCREMENTAL ADD                                                        │
//! │  ───────────────                                                        │
//! │  CLIENT ───► RequestIncrementalAdd { peer, request }                    │
//! │  MASTER ───► IncrementalAddReadyAt { td(IncrementalAdd), request }      │
//! │  MASTER ───► PropagateMeshUpdated { td(MeshPull), version } (others)    │
//! │                                                                         │
//! │  DELETE                                                                 │
//! │  ──────                                                                 │
//! │  ANY    ───► ClearAll { version }                                       │
//! │  SELF   ───► ClearLocal                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "ClearAll", "payload": { "version": 7 } }
//! ```

use roommesh_core::{PeerRef, Platform, TransferKind};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Transfer Descriptor
// =============================================================================

/// Where a one-shot bulk channel can be dialed.
///
/// Lifetime is a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    /// What the channel carries.
    pub kind: TransferKind,

    /// Advertised host of the listening side.
    pub host: String,

    /// Listening port.
    pub port: u16,
}

impl TransferDescriptor {
    pub fn new(kind: TransferKind, host: impl Into<String>, port: u16) -> Self {
        TransferDescriptor {
            kind,
            host: host.into(),
            port,
        }
    }

    /// `host:port` string for dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for TransferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.kind, self.host, self.port)
    }
}

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All control-plane messages.
///
/// Fire-and-forget: acknowledgement, where needed, is the next message or
/// the bulk transfer itself. `version` fields carry the sender's store
/// version so a receiver can drop notifications older than what it already
/// applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    // =========================================================================
    // Mesh Replace
    // =========================================================================
    /// "Send me the current mesh." Client → master on join.
    RequestMeshFrom { peer: PeerRef },

    /// "Dial here to pull the mesh." Either direction.
    DeliverMeshAt {
        descriptor: TransferDescriptor,
        version: u64,
    },

    /// "Mesh changed, re-pull." Master → every other node.
    PropagateMeshUpdated {
        descriptor: TransferDescriptor,
        version: u64,
    },

    // =========================================================================
    // Incremental Add
    // =========================================================================
    /// "I have an addition for you." Client → master.
    ///
    /// `request` is chosen by the client and echoed back in the matching
    /// `IncrementalAddReadyAt`.
    RequestIncrementalAdd { peer: PeerRef, request: u64 },

    /// "Dial here and write addition `request`." Master → requesting client.
    IncrementalAddReadyAt {
        descriptor: TransferDescriptor,
        request: u64,
    },

    // =========================================================================
    // Bundles
    // =========================================================================
    /// "Send me my platform's bundles." Client → master on join.
    RequestBundles { peer: PeerRef, platform: Platform },

    /// "Dial here to pull one bundle file." Master → client, once per file.
    BundleReadyAt {
        descriptor: TransferDescriptor,
        path: String,
    },

    // =========================================================================
    // Delete
    // =========================================================================
    /// Every node must clear its local store.
    ClearAll { version: u64 },

    /// Clear only the receiver's own copy.
    ClearLocal,
}

impl ControlMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::RequestMeshFrom { .. } => "RequestMeshFrom",
            ControlMessage::DeliverMeshAt { .. } => "DeliverMeshAt",
            ControlMessage::PropagateMeshUpdated { .. } => "PropagateMeshUpdated",
            ControlMessage::RequestIncrementalAdd { .. } => "RequestIncrementalAdd",
            ControlMessage::IncrementalAddReadyAt { .. } => "IncrementalAddReadyAt",
            ControlMessage::RequestBundles { .. } => "RequestBundles",
            ControlMessage::BundleReadyAt { .. } => "BundleReadyAt",
            ControlMessage::ClearAll { .. } => "ClearAll",
            ControlMessage::ClearLocal => "ClearLocal",
        }
    }

    /// The transfer descriptor carried by this message, if any.
    pub fn descriptor(&self) -> Option<&TransferDescriptor> {
        match self {
            ControlMessage::DeliverMeshAt { descriptor, .. }
            | ControlMessage::PropagateMeshUpdated { descriptor, .. }
            | ControlMessage::IncrementalAddReadyAt { descriptor, .. }
            | ControlMessage::BundleReadyAt { descriptor, .. } => Some(descriptor),
            _ => None,
        }
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a message received from the session layer.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = ControlMessage::DeliverMeshAt {
            descriptor: TransferDescriptor::new(TransferKind::MeshReplace, "10.0.0.2", 12001),
            version: 4,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"DeliverMeshAt\""));
        assert!(json.contains("\"version\":4"));

        let parsed = ControlMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_bundle_descriptor_carries_platform() {
        let msg = ControlMessage::BundleReadyAt {
            descriptor: TransferDescriptor::new(
                TransferKind::Bundle(Platform::HoloLens),
                "10.0.0.2",
                12003,
            ),
            path: "AssetBundlesHololens/networkBundle_room".into(),
        };
        let parsed = ControlMessage::from_json(&msg.to_json().unwrap()).unwrap();
        let td = parsed.descriptor().unwrap();
        assert_eq!(td.kind, TransferKind::Bundle(Platform::HoloLens));
        assert_eq!(td.addr(), "10.0.0.2:12003");
    }

    #[test]
    fn test_unit_variant_wire_shape() {
        let json = ControlMessage::ClearLocal.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ClearLocal"}"#);
        assert!(ControlMessage::ClearLocal.descriptor().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ControlMessage::from_json(r#"{"type":"SendPCBundles","payload":{}}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(
            ControlMessage::RequestMeshFrom { peer: PeerRef::new(2) }.type_name(),
            "RequestMeshFrom"
        );
        assert_eq!(ControlMessage::ClearAll { version: 1 }.type_name(), "ClearAll");
    }
}
