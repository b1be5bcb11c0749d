//! # Domain Types
//!
//! Identity types shared by every node in a room.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    PeerRef      │   │      Role       │   │    Platform     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  session-scoped │   │  Master         │   │  Android        │       │
//! │  │  participant id │   │  Client         │   │  HoloLens       │       │
//! │  │  (lookup key)   │   │  (fixed/session)│   │  Desktop        │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ports::TransferKind;

// =============================================================================
// Peer Reference
// =============================================================================

/// Opaque session-scoped participant identifier.
///
/// Assigned by the session layer when a node joins a room. It is only a
/// lookup key for addressing control messages; it owns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRef(u32);

impl PeerRef {
    /// Wraps a raw session-assigned id.
    #[inline]
    pub const fn new(id: u32) -> Self {
        PeerRef(id)
    }

    /// Returns the raw id.
    #[inline]
    pub const fn id(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

// =============================================================================
// Role
// =============================================================================

/// A node's fixed identity for the lifetime of a session.
///
/// Decided at session-join time; there is no mid-session role change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owns the authoritative mesh and creates the room.
    Master,

    /// Mirrors the master's mesh and requests platform bundles.
    #[default]
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" | "host" | "owner" => Ok(Role::Master),
            "client" | "receiver" => Ok(Role::Client),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

// =============================================================================
// Platform
// =============================================================================

/// Target platform of a client, used to pick its bundle set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Android handhelds.
    Android,

    /// HoloLens headsets.
    #[serde(alias = "wsa")]
    HoloLens,

    /// Desktop standalone builds (PC).
    #[default]
    #[serde(alias = "pc")]
    Desktop,
}

impl Platform {
    /// Every platform, in port-offset order.
    pub const ALL: [Platform; 3] = [Platform::Android, Platform::HoloLens, Platform::Desktop];

    /// Directory (under the bundle root) holding this platform's bundles.
    pub fn bundle_dir(&self) -> &'static str {
        match self {
            Platform::Android => "AssetBundlesAndroid",
            Platform::HoloLens => "AssetBundlesHololens",
            Platform::Desktop => "AssetBundlesPC",
        }
    }

    /// Transfer kind (and therefore port) carrying this platform's bundles.
    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::Bundle(*self)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Android => write!(f, "android"),
            Platform::HoloLens => write!(f, "hololens"),
            Platform::Desktop => write!(f, "desktop"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "hololens" | "wsa" => Ok(Platform::HoloLens),
            "desktop" | "pc" | "standalone" => Ok(Platform::Desktop),
            other => Err(CoreError::UnknownPlatform(other.to_string())),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!("Client".parse::<Role>().unwrap(), Role::Client);
        assert!("primary".parse::<Role>().is_err());
    }

    #[test]
    fn test_platform_parsing() {
        assert_eq!("android".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!("wsa".parse::<Platform>().unwrap(), Platform::HoloLens);
        assert_eq!("PC".parse::<Platform>().unwrap(), Platform::Desktop);
        assert!("ios".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_bundle_dirs_are_distinct() {
        let dirs: Vec<_> = Platform::ALL.iter().map(|p| p.bundle_dir()).collect();
        assert_eq!(dirs, ["AssetBundlesAndroid", "AssetBundlesHololens", "AssetBundlesPC"]);
    }

    #[test]
    fn test_platform_serde_names_match_display() {
        for platform in Platform::ALL {
            let json = serde_json::to_string(&platform).unwrap();
            assert_eq!(json, format!("\"{}\"", platform));
            assert_eq!(serde_json::from_str::<Platform>(&json).unwrap(), platform);
        }
        assert_eq!(serde_json::from_str::<Platform>("\"wsa\"").unwrap(), Platform::HoloLens);
        assert_eq!(serde_json::from_str::<Platform>("\"pc\"").unwrap(), Platform::Desktop);
        assert!(serde_json::from_str::<Platform>("\"holo_lens\"").is_err());
    }

    #[test]
    fn test_peer_ref_is_transparent_on_the_wire() {
        let json = serde_json::to_string(&PeerRef::new(7)).unwrap();
        assert_eq!(json, "7");
        assert_eq!(PeerRef::new(7).to_string(), "peer-7");
    }
}
