//! # Client Role
//!
//! A room member that mirrors the master's mesh and may push its own.
//!
//! ## State Machine
//! ```text
//! ┌──────────────────┐ JoinStarted ┌──────────┐  Joined  ┌──────────┐
//! │ AwaitingSession  │ ──────────► │ Joining  │ ───────► │  Joined  │
//! └──────────────────┘             └──────────┘          └──────────┘
//!          ▲                            │ JoinFailed
//!          └────────────────────────────┘ (session connection dropped)
//! ```
//!
//! On `Joined` the client asks the master for the mesh, then for its
//! platform's bundles.
//!
//! ## Version Gate
//! Every mesh-changing message from the master carries the master's store
//! version. The client remembers the highest version it applied and drops
//! anything older, so a slow `DeliverMeshAt` can never overwrite a newer
//! propagated mesh. The check and the store write happen under one lock.
//! A stale notification is still dialed and drained, so the announcing side
//! never waits out its timeout on a port nobody will connect to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use roommesh_core::{PeerRef, Platform, Role, TransferKind};
use tracing::{debug, info, warn};

use crate::bundles::BundleSink;
use crate::error::{SyncError, SyncResult};
use crate::node::{NodeContext, NodeEvent, NodeState};
use crate::protocol::{ControlMessage, TransferDescriptor};
use crate::session::{SessionEvent, Target};

// =============================================================================
// Version Gate
// =============================================================================

/// Highest master version applied to the local store.
#[derive(Debug, Clone, Default)]
pub(crate) struct VersionGate {
    applied: Arc<Mutex<u64>>,
}

impl VersionGate {
    pub(crate) fn applied(&self) -> u64 {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_stale(&self, version: u64) -> bool {
        version < self.applied()
    }

    /// Runs `apply` if `version` is not older than the last applied one.
    pub(crate) fn apply_if_current<T>(&self, version: u64, apply: impl FnOnce() -> T) -> Option<T> {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if version < *applied {
            return None;
        }
        let out = apply();
        *applied = version;
        Some(out)
    }
}

// =============================================================================
// Client
// =============================================================================

pub struct ClientRole {
    state: NodeState,
    platform: Platform,
    self_peer: Option<PeerRef>,
    master: Option<PeerRef>,
    gate: VersionGate,
    /// Incremental adds awaiting the master's `IncrementalAddReadyAt`, by
    /// request id. `None` sends the whole local mesh.
    pending_adds: HashMap<u64, Option<Bytes>>,
    next_request: u64,
    bundles: Arc<dyn BundleSink>,
}

impl ClientRole {
    pub fn new(platform: Platform, bundles: Arc<dyn BundleSink>) -> Self {
        ClientRole {
            state: NodeState::AwaitingSession,
            platform,
            self_peer: None,
            master: None,
            gate: VersionGate::default(),
            pending_adds: HashMap::new(),
            next_request: 0,
            bundles,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn self_peer(&self) -> Option<PeerRef> {
        self.self_peer
    }

    pub fn master(&self) -> Option<PeerRef> {
        self.master
    }

    fn joined_as(&self) -> SyncResult<PeerRef> {
        match (self.state, self.self_peer) {
            (NodeState::Joined, Some(peer)) => Ok(peer),
            _ => Err(SyncError::NotInSession),
        }
    }

    fn drop_pending_adds(&mut self, ctx: &NodeContext) {
        if !self.pending_adds.is_empty() {
            debug!(node = %ctx.name, count = self.pending_adds.len(), "Pending incremental adds dropped");
            self.pending_adds.clear();
        }
    }

    fn unexpected(&self, message: &ControlMessage) -> SyncError {
        SyncError::UnexpectedMessage {
            message: message.type_name(),
            role: Role::Client.to_string(),
            state: self.state.to_string(),
        }
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub(crate) fn on_session_event(&mut self, ctx: &NodeContext, event: SessionEvent) {
        match event {
            SessionEvent::JoinStarted { room } => {
                debug!(node = %ctx.name, room = %room, "Joining room");
                ctx.transition(&mut self.state, NodeState::Joining);
            }
            SessionEvent::Joined { self_peer, master } => {
                self.self_peer = Some(self_peer);
                self.master = Some(master);
                ctx.transition(&mut self.state, NodeState::Joined);

                let requests = [
                    ControlMessage::RequestMeshFrom { peer: self_peer },
                    ControlMessage::RequestBundles {
                        peer: self_peer,
                        platform: self.platform,
                    },
                ];
                for request in requests {
                    if let Err(e) = ctx.control.send(Target::Master, request) {
                        warn!(node = %ctx.name, error = %e, "Initial request to master failed");
                    }
                }
            }
            SessionEvent::JoinFailed { reason } => {
                warn!(node = %ctx.name, reason = %reason, "Join rejected, dropping session");
                self.self_peer = None;
                self.master = None;
                self.drop_pending_adds(ctx);
                ctx.transition(&mut self.state, NodeState::AwaitingSession);
                ctx.control.disconnect();
            }
            SessionEvent::RoomCreated { .. } => {
                warn!(node = %ctx.name, "Client received RoomCreated event, ignoring");
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    pub(crate) fn on_control(
        &mut self,
        ctx: &NodeContext,
        from: PeerRef,
        message: ControlMessage,
    ) -> SyncResult<()> {
        if self.joined_as().is_err() {
            return Err(self.unexpected(&message));
        }

        match message {
            ControlMessage::DeliverMeshAt { descriptor, version }
            | ControlMessage::PropagateMeshUpdated { descriptor, version } => {
                self.pull_mesh(ctx, descriptor, version);
                Ok(())
            }
            ControlMessage::BundleReadyAt { descriptor, path } => {
                let sink = self.bundles.clone();
                let platform = self.platform;
                let task = ctx.clone();
                ctx.spawn_transfer(descriptor.kind, async move {
                    let ctx = task;
                    let bytes = ctx.transfers.fetch(&descriptor).await?;
                    let len = bytes.len();
                    sink.load(platform, &path, bytes)?;
                    info!(node = %ctx.name, bundle = %path, bytes = len, "Bundle loaded");
                    ctx.emit(NodeEvent::BundleLoaded { name: path, len });
                    Ok(())
                });
                Ok(())
            }
            ControlMessage::IncrementalAddReadyAt { descriptor, request } => {
                let payload = match self.pending_adds.remove(&request) {
                    Some(Some(addition)) => addition,
                    Some(None) => ctx.store.snapshot().map(|s| s.bytes).unwrap_or_default(),
                    None => {
                        // Dialed anyway so the master's listener is released.
                        warn!(node = %ctx.name, request, "Unknown incremental add request, sending nothing");
                        Bytes::new()
                    }
                };
                let task = ctx.clone();
                ctx.spawn_transfer(TransferKind::IncrementalAdd, async move {
                    let ctx = task;
                    let written = ctx.transfers.push(&descriptor, payload).await?;
                    info!(node = %ctx.name, request, bytes = written, "Incremental add sent");
                    Ok(())
                });
                Ok(())
            }
            ControlMessage::ClearAll { version } => {
                let cleared = self.gate.apply_if_current(version, || {
                    ctx.store.clear();
                    ctx.store.version()
                });
                match cleared {
                    Some(local) => {
                        self.drop_pending_adds(ctx);
                        info!(node = %ctx.name, from = %from, version, "Mesh cleared by room");
                        ctx.emit(NodeEvent::MeshCleared { version: local });
                    }
                    None => {
                        warn!(node = %ctx.name, version, applied = self.gate.applied(), "Stale ClearAll ignored");
                    }
                }
                Ok(())
            }
            ControlMessage::ClearLocal => {
                self.drop_pending_adds(ctx);
                ctx.store.clear();
                ctx.emit(NodeEvent::MeshCleared {
                    version: ctx.store.version(),
                });
                Ok(())
            }
            other @ (ControlMessage::RequestMeshFrom { .. }
            | ControlMessage::RequestIncrementalAdd { .. }
            | ControlMessage::RequestBundles { .. }) => Err(self.unexpected(&other)),
        }
    }

    fn pull_mesh(&self, ctx: &NodeContext, descriptor: TransferDescriptor, version: u64) {
        if self.gate.is_stale(version) {
            debug!(
                node = %ctx.name,
                version,
                applied = self.gate.applied(),
                "Stale mesh notification, draining without applying"
            );
        }

        let gate = self.gate.clone();
        let task = ctx.clone();
        ctx.spawn_transfer(descriptor.kind, async move {
            let ctx = task;
            let bytes = ctx.transfers.fetch(&descriptor).await?;
            let len = bytes.len();

            // Re-checked at apply time: a newer version may have landed
            // while this transfer was in flight.
            match gate.apply_if_current(version, || ctx.store.replace(bytes)) {
                Some(local) => {
                    info!(node = %ctx.name, bytes = len, version, "Mesh received");
                    ctx.emit(NodeEvent::MeshReplaced { len, version: local });
                }
                None => {
                    warn!(node = %ctx.name, version, applied = gate.applied(), "Stale mesh dropped after transfer");
                }
            }
            Ok(())
        });
    }

    // =========================================================================
    // Local Intents
    // =========================================================================

    /// Offers the local mesh to the master as a full replace.
    ///
    /// The client listens on its own MeshReplace port and the master dials in.
    pub(crate) fn push_mesh(&mut self, ctx: &NodeContext) -> SyncResult<()> {
        self.joined_as()?;
        let Some(snapshot) = ctx.store.snapshot().filter(|s| !s.is_empty()) else {
            debug!(node = %ctx.name, "Nothing to push");
            return Ok(());
        };

        let task = ctx.clone();
        ctx.spawn_transfer(TransferKind::MeshReplace, async move {
            let ctx = task;
            let pending = ctx.transfers.open(TransferKind::MeshReplace).await?;
            ctx.control.send(
                Target::Master,
                ControlMessage::DeliverMeshAt {
                    descriptor: pending.descriptor().clone(),
                    version: snapshot.version,
                },
            )?;
            let written = pending.serve(snapshot.bytes).await?;
            info!(node = %ctx.name, bytes = written, "Mesh pushed to master");
            Ok(())
        });
        Ok(())
    }

    /// Asks the master to append `addition`, or the whole local mesh when
    /// `None`. A given addition is also appended locally.
    pub(crate) fn push_incremental(&mut self, ctx: &NodeContext, addition: Option<Bytes>) -> SyncResult<()> {
        let peer = self.joined_as()?;
        let payload = match addition {
            Some(bytes) if bytes.is_empty() => {
                debug!(node = %ctx.name, "Empty addition ignored");
                return Ok(());
            }
            Some(bytes) => {
                let added = bytes.len();
                let version = ctx.store.append(bytes.clone());
                ctx.emit(NodeEvent::MeshAppended {
                    added,
                    len: ctx.store.len(),
                    version,
                });
                Some(bytes)
            }
            None if ctx.store.is_empty() => {
                debug!(node = %ctx.name, "Nothing to add");
                return Ok(());
            }
            None => None,
        };

        let request = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);
        self.pending_adds.insert(request, payload);

        let sent = ctx
            .control
            .send(Target::Master, ControlMessage::RequestIncrementalAdd { peer, request });
        if sent.is_err() {
            self.pending_adds.remove(&request);
        }
        sent
    }

    /// Asks the master to clear the mesh everywhere, this node included.
    pub(crate) fn delete_mesh(&mut self, ctx: &NodeContext) -> SyncResult<()> {
        self.joined_as()?;
        if ctx.store.is_empty() {
            debug!(node = %ctx.name, "No mesh to delete");
            return Ok(());
        }
        ctx.control.send(
            Target::Master,
            ControlMessage::ClearAll {
                version: self.gate.applied(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::bundles::DiscardBundles;
    use crate::test_support::{test_context, wait_until};

    fn joined(ctx: &NodeContext) -> ClientRole {
        let mut role = ClientRole::new(Platform::Android, Arc::new(DiscardBundles));
        role.on_session_event(ctx, SessionEvent::JoinStarted { room: "lab".into() });
        role.on_session_event(
            ctx,
            SessionEvent::Joined {
                self_peer: PeerRef::new(2),
                master: PeerRef::new(1),
            },
        );
        role
    }

    #[test]
    fn test_gate_drops_older_versions() {
        let gate = VersionGate::default();
        assert_eq!(gate.apply_if_current(3, || "v3"), Some("v3"));
        assert!(gate.is_stale(2));
        assert_eq!(gate.apply_if_current(2, || "v2"), None);
        assert_eq!(gate.apply_if_current(3, || "again"), Some("again"));
        assert_eq!(gate.applied(), 3);
    }

    #[tokio::test]
    async fn test_join_requests_mesh_then_bundles() {
        let (ctx, control, _observer) = test_context();
        let role = joined(&ctx);
        assert_eq!(role.state(), NodeState::Joined);

        let sent = control.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (Target::Master, ControlMessage::RequestMeshFrom { peer: PeerRef::new(2) }));
        assert_eq!(
            sent[1],
            (
                Target::Master,
                ControlMessage::RequestBundles {
                    peer: PeerRef::new(2),
                    platform: Platform::Android
                }
            )
        );
    }

    #[tokio::test]
    async fn test_join_failed_returns_to_awaiting_and_disconnects() {
        let (ctx, control, _observer) = test_context();
        let mut role = ClientRole::new(Platform::Desktop, Arc::new(DiscardBundles));
        role.on_session_event(&ctx, SessionEvent::JoinStarted { room: "lab".into() });
        assert_eq!(role.state(), NodeState::Joining);

        role.on_session_event(&ctx, SessionEvent::JoinFailed { reason: "full".into() });
        assert_eq!(role.state(), NodeState::AwaitingSession);
        assert_eq!(control.disconnects(), 1);
        assert!(matches!(role.push_mesh(&ctx), Err(SyncError::NotInSession)));
    }

    #[tokio::test]
    async fn test_stale_clear_all_is_ignored() {
        let (ctx, _control, _observer) = test_context();
        let mut role = joined(&ctx);
        role.gate.apply_if_current(5, || ());
        ctx.store.replace(vec![1u8, 2]);

        role.on_control(&ctx, PeerRef::new(1), ControlMessage::ClearAll { version: 4 })
            .unwrap();
        assert_eq!(ctx.store.len(), 2);

        role.on_control(&ctx, PeerRef::new(1), ControlMessage::ClearAll { version: 6 })
            .unwrap();
        assert!(ctx.store.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_delivered_mesh_is_applied() {
        let (ctx, _control, observer) = test_context();
        let mut role = joined(&ctx);

        let pending = ctx.transfers.open(TransferKind::MeshReplace).await.unwrap();
        let descriptor = pending.descriptor().clone();
        tokio::spawn(pending.serve(Bytes::from_static(b"room-mesh")));

        role.on_control(&ctx, PeerRef::new(1), ControlMessage::DeliverMeshAt { descriptor, version: 1 })
            .unwrap();
        wait_until(|| !ctx.store.is_empty()).await;

        assert_eq!(ctx.store.snapshot().unwrap().bytes.as_ref(), b"room-mesh");
        assert_eq!(role.gate.applied(), 1);
        wait_until(|| {
            observer
                .events()
                .iter()
                .any(|e| matches!(e, NodeEvent::MeshReplaced { len: 9, .. }))
        })
        .await;
    }

    #[tokio::test]
    async fn test_delete_requires_local_mesh() {
        let (ctx, control, _observer) = test_context();
        let mut role = joined(&ctx);
        let before = control.sent().len();

        role.delete_mesh(&ctx).unwrap();
        assert_eq!(control.sent().len(), before);

        ctx.store.replace(vec![9u8]);
        role.delete_mesh(&ctx).unwrap();
        let (target, message) = control.sent().pop().unwrap();
        assert_eq!(target, Target::Master);
        assert!(matches!(message, ControlMessage::ClearAll { .. }));
        // Local copy is cleared only when the master's broadcast arrives.
        assert_eq!(ctx.store.len(), 1);
    }

    #[tokio::test]
    async fn test_push_incremental_appends_locally_and_requests() {
        let (ctx, control, _observer) = test_context();
        let mut role = joined(&ctx);
        ctx.store.replace(vec![1u8]);

        role.push_incremental(&ctx, Some(Bytes::from_static(&[2, 3]))).unwrap();
        assert_eq!(ctx.store.snapshot().unwrap().bytes.as_ref(), &[1, 2, 3]);
        assert_eq!(
            control.sent().pop().unwrap(),
            (
                Target::Master,
                ControlMessage::RequestIncrementalAdd {
                    peer: PeerRef::new(2),
                    request: 0
                }
            )
        );
        assert_eq!(role.pending_adds.len(), 1);
    }

    #[tokio::test]
    async fn test_ready_at_sends_the_matching_addition() {
        let (ctx, _control, _observer) = test_context();
        let mut role = joined(&ctx);
        role.push_incremental(&ctx, Some(Bytes::from_static(b"AAAA"))).unwrap();
        role.push_incremental(&ctx, Some(Bytes::from_static(b"BBBB"))).unwrap();

        let pending = ctx.transfers.open(TransferKind::IncrementalAdd).await.unwrap();
        let descriptor = pending.descriptor().clone();
        let collected = tokio::spawn(pending.collect());

        role.on_control(
            &ctx,
            PeerRef::new(1),
            ControlMessage::IncrementalAddReadyAt { descriptor, request: 1 },
        )
        .unwrap();

        assert_eq!(collected.await.unwrap().unwrap().as_ref(), b"BBBB");
        assert_eq!(role.pending_adds.len(), 1);
        assert_eq!(role.pending_adds.get(&0), Some(&Some(Bytes::from_static(b"AAAA"))));
    }

    #[tokio::test]
    async fn test_unknown_ready_at_releases_master_listener() {
        let (ctx, _control, _observer) = test_context();
        let mut role = joined(&ctx);
        ctx.store.replace(vec![5u8; 16]);

        let pending = ctx.transfers.open(TransferKind::IncrementalAdd).await.unwrap();
        let descriptor = pending.descriptor().clone();
        let collected = tokio::spawn(pending.collect());

        role.on_control(
            &ctx,
            PeerRef::new(1),
            ControlMessage::IncrementalAddReadyAt { descriptor, request: 42 },
        )
        .unwrap();

        let bytes = tokio::time::timeout(Duration::from_secs(2), collected)
            .await
            .expect("listener should be released promptly")
            .unwrap()
            .unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_and_session_drop_forget_pending_adds() {
        let (ctx, _control, _observer) = test_context();
        let mut role = joined(&ctx);
        role.push_incremental(&ctx, Some(Bytes::from_static(b"AAAA"))).unwrap();
        assert_eq!(role.pending_adds.len(), 1);

        role.on_control(&ctx, PeerRef::new(1), ControlMessage::ClearAll { version: 0 })
            .unwrap();
        assert!(role.pending_adds.is_empty());

        ctx.store.replace(vec![1u8]);
        role.push_incremental(&ctx, None).unwrap();
        assert_eq!(role.pending_adds.get(&1), Some(&None));

        role.on_session_event(&ctx, SessionEvent::JoinFailed { reason: "dropped".into() });
        assert!(role.pending_adds.is_empty());
    }

    #[tokio::test]
    async fn test_stale_delivery_is_drained_not_applied() {
        let (ctx, _control, observer) = test_context();
        let mut role = joined(&ctx);
        role.gate.apply_if_current(5, || ());
        ctx.store.replace(Bytes::from_static(b"current"));

        let pending = ctx.transfers.open(TransferKind::MeshReplace).await.unwrap();
        let descriptor = pending.descriptor().clone();
        let served = tokio::spawn(pending.serve(Bytes::from_static(b"old-mesh")));

        role.on_control(&ctx, PeerRef::new(1), ControlMessage::DeliverMeshAt { descriptor, version: 1 })
            .unwrap();

        let written = tokio::time::timeout(Duration::from_secs(2), served)
            .await
            .expect("announced transfer should be dialed promptly")
            .unwrap()
            .unwrap();
        assert_eq!(written, 8);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.store.snapshot().unwrap().bytes.as_ref(), b"current");
        assert_eq!(role.gate.applied(), 5);
        assert!(!observer
            .events()
            .iter()
            .any(|e| matches!(e, NodeEvent::MeshReplaced { .. } | NodeEvent::TransferFailed { .. })));
    }

    #[tokio::test]
    async fn test_master_only_messages_are_unexpected() {
        let (ctx, _control, _observer) = test_context();
        let mut role = joined(&ctx);
        let err = role
            .on_control(&ctx, PeerRef::new(1), ControlMessage::RequestMeshFrom { peer: PeerRef::new(3) })
            .unwrap_err();
        assert!(err.is_protocol_error());
    }
}
