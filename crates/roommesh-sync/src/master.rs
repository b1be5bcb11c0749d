//! # Master Role
//!
//! The room owner. Holds the authoritative mesh, serves it to joining
//! clients, accepts client pushes and re-broadcasts every change.
//!
//! ## State Machine
//! ```text
//! ┌──────────────────┐   RoomCreated    ┌──────────────┐
//! │ AwaitingSession  │ ───────────────► │  RoomOwner   │
//! └──────────────────┘                  └──────────────┘
//!          │ JoinFailed                        │
//!          └──── stays, host may retry         └── snapshot server on MeshPull
//! ```
//!
//! ## Message Handling (RoomOwner)
//! | Message               | Action                                                   |
//! |-----------------------|----------------------------------------------------------|
//! | RequestMeshFrom       | if store non-empty: open MeshReplace, DeliverMeshAt      |
//! | RequestBundles        | per file: open Bundle(platform), BundleReadyAt, serve    |
//! | DeliverMeshAt         | fetch client's mesh, replace, Propagate to others-except |
//! | RequestIncrementalAdd | open IncrementalAdd, ReadyAt, collect, append, Propagate |
//! |                       | (an empty addition is collected and dropped)             |
//! | ClearAll              | clear, re-broadcast ClearAll to every other node         |
//! | ClearLocal            | clear                                                    |

use bytes::Bytes;
use roommesh_core::{PeerRef, Platform, Role, TransferKind};
use tracing::{debug, info, warn};

use crate::bundles::BundleCatalog;
use crate::error::{SyncError, SyncResult};
use crate::node::{NodeContext, NodeEvent, NodeState};
use crate::protocol::ControlMessage;
use crate::session::{SessionEvent, Target};

pub struct MasterRole {
    state: NodeState,
    self_peer: Option<PeerRef>,
    catalog: BundleCatalog,
}

impl MasterRole {
    pub fn new(catalog: BundleCatalog) -> Self {
        MasterRole {
            state: NodeState::AwaitingSession,
            self_peer: None,
            catalog,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn self_peer(&self) -> Option<PeerRef> {
        self.self_peer
    }

    fn in_room(&self) -> bool {
        self.state == NodeState::RoomOwner
    }

    fn unexpected(&self, message: &ControlMessage) -> SyncError {
        SyncError::UnexpectedMessage {
            message: message.type_name(),
            role: Role::Master.to_string(),
            state: self.state.to_string(),
        }
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub(crate) fn on_session_event(&mut self, ctx: &NodeContext, event: SessionEvent) {
        match event {
            SessionEvent::RoomCreated { self_peer } => {
                if self.in_room() {
                    warn!(node = %ctx.name, "RoomCreated while already owning a room");
                    return;
                }
                self.self_peer = Some(self_peer);
                ctx.transition(&mut self.state, NodeState::RoomOwner);

                let serve_ctx = ctx.clone();
                tokio::spawn(async move {
                    let result = serve_ctx
                        .transfers
                        .serve_snapshots(serve_ctx.store.clone())
                        .await;
                    serve_ctx.finish_transfer(TransferKind::MeshPull, result);
                });
            }
            SessionEvent::JoinFailed { reason } => {
                warn!(node = %ctx.name, reason = %reason, "Room creation rejected");
            }
            SessionEvent::JoinStarted { .. } => {}
            SessionEvent::Joined { .. } => {
                warn!(node = %ctx.name, "Master received Joined event, ignoring");
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
        if !self.in_room() {
            return Err(self.unexpected(&message));
        }

        match message {
            ControlMessage::RequestMeshFrom { peer } => {
                self.serve_mesh_to(ctx, peer);
                Ok(())
            }
            ControlMessage::RequestBundles { peer, platform } => {
                self.serve_bundles_to(ctx, peer, platform);
                Ok(())
            }
            ControlMessage::DeliverMeshAt { descriptor, .. } => {
                // Client push: the client's version belongs to its own store.
                let task = ctx.clone();
                ctx.spawn_transfer(descriptor.kind, async move {
                    let ctx = task;
                    let bytes = ctx.transfers.fetch(&descriptor).await?;
                    let len = bytes.len();
                    let version = ctx.store.replace(bytes);
                    info!(node = %ctx.name, from = %from, bytes = len, version, "Mesh replaced by client push");
                    ctx.emit(NodeEvent::MeshReplaced { len, version });
                    propagate(&ctx, Target::OthersExcept(from), version)
                });
                Ok(())
            }
            ControlMessage::RequestIncrementalAdd { peer, request } => {
                let task = ctx.clone();
                ctx.spawn_transfer(TransferKind::IncrementalAdd, async move {
                    let ctx = task;
                    let pending = ctx.transfers.open(TransferKind::IncrementalAdd).await?;
                    ctx.control.send(
                        Target::Peer(peer),
                        ControlMessage::IncrementalAddReadyAt {
                            descriptor: pending.descriptor().clone(),
                            request,
                        },
                    )?;
                    let addition = pending.collect().await?;
                    let added = addition.len();
                    if added == 0 {
                        debug!(node = %ctx.name, from = %peer, request, "Empty incremental add, nothing to merge");
                        return Ok(());
                    }
                    let version = ctx.store.append(addition);
                    let len = ctx.store.len();
                    info!(node = %ctx.name, from = %peer, added, len, version, "Incremental add merged");
                    ctx.emit(NodeEvent::MeshAppended { added, len, version });
                    propagate(&ctx, Target::OthersExcept(peer), version)
                });
                Ok(())
            }
            ControlMessage::ClearAll { .. } => {
                info!(node = %ctx.name, from = %from, "Delete requested by client");
                self.clear_all(ctx)
            }
            ControlMessage::ClearLocal => {
                clear_store(ctx);
                Ok(())
            }
            other @ (ControlMessage::PropagateMeshUpdated { .. }
            | ControlMessage::IncrementalAddReadyAt { .. }
            | ControlMessage::BundleReadyAt { .. }) => Err(self.unexpected(&other)),
        }
    }

    fn serve_mesh_to(&self, ctx: &NodeContext, peer: PeerRef) {
        let snapshot = match ctx.store.snapshot() {
            Some(snapshot) if !snapshot.is_empty() => snapshot,
            _ => {
                debug!(node = %ctx.name, peer = %peer, "No mesh yet, nothing to deliver");
                return;
            }
        };

        let task = ctx.clone();
        ctx.spawn_transfer(TransferKind::MeshReplace, async move {
            let ctx = task;
            let pending = ctx.transfers.open(TransferKind::MeshReplace).await?;
            ctx.control.send(
                Target::Peer(peer),
                ControlMessage::DeliverMeshAt {
                    descriptor: pending.descriptor().clone(),
                    version: snapshot.version,
                },
            )?;
            let written = pending.serve(snapshot.bytes).await?;
            info!(node = %ctx.name, peer = %peer, bytes = written, version = snapshot.version, "Mesh delivered");
            Ok(())
        });
    }

    fn serve_bundles_to(&self, ctx: &NodeContext, peer: PeerRef, platform: Platform) {
        let catalog = self.catalog.clone();
        let ctx = ctx.clone();
        let kind = platform.transfer_kind();

        tokio::spawn(async move {
            let entries = match catalog.list(platform) {
                Ok(entries) => entries,
                Err(e) => {
                    ctx.finish_transfer(kind, Err(e));
                    return;
                }
            };
            info!(node = %ctx.name, peer = %peer, platform = %platform, count = entries.len(), "Serving bundles");

            // One full announce/serve cycle per file; the next file waits on
            // the port lease.
            for entry in entries {
                let result = async {
                    let bytes = catalog.read(&entry).await?;
                    let pending = ctx.transfers.open(kind).await?;
                    ctx.control.send(
                        Target::Peer(peer),
                        ControlMessage::BundleReadyAt {
                            descriptor: pending.descriptor().clone(),
                            path: entry.name.clone(),
                        },
                    )?;
                    let written = pending.serve(bytes).await?;
                    debug!(node = %ctx.name, peer = %peer, bundle = %entry.name, bytes = written, "Bundle served");
                    Ok::<(), SyncError>(())
                }
                .await;

                let cancelled = matches!(result, Err(SyncError::Cancelled));
                ctx.finish_transfer(kind, result);
                if cancelled {
                    break;
                }
            }
        });
    }

    // =========================================================================
    // Local Intents
    // =========================================================================

    /// Clears the local store and tells every other node to do the same.
    pub(crate) fn clear_all(&mut self, ctx: &NodeContext) -> SyncResult<()> {
        let version = clear_store(ctx);
        if self.in_room() {
            ctx.control.send(Target::Others, ControlMessage::ClearAll { version })?;
        }
        Ok(())
    }

    /// Replaces the mesh and tells every client to re-pull.
    pub(crate) fn publish_replace(&mut self, ctx: &NodeContext, bytes: Bytes) -> SyncResult<()> {
        let len = bytes.len();
        let version = ctx.store.replace(bytes);
        ctx.emit(NodeEvent::MeshReplaced { len, version });
        if self.in_room() {
            propagate(ctx, Target::Others, version)?;
        }
        Ok(())
    }

    /// Appends to the mesh and tells every client to re-pull.
    pub(crate) fn publish_append(&mut self, ctx: &NodeContext, bytes: Bytes) -> SyncResult<()> {
        let added = bytes.len();
        let version = ctx.store.append(bytes);
        ctx.emit(NodeEvent::MeshAppended {
            added,
            len: ctx.store.len(),
            version,
        });
        if self.in_room() {
            propagate(ctx, Target::Others, version)?;
        }
        Ok(())
    }
}

fn propagate(ctx: &NodeContext, target: Target, version: u64) -> SyncResult<()> {
    ctx.control.send(
        target,
        ControlMessage::PropagateMeshUpdated {
            descriptor: ctx.transfers.descriptor_for(TransferKind::MeshPull),
            version,
        },
    )
}

fn clear_store(ctx: &NodeContext) -> u64 {
    ctx.store.clear();
    let version = ctx.store.version();
    info!(node = %ctx.name, version, "Mesh cleared");
    ctx.emit(NodeEvent::MeshCleared { version });
    version
}
