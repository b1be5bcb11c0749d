//! # Room Node
//!
//! Runs one participant of a room: owns the store handle, the transfer
//! service and the role state machine, and routes session callbacks and
//! local intents into it.
//!
//! ## Node Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Node Architecture                              │
//! │                                                                         │
//! │   session layer ──on_control / on_session_event──┐                      │
//! │   host app ───────intent (push, delete, publish)─┤                      │
//! │                                                  ▼                      │
//! │                                     unbounded command channel           │
//! │                                                  │                      │
//! │  ┌───────────────────────────────────────────────▼──────────────────┐  │
//! │  │                   Node task (single dispatcher)                  │  │
//! │  │                                                                  │  │
//! │  │   match role {                                                   │  │
//! │  │     Master(m) => m.on_control(ctx, from, msg),                   │  │
//! │  │     Client(c) => c.on_control(ctx, from, msg),                   │  │
//! │  │   }                                                              │  │
//! │  └───────────────┬──────────────────────────────────────────────────┘  │
//! │                  │ spawns one task per transfer                         │
//! │                  ▼                                                      │
//! │   TransferService ── BulkChannel ── SharedStore ── NodeObserver         │
//! │                                                                         │
//! │  The dispatcher never waits on a socket. Shutdown cancels every         │
//! │  listener and in-flight transfer through one CancellationToken.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use roommesh_core::{PeerRef, Role, SharedStore, TransferKind};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundles::{BundleCatalog, BundleSink, DiscardBundles};
use crate::client::ClientRole;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::master::MasterRole;
use crate::protocol::ControlMessage;
use crate::session::{ControlPlane, SessionEvent, SessionSink};
use crate::transfer::TransferService;

// =============================================================================
// State & Status
// =============================================================================

/// Role state machine position.
///
/// Master: `AwaitingSession → RoomOwner`.
/// Client: `AwaitingSession → Joining → Joined`, back to `AwaitingSession`
/// on a rejected join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    AwaitingSession,
    Joining,
    Joined,
    RoomOwner,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::AwaitingSession => write!(f, "awaiting_session"),
            NodeState::Joining => write!(f, "joining"),
            NodeState::Joined => write!(f, "joined"),
            NodeState::RoomOwner => write!(f, "room_owner"),
        }
    }
}

/// Snapshot of a node for external queries.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub name: String,
    pub role: Role,
    pub state: NodeState,
    pub room: String,
    pub self_peer: Option<PeerRef>,
    pub master: Option<PeerRef>,
    pub running: bool,

    /// Current mesh length (0 when absent).
    pub store_len: usize,
    pub last_modified: Option<DateTime<Utc>>,
    pub version: u64,

    pub transfers_ok: u64,
    pub transfers_failed: u64,
}

// =============================================================================
// Observer
// =============================================================================

/// Notifications for the host (renderer, bundle loader, UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    StateChanged { from: NodeState, to: NodeState },

    /// Mesh replaced wholesale.
    MeshReplaced { len: usize, version: u64 },

    /// Incremental addition merged into the mesh.
    MeshAppended { added: usize, len: usize, version: u64 },

    /// Store cleared. Displayed artifacts of the old mesh should be retired.
    MeshCleared { version: u64 },

    BundleLoaded { name: String, len: usize },

    /// A transfer was abandoned. The store was not modified by it.
    TransferFailed { kind: TransferKind, error: String },
}

/// Receives [`NodeEvent`]s. Called from transfer tasks, so keep it cheap.
pub trait NodeObserver: Send + Sync {
    fn on_event(&self, event: &NodeEvent);
}

/// Observer that ignores everything.
pub struct NoOpObserver;

impl NodeObserver for NoOpObserver {
    fn on_event(&self, _event: &NodeEvent) {}
}

// =============================================================================
// Shared Context
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct TransferCounters {
    ok: AtomicU64,
    failed: AtomicU64,
}

/// Everything a role handler or transfer task needs. Cheap to clone.
#[derive(Clone)]
pub(crate) struct NodeContext {
    pub(crate) name: Arc<str>,
    pub(crate) store: SharedStore,
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) transfers: TransferService,
    pub(crate) observer: Arc<dyn NodeObserver>,
    pub(crate) counters: Arc<TransferCounters>,
}

impl NodeContext {
    pub(crate) fn emit(&self, event: NodeEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn transition(&self, state: &mut NodeState, to: NodeState) {
        if *state == to {
            return;
        }
        let from = *state;
        *state = to;
        info!(node = %self.name, from = %from, to = %to, "State changed");
        self.emit(NodeEvent::StateChanged { from, to });
    }

    /// Records the outcome of one transfer.
    pub(crate) fn finish_transfer(&self, kind: TransferKind, result: SyncResult<()>) {
        match result {
            Ok(()) => {
                self.counters.ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(SyncError::Cancelled) => {
                debug!(node = %self.name, kind = %kind, "Transfer cancelled by shutdown");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(e, SyncError::PortInUse { .. }) {
                    error!(node = %self.name, kind = %kind, error = %e, "Transfer failed");
                } else {
                    warn!(node = %self.name, kind = %kind, error = %e, "Transfer abandoned");
                }
                self.emit(NodeEvent::TransferFailed {
                    kind,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Runs one transfer off the dispatcher and records its outcome.
    pub(crate) fn spawn_transfer<F>(&self, kind: TransferKind, fut: F)
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let ctx = self.clone();
        tokio::spawn(async move {
            let result = fut.await;
            ctx.finish_transfer(kind, result);
        });
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Things the host can ask a node to do locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalIntent {
    /// Client: offer the local mesh to the master as a full replace.
    PushMesh,

    /// Client: offer an addition (or the whole local mesh when `None`)
    /// for the master to append.
    PushIncremental(Option<Bytes>),

    /// Master: clear everywhere. Client: ask the master to clear everywhere.
    Delete,

    /// Master: replace the mesh and tell every client to re-pull.
    PublishReplace(Bytes),

    /// Master: append to the mesh and tell every client to re-pull.
    PublishAppend(Bytes),
}

impl LocalIntent {
    fn name(&self) -> &'static str {
        match self {
            LocalIntent::PushMesh => "push_mesh",
            LocalIntent::PushIncremental(_) => "push_incremental",
            LocalIntent::Delete => "delete",
            LocalIntent::PublishReplace(_) => "publish_replace",
            LocalIntent::PublishAppend(_) => "publish_append",
        }
    }
}

#[derive(Debug)]
enum Command {
    Control { from: PeerRef, message: ControlMessage },
    Session(SessionEvent),
    Intent(LocalIntent),
    Shutdown,
}

// =============================================================================
// Role Dispatch
// =============================================================================

/// Role-specific state, fixed for the session.
enum NodeRole {
    Master(MasterRole),
    Client(ClientRole),
}

impl NodeRole {
    fn state(&self) -> NodeState {
        match self {
            NodeRole::Master(m) => m.state(),
            NodeRole::Client(c) => c.state(),
        }
    }

    fn master(&self) -> Option<PeerRef> {
        match self {
            NodeRole::Master(m) => m.self_peer(),
            NodeRole::Client(c) => c.master(),
        }
    }

    fn self_peer(&self) -> Option<PeerRef> {
        match self {
            NodeRole::Master(m) => m.self_peer(),
            NodeRole::Client(c) => c.self_peer(),
        }
    }
}

struct Node {
    ctx: NodeContext,
    role: NodeRole,
    status: Arc<RwLock<NodeStatus>>,
}

impl Node {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        info!(node = %self.ctx.name, "Node started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if matches!(cmd, Command::Shutdown) {
                        break;
                    }
                    self.handle(cmd);
                    self.refresh_status().await;
                }
            }
        }

        cancel.cancel();
        self.status.write().await.running = false;
        info!(node = %self.ctx.name, "Node stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let result = match cmd {
            Command::Control { from, message } => {
                debug!(node = %self.ctx.name, from = %from, message = message.type_name(), "Control message");
                self.dispatch(from, message)
            }
            Command::Session(event) => {
                match &mut self.role {
                    NodeRole::Master(m) => m.on_session_event(&self.ctx, event),
                    NodeRole::Client(c) => c.on_session_event(&self.ctx, event),
                }
                Ok(())
            }
            Command::Intent(intent) => {
                debug!(node = %self.ctx.name, intent = intent.name(), "Local intent");
                self.intent(intent)
            }
            Command::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            warn!(node = %self.ctx.name, error = %e, "Command failed");
        }
    }

    fn dispatch(&mut self, from: PeerRef, message: ControlMessage) -> SyncResult<()> {
        match &mut self.role {
            NodeRole::Master(m) => m.on_control(&self.ctx, from, message),
            NodeRole::Client(c) => c.on_control(&self.ctx, from, message),
        }
    }

    fn intent(&mut self, intent: LocalIntent) -> SyncResult<()> {
        match (&mut self.role, intent) {
            (NodeRole::Master(m), LocalIntent::Delete) => m.clear_all(&self.ctx),
            (NodeRole::Master(m), LocalIntent::PublishReplace(bytes)) => {
                m.publish_replace(&self.ctx, bytes)
            }
            (NodeRole::Master(m), LocalIntent::PublishAppend(bytes)) => {
                m.publish_append(&self.ctx, bytes)
            }
            (NodeRole::Client(c), LocalIntent::PushMesh) => c.push_mesh(&self.ctx),
            (NodeRole::Client(c), LocalIntent::PushIncremental(bytes)) => {
                c.push_incremental(&self.ctx, bytes)
            }
            (NodeRole::Client(c), LocalIntent::Delete) => c.delete_mesh(&self.ctx),
            (role, intent) => {
                let role = match role {
                    NodeRole::Master(_) => Role::Master,
                    NodeRole::Client(_) => Role::Client,
                };
                warn!(node = %self.ctx.name, role = %role, intent = intent.name(), "Intent not supported for role");
                Ok(())
            }
        }
    }

    async fn refresh_status(&self) {
        let mut status = self.status.write().await;
        status.state = self.role.state();
        status.self_peer = self.role.self_peer();
        status.master = self.role.master();
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and starts a node.
///
/// ## Usage
/// ```rust,ignore
/// let session = LocalSession::new();
/// let endpoint = session.endpoint();
///
/// let node = NodeBuilder::new(config)
///     .with_observer(Arc::new(MyRenderer))
///     .start(Arc::new(endpoint.clone()))?;
///
/// endpoint.attach(Arc::new(node.clone()));
/// endpoint.join("lab-room");
/// ```
pub struct NodeBuilder {
    config: SyncConfig,
    store: Option<SharedStore>,
    observer: Option<Arc<dyn NodeObserver>>,
    bundle_sink: Option<Arc<dyn BundleSink>>,
}

impl NodeBuilder {
    pub fn new(config: SyncConfig) -> Self {
        NodeBuilder {
            config,
            store: None,
            observer: None,
            bundle_sink: None,
        }
    }

    /// Uses an existing store (e.g. one the renderer already holds).
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn NodeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_bundle_sink(mut self, sink: Arc<dyn BundleSink>) -> Self {
        self.bundle_sink = Some(sink);
        self
    }

    /// Validates the config and spawns the node task.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start(self, control: Arc<dyn ControlPlane>) -> SyncResult<NodeHandle> {
        self.config.validate()?;

        let ports = self.config.ports()?;
        let cancel = CancellationToken::new();
        let transfers = TransferService::new(ports, &self.config.transfer, cancel.clone());
        let store = self.store.unwrap_or_default();
        let observer = self.observer.unwrap_or_else(|| Arc::new(NoOpObserver));
        let name: Arc<str> = Arc::from(self.config.node.name.as_str());

        let ctx = NodeContext {
            name: name.clone(),
            store: store.clone(),
            control,
            transfers,
            observer,
            counters: Arc::new(TransferCounters::default()),
        };

        let role = match self.config.role() {
            Role::Master => NodeRole::Master(MasterRole::new(BundleCatalog::new(
                self.config.bundles.clone(),
            ))),
            Role::Client => NodeRole::Client(ClientRole::new(
                self.config.platform(),
                self.bundle_sink.unwrap_or_else(|| Arc::new(DiscardBundles)),
            )),
        };

        let status = Arc::new(RwLock::new(NodeStatus {
            name: name.to_string(),
            role: self.config.role(),
            state: role.state(),
            room: self.config.room_name().to_string(),
            self_peer: None,
            master: None,
            running: true,
            store_len: 0,
            last_modified: None,
            version: 0,
            transfers_ok: 0,
            transfers_failed: 0,
        }));

        info!(
            node = %name,
            role = %self.config.role(),
            platform = %self.config.platform(),
            room = %self.config.room_name(),
            base_port = ports.base(),
            host = %ctx.transfers.advertise_host(),
            framing = %self.config.transfer.framing,
            "Starting room node"
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = NodeHandle {
            cmd_tx,
            status: status.clone(),
            store,
            counters: ctx.counters.clone(),
            cancel: cancel.clone(),
        };

        let node = Node { ctx, role, status };
        tokio::spawn(node.run(cmd_rx, cancel));

        Ok(handle)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for driving a running node from the host. Cheap to clone.
///
/// All methods are non-blocking and safe to call from any thread.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<NodeStatus>>,
    store: SharedStore,
    counters: Arc<TransferCounters>,
    cancel: CancellationToken,
}

impl NodeHandle {
    fn send(&self, cmd: Command) -> SyncResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| SyncError::ShuttingDown)
    }

    /// Feeds one inbound control message.
    pub fn deliver(&self, from: PeerRef, message: ControlMessage) -> SyncResult<()> {
        self.send(Command::Control { from, message })
    }

    /// Feeds one membership callback.
    pub fn session_event(&self, event: SessionEvent) -> SyncResult<()> {
        self.send(Command::Session(event))
    }

    pub fn intent(&self, intent: LocalIntent) -> SyncResult<()> {
        self.send(Command::Intent(intent))
    }

    pub fn push_mesh(&self) -> SyncResult<()> {
        self.intent(LocalIntent::PushMesh)
    }

    pub fn push_incremental(&self, addition: Option<Bytes>) -> SyncResult<()> {
        self.intent(LocalIntent::PushIncremental(addition))
    }

    pub fn delete_mesh(&self) -> SyncResult<()> {
        self.intent(LocalIntent::Delete)
    }

    pub fn publish_replace(&self, bytes: impl Into<Bytes>) -> SyncResult<()> {
        self.intent(LocalIntent::PublishReplace(bytes.into()))
    }

    pub fn publish_append(&self, bytes: impl Into<Bytes>) -> SyncResult<()> {
        self.intent(LocalIntent::PublishAppend(bytes.into()))
    }

    /// The node's store. The renderer polls this.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub async fn status(&self) -> NodeStatus {
        let mut status = self.status.read().await.clone();
        status.store_len = self.store.len();
        status.last_modified = self.store.last_modified();
        status.version = self.store.version();
        status.transfers_ok = self.counters.ok.load(Ordering::Relaxed);
        status.transfers_failed = self.counters.failed.load(Ordering::Relaxed);
        status
    }

    /// Cancels every listener and transfer, then stops the node task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl SessionSink for NodeHandle {
    fn on_control(&self, from: PeerRef, message: ControlMessage) {
        if let Err(e) = self.deliver(from, message) {
            debug!(error = %e, "Dropping control message for stopped node");
        }
    }

    fn on_session_event(&self, event: SessionEvent) {
        if let Err(e) = self.session_event(event) {
            debug!(error = %e, "Dropping session event for stopped node");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, RecordingControl, RecordingObserver};

    #[test]
    fn test_state_display() {
        assert_eq!(NodeState::AwaitingSession.to_string(), "awaiting_session");
        assert_eq!(NodeState::RoomOwner.to_string(), "room_owner");
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = test_config(Role::Client);
        config.session.room_name = String::new();
        let control = Arc::new(RecordingControl::default());
        assert!(NodeBuilder::new(config).start(control).is_err());
    }

    #[tokio::test]
    async fn test_status_reflects_store_and_shutdown() {
        let control = Arc::new(RecordingControl::default());
        let node = NodeBuilder::new(test_config(Role::Master)).start(control).unwrap();

        node.store().replace(vec![1u8, 2, 3]);
        let status = node.status().await;
        assert_eq!(status.role, Role::Master);
        assert_eq!(status.state, NodeState::AwaitingSession);
        assert_eq!(status.store_len, 3);
        assert_eq!(status.version, 1);
        assert!(status.running);

        node.shutdown();
        assert!(!node.is_running());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!node.status().await.running);
        assert!(matches!(node.push_mesh(), Err(SyncError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_unsupported_intent_is_ignored() {
        let control = Arc::new(RecordingControl::default());
        let observer = Arc::new(RecordingObserver::default());
        let node = NodeBuilder::new(test_config(Role::Client))
            .with_observer(observer.clone())
            .start(control.clone())
            .unwrap();

        node.publish_replace(vec![1u8]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(node.store().snapshot().is_none());
        assert!(control.sent().is_empty());
        node.shutdown();
    }
}
