// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! Shared test utilities for roommesh-sync integration tests.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roommesh_sync::{
    Framing, LocalEndpoint, LocalSession, MemoryBundleSink, NodeBuilder, NodeEvent, NodeHandle,
    NodeObserver, Platform, Role, SyncConfig, MAX_PORT_OFFSET,
};

static NEXT_BASE: AtomicU16 = AtomicU16::new(0);

/// A base port whose six ports are currently free on loopback.
///
/// Every node in these tests runs on one host, so each gets its own base.
pub fn free_base_port() -> u16 {
    let start = 41000 + (std::process::id() % 200) as u16 * 60;
    let _ = NEXT_BASE.compare_exchange(0, start, Ordering::SeqCst, Ordering::SeqCst);
    loop {
        let base = NEXT_BASE.fetch_add(MAX_PORT_OFFSET + 1, Ordering::SeqCst);
        let free = (0..=MAX_PORT_OFFSET)
            .all(|offset| TcpListener::bind(("127.0.0.1", base + offset)).is_ok());
        if free {
            return base;
        }
    }
}

/// Create a temp bundle root, cleaning up any existing one.
pub fn temp_bundle_root(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("roommesh_test_{}_{}", name, uuid::Uuid::new_v4()));
    let _ = std::fs::remove_dir_all(&path);
    path
}

pub fn write_bundle(root: &PathBuf, platform: Platform, name: &str, bytes: &[u8]) {
    let dir = root.join(platform.bundle_dir());
    std::fs::create_dir_all(&dir).expect("create bundle dir");
    std::fs::write(dir.join(name), bytes).expect("write bundle");
}

/// Loopback config with a fresh base port.
pub fn test_config(name: &str, role: Role, platform: Platform) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.node.name = name.to_string();
    config.node.role = role;
    config.node.platform = platform;
    config.session.room_name = "lab".to_string();
    config.transfer.base_port = free_base_port();
    config.transfer.bind_addr = "127.0.0.1".to_string();
    config.transfer.advertise_host = Some("127.0.0.1".to_string());
    config.transfer.timeout_secs = 5;
    config
}

/// Keeps every event a node reports.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<NodeEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&NodeEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl NodeObserver for EventLog {
    fn on_event(&self, event: &NodeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// One running room participant.
pub struct Participant {
    pub endpoint: LocalEndpoint,
    pub node: NodeHandle,
    pub events: Arc<EventLog>,
    pub bundles: Arc<MemoryBundleSink>,
}

impl Participant {
    pub fn start(session: &LocalSession, config: SyncConfig) -> Self {
        let endpoint = session.endpoint();
        let events = Arc::new(EventLog::default());
        let bundles = Arc::new(MemoryBundleSink::new());
        let node = NodeBuilder::new(config)
            .with_observer(events.clone())
            .with_bundle_sink(bundles.clone())
            .start(Arc::new(endpoint.clone()))
            .expect("start node");
        endpoint.attach(Arc::new(node.clone()));
        Participant {
            endpoint,
            node,
            events,
            bundles,
        }
    }

    pub fn mesh(&self) -> Option<Vec<u8>> {
        self.node.store().snapshot().map(|s| s.bytes.to_vec())
    }
}

/// A room with one master and a set of clients.
pub struct TestRoom {
    pub session: LocalSession,
    pub master: Participant,
    pub clients: Vec<Participant>,
}

impl TestRoom {
    /// Starts a master, seeds its store, and creates the room.
    pub fn with_master(initial: Option<&[u8]>, bundle_root: Option<PathBuf>, framing: Framing) -> Self {
        let session = LocalSession::new();
        let mut config = test_config("master", Role::Master, Platform::Desktop);
        config.transfer.framing = framing;
        if let Some(root) = bundle_root {
            config.bundles.root_dir = root;
        }
        let master = Participant::start(&session, config);
        if let Some(bytes) = initial {
            master.node.store().replace(bytes.to_vec());
        }
        master.endpoint.create_room("lab");
        TestRoom {
            session,
            master,
            clients: Vec::new(),
        }
    }

    /// Starts a client and joins the room. Returns its index.
    pub fn join(&mut self, name: &str, platform: Platform, framing: Framing) -> usize {
        let mut config = test_config(name, Role::Client, platform);
        config.transfer.framing = framing;
        let client = Participant::start(&self.session, config);
        client.endpoint.join("lab");
        self.clients.push(client);
        self.clients.len() - 1
    }

    pub fn client(&self, index: usize) -> &Participant {
        &self.clients[index]
    }

    pub fn shutdown(&self) {
        self.master.node.shutdown();
        for client in &self.clients {
            client.node.shutdown();
        }
    }
}

/// Polls `condition` until it holds, panicking after ten seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Gives in-flight messages a chance to (not) arrive.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
