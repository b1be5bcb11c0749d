//! # Transfer Service
//!
//! Opens bulk channels on the fixed port layout and runs the master's
//! permanent snapshot server.
//!
//! ## Port Leases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Port Leases                                    │
//! │                                                                         │
//! │   open(kind) ──► lease[kind].lock() ──► bind(base + offset(kind))       │
//! │                                                                         │
//! │   Two requests for the same kind queue on the lease instead of          │
//! │   colliding at bind time. Different kinds never wait on each other.     │
//! │   The lease is released when the PendingTransfer finishes or drops.    │
//! │                                                                         │
//! │   MeshPull is leased for the life of the node by serve_snapshots.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use roommesh_core::{PortAllocator, SharedStore, TransferKind};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{dial, BulkListener, ChannelOptions};
use crate::config::TransferSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::TransferDescriptor;

struct Inner {
    ports: PortAllocator,
    settings: TransferSettings,
    host: String,
    options: ChannelOptions,
    leases: HashMap<TransferKind, Arc<Mutex<()>>>,
    cancel: CancellationToken,
}

/// Opens, dials and serves bulk channels for one node.
///
/// Cheap to clone; clones share leases and the cancellation token.
#[derive(Clone)]
pub struct TransferService {
    inner: Arc<Inner>,
}

impl TransferService {
    /// Creates the service. The advertised host is resolved once here.
    pub fn new(ports: PortAllocator, settings: &TransferSettings, cancel: CancellationToken) -> Self {
        let leases = TransferKind::all()
            .into_iter()
            .map(|kind| (kind, Arc::new(Mutex::new(()))))
            .collect();

        TransferService {
            inner: Arc::new(Inner {
                ports,
                settings: settings.clone(),
                host: settings.advertise_host(),
                options: ChannelOptions::from(settings),
                leases,
                cancel,
            }),
        }
    }

    pub fn ports(&self) -> PortAllocator {
        self.inner.ports
    }

    /// Host written into descriptors.
    pub fn advertise_host(&self) -> &str {
        &self.inner.host
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Descriptor pointing at this node's port for `kind`.
    pub fn descriptor_for(&self, kind: TransferKind) -> TransferDescriptor {
        TransferDescriptor::new(kind, self.inner.host.clone(), self.inner.ports.port_for(kind))
    }

    async fn lease(&self, kind: TransferKind) -> SyncResult<OwnedMutexGuard<()>> {
        let lease = self
            .inner
            .leases
            .get(&kind)
            .cloned()
            .ok_or_else(|| SyncError::Internal(format!("no lease for {}", kind)))?;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(SyncError::Cancelled),
            guard = lease.lock_owned() => Ok(guard),
        }
    }

    /// Leases and binds the port for `kind`.
    ///
    /// The listener is live when this returns, so the descriptor can be
    /// announced right away.
    pub async fn open(&self, kind: TransferKind) -> SyncResult<PendingTransfer> {
        let lease = self.lease(kind).await?;
        let addr = self.inner.settings.bind_address(self.inner.ports.port_for(kind))?;
        let listener = BulkListener::bind(kind, addr, self.inner.options).await?;

        let id = Uuid::new_v4();
        debug!(transfer_id = %id, kind = %kind, addr = %addr, "Transfer opened");

        Ok(PendingTransfer {
            id,
            descriptor: self.descriptor_for(kind),
            listener,
            cancel: self.inner.cancel.clone(),
            _lease: lease,
        })
    }

    /// Dials `td` and reads one payload.
    pub async fn fetch(&self, td: &TransferDescriptor) -> SyncResult<Bytes> {
        let cancel = &self.inner.cancel;
        let stream = dial(&td.addr(), self.inner.options, cancel).await?;
        let payload = stream.read_payload(cancel).await?;
        debug!(descriptor = %td, bytes = payload.len(), "Fetched payload");
        Ok(payload)
    }

    /// Dials `td` and writes `payload`.
    pub async fn push(&self, td: &TransferDescriptor, payload: Bytes) -> SyncResult<usize> {
        let cancel = &self.inner.cancel;
        let stream = dial(&td.addr(), self.inner.options, cancel).await?;
        let written = stream.write_payload(payload, cancel).await?;
        debug!(descriptor = %td, bytes = written, "Pushed payload");
        Ok(written)
    }

    /// Binds the mesh-pull port and serves `store.snapshot()` to every dialer
    /// until the node shuts down.
    ///
    /// An absent store is served as a zero-length payload. Each connection is
    /// written from its own task so a slow reader never stalls the listener.
    pub async fn serve_snapshots(&self, store: SharedStore) -> SyncResult<()> {
        let kind = TransferKind::MeshPull;
        let _lease = self.lease(kind).await?;
        let addr = self.inner.settings.bind_address(self.inner.ports.port_for(kind))?;
        let listener = BulkListener::bind(kind, addr, self.inner.options).await?;
        info!(addr = %listener.local_addr(), "Snapshot server listening");

        let cancel = self.inner.cancel.clone();
        loop {
            let stream = match listener.accept_next(&cancel).await {
                Ok(stream) => stream,
                Err(SyncError::Cancelled) => break,
                Err(e) => {
                    warn!(error = %e, "Snapshot server accept failed");
                    continue;
                }
            };

            let peer = stream.peer_addr();
            let payload = store.snapshot().map(|s| s.bytes).unwrap_or_default();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match stream.write_payload(payload, &cancel).await {
                    Ok(bytes) => debug!(peer = %peer, bytes, "Served snapshot"),
                    Err(e) => warn!(peer = %peer, error = %e, "Snapshot transfer abandoned"),
                }
            });
        }

        info!("Snapshot server stopped");
        Ok(())
    }
}

/// A bound, announced-but-not-yet-accepted transfer.
///
/// Holds the per-kind lease until consumed or dropped.
pub struct PendingTransfer {
    id: Uuid,
    descriptor: TransferDescriptor,
    listener: BulkListener,
    cancel: CancellationToken,
    _lease: OwnedMutexGuard<()>,
}

impl PendingTransfer {
    /// Where the other side should dial.
    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    /// Log correlation id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Accepts one connection and writes `payload` to it.
    pub async fn serve(self, payload: Bytes) -> SyncResult<usize> {
        let stream = self.listener.accept_once(&self.cancel).await?;
        let written = stream.write_payload(payload, &self.cancel).await?;
        debug!(transfer_id = %self.id, kind = %self.descriptor.kind, bytes = written, "Transfer served");
        Ok(written)
    }

    /// Accepts one connection and reads a payload from it.
    pub async fn collect(self) -> SyncResult<Bytes> {
        let stream = self.listener.accept_once(&self.cancel).await?;
        let payload = stream.read_payload(&self.cancel).await?;
        debug!(transfer_id = %self.id, kind = %self.descriptor.kind, bytes = payload.len(), "Transfer collected");
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::free_base_port;

    fn service(base: u16) -> TransferService {
        let settings = TransferSettings {
            base_port: base,
            bind_addr: "127.0.0.1".into(),
            advertise_host: Some("127.0.0.1".into()),
            timeout_secs: 5,
            ..TransferSettings::default()
        };
        TransferService::new(
            PortAllocator::new(base).unwrap(),
            &settings,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_open_serve_fetch() {
        let base = free_base_port();
        let svc = service(base);
        let pending = svc.open(TransferKind::MeshReplace).await.unwrap();
        assert_eq!(pending.descriptor().port, base + 1);
        assert_eq!(pending.descriptor().host, "127.0.0.1");

        let td = pending.descriptor().clone();
        let server = tokio::spawn(pending.serve(Bytes::from_static(b"mesh-bytes")));
        let fetched = svc.fetch(&td).await.unwrap();
        assert_eq!(fetched.as_ref(), b"mesh-bytes");
        assert_eq!(server.await.unwrap().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_open_collect_push() {
        let svc = service(free_base_port());
        let pending = svc.open(TransferKind::IncrementalAdd).await.unwrap();
        let td = pending.descriptor().clone();
        let collector = tokio::spawn(pending.collect());
        svc.push(&td, Bytes::from_static(b"addition")).await.unwrap();
        assert_eq!(collector.await.unwrap().unwrap().as_ref(), b"addition");
    }

    #[tokio::test]
    async fn test_same_kind_queues_on_lease() {
        let svc = service(free_base_port());
        let first = svc.open(TransferKind::MeshReplace).await.unwrap();

        // Second open must wait until the first transfer is done.
        let svc2 = svc.clone();
        let second = tokio::spawn(async move { svc2.open(TransferKind::MeshReplace).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        // A different kind is independent.
        let other = svc.open(TransferKind::IncrementalAdd).await.unwrap();
        drop(other);

        drop(first);
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.descriptor().kind, TransferKind::MeshReplace);
    }

    #[tokio::test]
    async fn test_snapshot_server_serves_current_store() {
        let svc = service(free_base_port());
        let store = SharedStore::new();
        let server = tokio::spawn({
            let svc = svc.clone();
            let store = store.clone();
            async move { svc.serve_snapshots(store).await }
        });

        let td = svc.descriptor_for(TransferKind::MeshPull);

        // Absent store is served as an empty payload.
        let empty = fetch_with_retry(&svc, &td).await;
        assert!(empty.is_empty());

        // The server is re-armed and serves the latest content.
        store.replace(vec![1u8, 2, 3]);
        assert_eq!(fetch_with_retry(&svc, &td).await.as_ref(), &[1, 2, 3]);
        store.append(vec![4u8]);
        assert_eq!(fetch_with_retry(&svc, &td).await.as_ref(), &[1, 2, 3, 4]);

        svc.cancel_token().cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_service_refuses_new_transfers() {
        let svc = service(free_base_port());
        svc.cancel_token().cancel();
        assert!(matches!(
            svc.open(TransferKind::MeshReplace).await,
            Err(SyncError::Cancelled)
        ));
    }

    async fn fetch_with_retry(svc: &TransferService, td: &TransferDescriptor) -> Bytes {
        for _ in 0..50 {
            match svc.fetch(td).await {
                Ok(bytes) => return bytes,
                Err(SyncError::ConnectFailed { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                Err(e) => panic!("fetch failed: {e}"),
            }
        }
        panic!("snapshot server never came up");
    }
}
