//! # Session Layer Seam
//!
//! The room sync engine never implements membership or message delivery
//! itself. It talks to the host's session layer through two traits:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session Boundary                                 │
//! │                                                                         │
//! │   Node ──ControlPlane::send(Target, ControlMessage)──► session layer    │
//! │                                                                         │
//! │   session layer ──SessionSink::on_control(from, msg)──► Node            │
//! │   session layer ──SessionSink::on_session_event(ev)───► Node            │
//! │                                                                         │
//! │   Targets:  Peer(p) │ Master │ Others │ OthersExcept(p)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`LocalSession`] is an in-process broker implementing both sides, used by
//! the integration tests and the demo binary.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roommesh_core::PeerRef;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::ControlMessage;

// =============================================================================
// Addressing
// =============================================================================

/// Who a control message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One named participant.
    Peer(PeerRef),

    /// The room's master.
    Master,

    /// Everyone in the room except the sender.
    Others,

    /// Everyone except the sender and the given peer.
    OthersExcept(PeerRef),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Peer(peer) => write!(f, "{}", peer),
            Target::Master => write!(f, "master"),
            Target::Others => write!(f, "others"),
            Target::OthersExcept(peer) => write!(f, "others-except-{}", peer),
        }
    }
}

/// Membership callbacks from the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected to the session service; a join for `room` is in progress.
    JoinStarted { room: String },

    /// This node created the room and owns it.
    RoomCreated { self_peer: PeerRef },

    /// This node joined an existing room.
    Joined { self_peer: PeerRef, master: PeerRef },

    /// The session layer rejected the join or create.
    JoinFailed { reason: String },
}

// =============================================================================
// Traits
// =============================================================================

/// Outbound side of the session layer.
///
/// Fire-and-forget. Implementations must not block: the node calls this from
/// its dispatch task.
pub trait ControlPlane: Send + Sync {
    fn send(&self, target: Target, message: ControlMessage) -> SyncResult<()>;

    /// Drops the session connection. Called after a rejected join.
    fn disconnect(&self) {}
}

/// Inbound side of the session layer. Implemented by `NodeHandle`.
pub trait SessionSink: Send + Sync {
    fn on_control(&self, from: PeerRef, message: ControlMessage);

    fn on_session_event(&self, event: SessionEvent);
}

// =============================================================================
// In-Memory Broker
// =============================================================================

/// One routed message, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub from: PeerRef,
    pub to: PeerRef,
    pub message: ControlMessage,
}

#[derive(Default)]
struct Member {
    sink: Option<Arc<dyn SessionSink>>,
    room: Option<String>,
}

struct Room {
    master: PeerRef,
    members: BTreeSet<PeerRef>,
}

#[derive(Default)]
struct Broker {
    next_peer: u32,
    members: HashMap<PeerRef, Member>,
    rooms: HashMap<String, Room>,
    history: Vec<Delivered>,
}

impl Broker {
    fn room_of(&self, peer: PeerRef) -> SyncResult<&Room> {
        let name = self
            .members
            .get(&peer)
            .and_then(|m| m.room.as_ref())
            .ok_or(SyncError::NotInSession)?;
        self.rooms.get(name).ok_or(SyncError::NotInSession)
    }

    fn resolve(&self, from: PeerRef, target: Target) -> SyncResult<Vec<PeerRef>> {
        let room = self.room_of(from)?;
        let recipients = match target {
            Target::Peer(peer) => {
                if !room.members.contains(&peer) {
                    return Err(SyncError::UnknownPeer(peer));
                }
                vec![peer]
            }
            Target::Master => vec![room.master],
            Target::Others => room.members.iter().copied().filter(|p| *p != from).collect(),
            Target::OthersExcept(excluded) => room
                .members
                .iter()
                .copied()
                .filter(|p| *p != from && *p != excluded)
                .collect(),
        };
        Ok(recipients)
    }

    fn sink(&self, peer: PeerRef) -> Option<Arc<dyn SessionSink>> {
        self.members.get(&peer).and_then(|m| m.sink.clone())
    }
}

/// In-process session layer: rooms, membership, and ordered delivery.
///
/// Delivery calls the recipient's [`SessionSink`] outside the broker lock.
#[derive(Clone, Default)]
pub struct LocalSession {
    broker: Arc<Mutex<Broker>>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new participant and returns its endpoint.
    pub fn endpoint(&self) -> LocalEndpoint {
        let mut broker = self.lock();
        broker.next_peer += 1;
        let peer = PeerRef::new(broker.next_peer);
        broker.members.insert(peer, Member::default());
        LocalEndpoint {
            session: self.clone(),
            peer,
        }
    }

    /// Every message routed so far, in delivery order.
    pub fn delivered(&self) -> Vec<Delivered> {
        self.lock().history.clone()
    }

    /// Messages named `type_name` that were delivered to `to`.
    pub fn count_delivered(&self, to: PeerRef, type_name: &str) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|d| d.to == to && d.message.type_name() == type_name)
            .count()
    }

    /// Members of a room, if it exists.
    pub fn members(&self, room: &str) -> Option<Vec<PeerRef>> {
        self.lock()
            .rooms
            .get(room)
            .map(|r| r.members.iter().copied().collect())
    }

    fn notify(sink: Option<Arc<dyn SessionSink>>, event: SessionEvent) {
        match sink {
            Some(sink) => sink.on_session_event(event),
            None => warn!(?event, "Session event for a detached endpoint dropped"),
        }
    }
}

/// One participant's handle onto a [`LocalSession`].
#[derive(Clone)]
pub struct LocalEndpoint {
    session: LocalSession,
    peer: PeerRef,
}

impl LocalEndpoint {
    /// Session-assigned id of this participant.
    pub fn peer(&self) -> PeerRef {
        self.peer
    }

    /// Connects the inbound side. Messages sent before this are dropped.
    pub fn attach(&self, sink: Arc<dyn SessionSink>) {
        if let Some(member) = self.session.lock().members.get_mut(&self.peer) {
            member.sink = Some(sink);
        }
    }

    /// Creates `room` with this participant as master.
    ///
    /// The outcome arrives as a `RoomCreated` or `JoinFailed` event.
    pub fn create_room(&self, room: &str) {
        let (sink, event) = {
            let mut broker = self.session.lock();
            let sink = broker.sink(self.peer);
            if broker.rooms.contains_key(room) {
                let reason = format!("room '{}' already exists", room);
                (sink, SessionEvent::JoinFailed { reason })
            } else {
                let mut members = BTreeSet::new();
                members.insert(self.peer);
                broker.rooms.insert(
                    room.to_string(),
                    Room {
                        master: self.peer,
                        members,
                    },
                );
                if let Some(member) = broker.members.get_mut(&self.peer) {
                    member.room = Some(room.to_string());
                }
                info!(room = %room, master = %self.peer, "Room created");
                (sink, SessionEvent::RoomCreated { self_peer: self.peer })
            }
        };
        LocalSession::notify(sink, event);
    }

    /// Joins an existing `room`.
    ///
    /// The outcome arrives as a `Joined` or `JoinFailed` event.
    pub fn join(&self, room: &str) {
        let sink = self.session.lock().sink(self.peer);
        LocalSession::notify(
            sink,
            SessionEvent::JoinStarted {
                room: room.to_string(),
            },
        );

        let (sink, event) = {
            let mut broker = self.session.lock();
            let sink = broker.sink(self.peer);
            match broker.rooms.get_mut(room) {
                Some(existing) => {
                    existing.members.insert(self.peer);
                    let master = existing.master;
                    if let Some(member) = broker.members.get_mut(&self.peer) {
                        member.room = Some(room.to_string());
                    }
                    info!(room = %room, peer = %self.peer, "Peer joined room");
                    (
                        sink,
                        SessionEvent::Joined {
                            self_peer: self.peer,
                            master,
                        },
                    )
                }
                None => {
                    let reason = format!("room '{}' does not exist", room);
                    (sink, SessionEvent::JoinFailed { reason })
                }
            }
        };
        LocalSession::notify(sink, event);
    }

    /// Leaves the current room, if any.
    pub fn leave(&self) {
        let mut broker = self.session.lock();
        let room = broker
            .members
            .get_mut(&self.peer)
            .and_then(|m| m.room.take());
        if let Some(name) = room {
            if let Some(existing) = broker.rooms.get_mut(&name) {
                existing.members.remove(&self.peer);
                if existing.members.is_empty() || existing.master == self.peer {
                    broker.rooms.remove(&name);
                    debug!(room = %name, "Room closed");
                }
            }
        }
    }
}

impl ControlPlane for LocalEndpoint {
    fn send(&self, target: Target, message: ControlMessage) -> SyncResult<()> {
        // Carried as JSON, the way a networked session layer would.
        let message = ControlMessage::from_json(&message.to_json()?)?;

        let deliveries: Vec<(PeerRef, Option<Arc<dyn SessionSink>>)> = {
            let mut broker = self.session.lock();
            let recipients = broker.resolve(self.peer, target)?;
            for to in &recipients {
                broker.history.push(Delivered {
                    from: self.peer,
                    to: *to,
                    message: message.clone(),
                });
            }
            recipients.into_iter().map(|to| (to, broker.sink(to))).collect()
        };

        debug!(
            from = %self.peer,
            target = %target,
            message = message.type_name(),
            recipients = deliveries.len(),
            "Routing control message"
        );

        for (to, sink) in deliveries {
            match sink {
                Some(sink) => sink.on_control(self.peer, message.clone()),
                None => warn!(to = %to, "Recipient has no attached sink, message dropped"),
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.leave();
    }
}
