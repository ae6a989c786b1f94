//! Room-based fan-out of pipeline events to live connections.
//!
//! The hub is constructed once at process start, shared through
//! [`AppState`](crate::services::AppState) and the worker handlers, and torn
//! down with [`NotificationHub::shutdown`]. Delivery is best-effort: a full or
//! closed connection buffer drops the event for that connection only.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::config::HubSettings;
use crate::metrics::{HUB_CONNECTIONS_ACTIVE, HUB_EVENTS_PUBLISHED_TOTAL};
use crate::models::events::HubEvent;
use crate::models::user::{Identity, UserRole};

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Student(String),
    Teachers,
    Admins,
}

impl Room {
    pub fn name(&self) -> String {
        match self {
            Room::Student(user_id) => format!("student:{user_id}"),
            Room::Teachers => "teachers".to_string(),
            Room::Admins => "admins".to_string(),
        }
    }

    /// Whether `identity` may subscribe to this room.
    pub fn admits(&self, identity: &Identity) -> bool {
        match self {
            Room::Student(user_id) => {
                identity.role == UserRole::Student && identity.user_id == *user_id
            }
            Room::Teachers => identity.role.is_staff(),
            Room::Admins => identity.role == UserRole::Admin,
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Room {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "teachers" => Ok(Room::Teachers),
            "admins" => Ok(Room::Admins),
            other => match other.strip_prefix("student:") {
                Some(user_id) if !user_id.is_empty() => Ok(Room::Student(user_id.to_string())),
                _ => Err(HubError::UnknownRoom(s.to_string())),
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("not allowed to join {0}")]
    Forbidden(String),
    #[error("unknown room {0}")]
    UnknownRoom(String),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

struct Connection {
    identity: Identity,
    sender: mpsc::Sender<HubEvent>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

impl Registry {
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(&id) else {
            return false;
        };
        for room in connection.rooms {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(&room);
                }
            }
        }
        HUB_CONNECTIONS_ACTIVE.dec();
        true
    }
}

pub struct NotificationHub {
    registry: RwLock<Registry>,
    buffer: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl NotificationHub {
    pub fn new(settings: &HubSettings) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            buffer: settings.connection_buffer.max(1),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a connection. Returns `None` once the hub is shut down.
    pub async fn connect(
        &self,
        identity: Identity,
    ) -> Option<(ConnectionId, mpsc::Receiver<HubEvent>)> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry.write().await;
        // Re-check under the lock so shutdown cannot miss this connection.
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        tracing::debug!(connection = id, user_id = %identity.user_id, "Hub connection opened");
        registry.connections.insert(
            id,
            Connection {
                identity,
                sender,
                rooms: HashSet::new(),
            },
        );
        HUB_CONNECTIONS_ACTIVE.inc();
        Some((id, receiver))
    }

    pub async fn join(&self, id: ConnectionId, room: Room) -> Result<(), HubError> {
        let mut registry = self.registry.write().await;
        let connection = registry
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;

        if !room.admits(&connection.identity) {
            tracing::warn!(
                connection = id,
                user_id = %connection.identity.user_id,
                room = %room,
                "Hub join rejected"
            );
            return Err(HubError::Forbidden(room.name()));
        }

        connection.rooms.insert(room.clone());
        tracing::debug!(connection = id, room = %room, "Joined room");
        registry.rooms.entry(room).or_default().insert(id);
        Ok(())
    }

    /// Returns whether the connection was a member.
    pub async fn leave(&self, id: ConnectionId, room: &Room) -> bool {
        let mut registry = self.registry.write().await;
        let was_member = registry
            .connections
            .get_mut(&id)
            .map(|c| c.rooms.remove(room))
            .unwrap_or(false);
        if let Some(members) = registry.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                registry.rooms.remove(room);
            }
        }
        was_member
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        if self.registry.write().await.remove(id) {
            tracing::debug!(connection = id, "Hub connection closed");
        }
    }

    /// Sends `event` to every member of `rooms`, each connection at most once.
    /// Returns the number of connections the event was queued for.
    pub async fn publish_to(&self, rooms: &[Room], event: HubEvent) -> usize {
        let event_name = event.event_name();
        let mut dead = Vec::new();
        let mut delivered = 0;

        {
            let registry = self.registry.read().await;
            let mut targets: HashSet<ConnectionId> = HashSet::new();
            for room in rooms {
                if let Some(members) = registry.rooms.get(room) {
                    targets.extend(members.iter().copied());
                }
            }

            for id in targets {
                let Some(connection) = registry.connections.get(&id) else {
                    continue;
                };
                match connection.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(connection = id, event = event_name, "Hub buffer full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.write().await;
            for id in dead {
                registry.remove(id);
            }
        }

        if delivered > 0 {
            HUB_EVENTS_PUBLISHED_TOTAL
                .with_label_values(&[event_name])
                .inc_by(delivered as u64);
        }
        tracing::debug!(event = event_name, delivered, "Hub event published");
        delivered
    }

    pub async fn publish(&self, room: Room, event: HubEvent) -> usize {
        self.publish_to(std::slice::from_ref(&room), event).await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn rooms_of(&self, id: ConnectionId) -> Vec<Room> {
        self.registry
            .read()
            .await
            .connections
            .get(&id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuses new connections and drops every existing one; their receivers
    /// observe a closed channel.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut registry = self.registry.write().await;
        let ids: Vec<ConnectionId> = registry.connections.keys().copied().collect();
        for id in &ids {
            registry.remove(*id);
        }
        tracing::info!(closed = ids.len(), "Notification hub shut down");
    }
}
