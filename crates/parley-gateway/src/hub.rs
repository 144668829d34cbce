use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::warn;
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// Outbound handle for one live connection. Envelopes are serialized once
/// per broadcast and pushed through this channel; the session's forward
/// task drains it into the websocket sink. A dropped receiver makes sends
/// fail, which is how dead connections announce themselves.
pub type OutboundTx = mpsc::UnboundedSender<String>;

/// What became of a connection on `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The connection was still registered and has been removed.
    Removed,
    /// A newer connection for the same (group, user) owns the slot;
    /// nothing was touched.
    Superseded,
    /// The connection had already been reaped by a failed send.
    AlreadyGone,
}

struct Connection {
    conn_id: Uuid,
    tx: OutboundTx,
}

#[derive(Default)]
struct RoomState {
    connections: HashMap<i64, Connection>,
    typing: HashSet<i64>,
}

#[derive(Default)]
struct Room {
    state: Mutex<RoomState>,
}

/// Sole owner of all live connections and typing sets, sharded per group:
/// the outer map lock is held only to reach a room, every mutation happens
/// under that room's own lock, and no lock is held across transport sends,
/// so unrelated groups never contend. Presence here is process-local and
/// ephemeral; the message store stays authoritative.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    rooms: RwLock<HashMap<i64, Arc<Room>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registers a connection and announces the arrival to everyone else
    /// in the group. An existing connection for the same (group, user) is
    /// replaced; the stale transport is not closed here, its own loop
    /// notices once its channel goes dead.
    pub async fn connect(&self, group_id: i64, user_id: i64, tx: OutboundTx) -> Uuid {
        let conn_id = Uuid::new_v4();
        {
            // Hold the map lock across the insert so a concurrent GC of the
            // same room cannot strand this connection in a removed entry.
            let mut rooms = self.inner.rooms.write().await;
            let room = rooms.entry(group_id).or_default().clone();
            let mut state = room.state.lock().await;
            state.connections.insert(user_id, Connection { conn_id, tx });
        }
        let joined = ServerEvent::UserJoined {
            user_id,
            timestamp: Utc::now(),
        };
        self.broadcast(group_id, &joined, Some(user_id)).await;
        conn_id
    }

    /// Deregisters a connection. Removal happens only while `conn_id`
    /// still owns the slot, so a stale loop tearing down after being
    /// replaced cannot evict its successor. Announcing `user_left` is the
    /// caller's job once it knows the closing context.
    pub async fn disconnect(&self, group_id: i64, user_id: i64, conn_id: Uuid) -> Departure {
        let mut rooms = self.inner.rooms.write().await;
        let Some(room) = rooms.get(&group_id).cloned() else {
            return Departure::AlreadyGone;
        };
        let mut state = room.state.lock().await;
        let departure = match state.connections.get(&user_id) {
            Some(conn) if conn.conn_id == conn_id => {
                state.connections.remove(&user_id);
                state.typing.remove(&user_id);
                Departure::Removed
            }
            Some(_) => Departure::Superseded,
            None => Departure::AlreadyGone,
        };
        // Idle rooms are garbage-collected together with their typing set.
        if state.connections.is_empty() {
            drop(state);
            rooms.remove(&group_id);
        }
        departure
    }

    /// Fans an envelope out to every connection in the group, serializing
    /// it once. The recipient list is snapshotted under the room lock and
    /// sends happen outside it. Failures are isolated per recipient: a
    /// dead connection is reaped here and never blocks delivery to the
    /// rest. This is the only place dead connections are detected.
    pub async fn broadcast(&self, group_id: i64, event: &ServerEvent, exclude_user_id: Option<i64>) {
        let recipients = {
            let Some(room) = self.room(group_id).await else {
                return;
            };
            let state = room.state.lock().await;
            state
                .connections
                .iter()
                .filter(|(user_id, _)| Some(**user_id) != exclude_user_id)
                .map(|(user_id, conn)| (*user_id, conn.conn_id, conn.tx.clone()))
                .collect::<Vec<_>>()
        };
        if recipients.is_empty() {
            return;
        }

        let text = serde_json::to_string(event).expect("server envelopes always serialize");
        let mut dead = Vec::new();
        for (user_id, conn_id, tx) in recipients {
            if tx.send(text.clone()).is_err() {
                dead.push((user_id, conn_id));
            }
        }
        for (user_id, conn_id) in dead {
            warn!("dropping dead connection for user {} in group {}", user_id, group_id);
            self.disconnect(group_id, user_id, conn_id).await;
        }
    }

    /// Updates the typing set and broadcasts a full snapshot to the entire
    /// group, sender included.
    pub async fn set_typing(&self, group_id: i64, user_id: i64, is_typing: bool) {
        let typing_users = {
            let Some(room) = self.room(group_id).await else {
                return;
            };
            let mut state = room.state.lock().await;
            if is_typing {
                state.typing.insert(user_id);
            } else {
                state.typing.remove(&user_id);
            }
            let mut users: Vec<i64> = state.typing.iter().copied().collect();
            users.sort_unstable();
            users
        };
        let update = ServerEvent::TypingUpdate {
            typing_users,
            timestamp: Utc::now(),
        };
        self.broadcast(group_id, &update, None).await;
    }

    pub async fn online_users(&self, group_id: i64) -> Vec<i64> {
        match self.room(group_id).await {
            Some(room) => {
                let state = room.state.lock().await;
                let mut users: Vec<i64> = state.connections.keys().copied().collect();
                users.sort_unstable();
                users
            }
            None => Vec::new(),
        }
    }

    pub async fn is_online(&self, group_id: i64, user_id: i64) -> bool {
        match self.room(group_id).await {
            Some(room) => room.state.lock().await.connections.contains_key(&user_id),
            None => false,
        }
    }

    pub async fn typing_users(&self, group_id: i64) -> Vec<i64> {
        match self.room(group_id).await {
            Some(room) => {
                let state = room.state.lock().await;
                let mut users: Vec<i64> = state.typing.iter().copied().collect();
                users.sort_unstable();
                users
            }
            None => Vec::new(),
        }
    }

    async fn room(&self, group_id: i64) -> Option<Arc<Room>> {
        self.inner.rooms.read().await.get(&group_id).cloned()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
