//! Shared relay state: path values, presence table and the change feed.

use dashmap::DashMap;
use inkshare_core::presence::PresenceRecord;
use inkshare_core::protocol::{ServerMessage, USERS_PATH, is_presence_path};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

/// A change to deliver to subscribers of its path.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Connection that must not receive it, if any.
    pub skip: Option<String>,
    pub message: ServerMessage,
}

impl Broadcast {
    /// Path the message concerns, when it is a change.
    pub fn path(&self) -> Option<&str> {
        match &self.message {
            ServerMessage::Changed { path, .. } => Some(path),
            _ => None,
        }
    }
}

struct PresenceEntry {
    record: PresenceRecord,
    /// Connection that last wrote the record.
    peer: String,
}

/// Shared application state
pub struct AppState {
    values: DashMap<String, String>,
    users: DashMap<String, PresenceEntry>,
    tx: broadcast::Sender<Broadcast>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            values: DashMap::new(),
            users: DashMap::new(),
            tx,
        }
    }

    /// Receive every change made from now on.
    pub fn changes(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    /// Current value at `path`. The bare users path yields the active user list.
    pub fn get(&self, path: &str) -> Option<String> {
        if path == USERS_PATH {
            return Some(self.user_list_json());
        }
        self.values.get(path).map(|v| v.value().clone())
    }

    /// Store `value` at `path` and notify every other subscriber.
    pub fn set(&self, path: &str, value: String, peer: &str) {
        self.values.insert(path.to_string(), value.clone());
        self.publish(
            Some(peer),
            ServerMessage::Changed {
                path: path.to_string(),
                value: Some(value.clone()),
                from: peer.to_string(),
            },
        );

        if is_presence_path(path) {
            self.update_presence(path, &value, peer);
        }
    }

    /// Mark every user announced by `peer` inactive.
    pub fn disconnect(&self, peer: &str) {
        let mut changed = false;
        for mut entry in self.users.iter_mut() {
            if entry.peer == peer && entry.record.active {
                entry.record.active = false;
                changed = true;
            }
        }
        if changed {
            debug!("Presence of {} cleared", peer);
            self.publish_users(peer);
        }
    }

    /// Active users, sorted by name.
    pub fn active_users(&self) -> Vec<PresenceRecord> {
        let mut users: Vec<PresenceRecord> = self
            .users
            .iter()
            .filter(|entry| entry.record.active)
            .map(|entry| entry.record.clone())
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    fn update_presence(&self, path: &str, value: &str, peer: &str) {
        let record: PresenceRecord = match serde_json::from_str(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring malformed presence at {}: {}", path, e);
                return;
            }
        };
        self.users.insert(
            path.to_string(),
            PresenceEntry {
                record,
                peer: peer.to_string(),
            },
        );
        self.publish_users(peer);
    }

    /// The writer is included: it sees the list change like everyone else.
    fn publish_users(&self, peer: &str) {
        self.publish(
            None,
            ServerMessage::Changed {
                path: USERS_PATH.to_string(),
                value: Some(self.user_list_json()),
                from: peer.to_string(),
            },
        );
    }

    fn user_list_json(&self) -> String {
        serde_json::to_string(&self.active_users()).unwrap_or_else(|_| "[]".to_string())
    }

    fn publish(&self, skip: Option<&str>, message: ServerMessage) {
        // No receivers is fine.
        let _ = self.tx.send(Broadcast {
            skip: skip.map(str::to_string),
            message,
        });
    }
}
