//! Who is currently drawing.
//!
//! Each writer announces itself under `users/<id>`; the relay server folds
//! those records into one list on the bare `users` path.

use crate::protocol::USERS_PATH;
use crate::store::KeyValueStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Id used when a name normalizes to nothing.
pub const ANONYMOUS_ID: &str = "anonymous";

/// One user's presence entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub name: String,
    /// ISO-8601 time of the last update.
    pub last_seen: String,
    pub active: bool,
}

impl PresenceRecord {
    pub fn new(name: &str, active: bool, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            last_seen: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            active,
        }
    }
}

/// Key-safe id for a display name: non-word characters become `_`, then lower-cased.
pub fn user_id(name: &str) -> String {
    if name.is_empty() {
        return ANONYMOUS_ID.to_string();
    }
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Store key of a user's presence record.
pub fn presence_key(name: &str) -> String {
    format!("{}/{}", USERS_PATH, user_id(name))
}

/// Write the presence record for `name`. Returns whether the store accepted it.
pub async fn update_presence<S: KeyValueStore + ?Sized>(store: &S, name: &str, active: bool) -> bool {
    let record = PresenceRecord::new(name, active, Utc::now());
    let json = match serde_json::to_string(&record) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to serialize presence: {}", e);
            return false;
        }
    };
    match store.set(&presence_key(name), &json).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Failed to update presence for {}: {}", name, e);
            false
        }
    }
}

/// Parse the user list published on the `users` path.
pub fn parse_user_list(json: &str) -> Result<Vec<PresenceRecord>, serde_json::Error> {
    serde_json::from_str(json)
}
