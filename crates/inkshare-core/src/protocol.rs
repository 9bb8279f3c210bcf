//! Wire protocol between relay store clients and the realtime relay server.
//!
//! Messages are JSON with a `type` tag:
//! ```json
//! { "type": "subscribe", "path": "canvas" }
//! { "type": "set", "path": "canvas", "value": "<snapshot json>" }
//! { "type": "changed", "path": "canvas", "value": "<snapshot json>", "from": "<peer>" }
//! ```

use serde::{Deserialize, Serialize};

/// Path under which the realtime backend keeps the live canvas snapshot.
pub const CANVAS_PATH: &str = "canvas";

/// Path prefix for presence records; the bare path carries the full user list.
pub const USERS_PATH: &str = "users";

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Receive `changed` for a path, starting with its current value.
    Subscribe { path: String },
    /// Overwrite the value at a path.
    Set { path: String, value: String },
    /// Request the current value at a path.
    Get { path: String },
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current value at a path (reply to `get` and `subscribe`).
    Value { path: String, value: Option<String> },
    /// Another peer changed a subscribed path.
    Changed {
        path: String,
        value: Option<String>,
        from: String,
    },
    /// Error message
    Error { message: String },
}

/// Whether `path` addresses a single presence record (`users/<id>`).
pub fn is_presence_path(path: &str) -> bool {
    path.strip_prefix(USERS_PATH)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialize() {
        let msg = ClientMessage::Subscribe { path: "canvas".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","path":"canvas"}"#);
    }

    #[test]
    fn test_server_message_deserialize() {
        let json = r#"{"type":"changed","path":"canvas","value":"{}","from":"peer-1"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Changed {
                path: "canvas".to_string(),
                value: Some("{}".to_string()),
                from: "peer-1".to_string(),
            }
        );

        let absent: ServerMessage =
            serde_json::from_str(r#"{"type":"value","path":"canvas","value":null}"#).unwrap();
        assert_eq!(
            absent,
            ServerMessage::Value { path: "canvas".to_string(), value: None }
        );
    }

    #[test]
    fn test_presence_path() {
        assert!(is_presence_path("users/ada"));
        assert!(!is_presence_path("users"));
        assert!(!is_presence_path("users/"));
        assert!(!is_presence_path("usersx/ada"));
        assert!(!is_presence_path("canvas"));
    }
}
