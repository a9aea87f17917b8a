//! Message types for the Relay protocol.
//!
//! On the wire a message is one flat JSON object whose `type` field selects
//! which of the other fields are meaningful. In memory it is a [`Message`]
//! enum, so every consumer has to handle each kind explicitly.

use serde::{Deserialize, Serialize};

/// Sender name used for server generated notices.
pub const SYSTEM_USERNAME: &str = "System";

/// Message type identifiers, as carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageType {
    /// Plain chat message. Encoded as an absent or empty `type`.
    Chat,
    /// Identity announcement from a client.
    UserInfo,
    /// Identity change from a client.
    UpdateInfo,
    /// Roster snapshot from the server.
    UserList,
}

impl MessageType {
    /// The wire tag for this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "",
            MessageType::UserInfo => "user_info",
            MessageType::UpdateInfo => "update_info",
            MessageType::UserList => "user_list",
        }
    }
}

impl From<MessageType> for String {
    fn from(mt: MessageType) -> String {
        mt.as_str().to_string()
    }
}

impl TryFrom<String> for MessageType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "" => Ok(MessageType::Chat),
            "user_info" => Ok(MessageType::UserInfo),
            "update_info" => Ok(MessageType::UpdateInfo),
            "user_list" => Ok(MessageType::UserList),
            other => Err(format!("unknown message type: {other:?}")),
        }
    }
}

/// Public information about a connected user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    /// Display name.
    #[serde(default)]
    pub username: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
}

impl UserInfo {
    /// Create a new user info record.
    #[must_use]
    pub fn new(username: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            description: description.into(),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub enum Message {
    /// Chat message, relayed to every peer unchanged.
    Chat {
        /// Sender name.
        username: String,
        /// Message body.
        text: String,
    },

    /// First identity announcement of a connection.
    UserInfo {
        /// Requested display name.
        username: String,
        /// Free-text description.
        description: String,
    },

    /// Identity change of a connection.
    UpdateInfo {
        /// New display name.
        username: String,
        /// New description.
        description: String,
    },

    /// Full roster of identified users.
    UserList {
        /// Every connection that has announced a non-empty name.
        users: Vec<UserInfo>,
    },
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Chat { .. } => MessageType::Chat,
            Message::UserInfo { .. } => MessageType::UserInfo,
            Message::UpdateInfo { .. } => MessageType::UpdateInfo,
            Message::UserList { .. } => MessageType::UserList,
        }
    }

    /// Create a chat message.
    #[must_use]
    pub fn chat(username: impl Into<String>, text: impl Into<String>) -> Self {
        Message::Chat {
            username: username.into(),
            text: text.into(),
        }
    }

    /// Create a chat message sent by the server itself.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Message::chat(SYSTEM_USERNAME, text)
    }

    /// Notice announcing that `name` joined.
    #[must_use]
    pub fn join_notice(name: &str) -> Self {
        Message::system(format!("{name} has joined the chat."))
    }

    /// Notice announcing that `name` left.
    #[must_use]
    pub fn leave_notice(name: &str) -> Self {
        Message::system(format!("{name} has left the chat."))
    }

    /// Create an identity announcement.
    #[must_use]
    pub fn user_info(username: impl Into<String>, description: impl Into<String>) -> Self {
        Message::UserInfo {
            username: username.into(),
            description: description.into(),
        }
    }

    /// Create an identity update.
    #[must_use]
    pub fn update_info(username: impl Into<String>, description: impl Into<String>) -> Self {
        Message::UpdateInfo {
            username: username.into(),
            description: description.into(),
        }
    }

    /// Create a roster snapshot.
    #[must_use]
    pub fn user_list(users: Vec<UserInfo>) -> Self {
        Message::UserList { users }
    }

    /// Whether this is a notice generated by the server.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Message::Chat { username, .. } if username == SYSTEM_USERNAME)
    }
}

/// Flat JSON shape of a message.
///
/// Every field is optional on input so that `null` and absent fields are both
/// accepted; `username` is always written on output.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<MessageType>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    users: Option<Vec<UserInfo>>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        let username = wire.username.unwrap_or_default();
        match wire.kind.unwrap_or(MessageType::Chat) {
            MessageType::Chat => Message::Chat {
                username,
                text: wire.text.unwrap_or_default(),
            },
            MessageType::UserInfo => Message::UserInfo {
                username,
                description: wire.description.unwrap_or_default(),
            },
            MessageType::UpdateInfo => Message::UpdateInfo {
                username,
                description: wire.description.unwrap_or_default(),
            },
            MessageType::UserList => Message::UserList {
                users: wire.users.unwrap_or_default(),
            },
        }
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        match message {
            Message::Chat { username, text } => WireMessage {
                kind: None,
                username: Some(username),
                text: non_empty(text),
                ..Default::default()
            },
            Message::UserInfo {
                username,
                description,
            } => WireMessage {
                kind: Some(MessageType::UserInfo),
                username: Some(username),
                description: non_empty(description),
                ..Default::default()
            },
            Message::UpdateInfo {
                username,
                description,
            } => WireMessage {
                kind: Some(MessageType::UpdateInfo),
                username: Some(username),
                description: non_empty(description),
                ..Default::default()
            },
            Message::UserList { users } => WireMessage {
                kind: Some(MessageType::UserList),
                username: Some(String::new()),
                users: Some(users),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type() {
        assert_eq!(Message::chat("a", "b").message_type(), MessageType::Chat);
        assert_eq!(
            Message::user_info("a", "b").message_type(),
            MessageType::UserInfo
        );
        assert_eq!(
            Message::user_list(vec![]).message_type(),
            MessageType::UserList
        );
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(
            MessageType::try_from(String::new()),
            Ok(MessageType::Chat)
        );
        assert_eq!(
            MessageType::try_from("update_info".to_string()),
            Ok(MessageType::UpdateInfo)
        );
        assert!(MessageType::try_from("subscribe".to_string()).is_err());
    }

    #[test]
    fn test_chat_without_type() {
        let msg: Message =
            serde_json::from_value(json!({"username": "bob", "text": "hi"})).unwrap();
        assert_eq!(msg, Message::chat("bob", "hi"));

        let msg: Message =
            serde_json::from_value(json!({"type": "", "username": "bob", "text": "hi"})).unwrap();
        assert_eq!(msg, Message::chat("bob", "hi"));

        let msg: Message =
            serde_json::from_value(json!({"type": null, "username": "bob", "text": "hi"}))
                .unwrap();
        assert_eq!(msg, Message::chat("bob", "hi"));
    }

    #[test]
    fn test_user_info_from_wire() {
        let msg: Message = serde_json::from_value(
            json!({"type": "user_info", "username": "alice", "description": "hi"}),
        )
        .unwrap();
        assert_eq!(msg, Message::user_info("alice", "hi"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Message, _> =
            serde_json::from_value(json!({"type": "presence", "username": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_system_notice_shape() {
        let value = serde_json::to_value(Message::join_notice("alice")).unwrap();
        assert_eq!(
            value,
            json!({"username": "System", "text": "alice has joined the chat."})
        );
        assert!(Message::leave_notice("alice").is_system());
        assert!(!Message::chat("alice", "System").is_system());
    }

    #[test]
    fn test_empty_user_list_keeps_users() {
        let value = serde_json::to_value(Message::user_list(vec![])).unwrap();
        assert_eq!(value, json!({"type": "user_list", "username": "", "users": []}));
    }

    #[test]
    fn test_user_list_ignores_text() {
        let msg: Message = serde_json::from_value(json!({
            "type": "user_list",
            "username": "ignored",
            "text": "ignored",
            "users": [{"username": "alice", "description": "hi"}]
        }))
        .unwrap();
        assert_eq!(msg, Message::user_list(vec![UserInfo::new("alice", "hi")]));
    }
}
