//! Identifiers, channel descriptors, statuses and frames shared across the crate.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::Display;

/// Channel class used by the chat backend when no other descriptor is supplied.
pub const CHAT_CHANNEL: &str = "ChatChannel";

/// Identifier of a conversation (chat). At most one conversation holds a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for ConversationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Names the server-side channel to subscribe to, plus its parameters.
///
/// Parameters keep insertion order, so the identifier sent on the wire is stable.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub name: String,
    pub params: Map<String, Value>,
}

impl ChannelDescriptor {
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Adds (or replaces) a channel parameter.
    #[must_use]
    pub fn with_param<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// `{ channel: "ChatChannel", chat_id: <id> }`, the descriptor used for chat conversations.
    #[must_use]
    pub fn chat(id: ConversationId) -> Self {
        Self::new(CHAT_CHANNEL).with_param("chat_id", id.0)
    }
}

/// Lifecycle status of a conversation's connection, as exposed to UI code.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Change notification published whenever a conversation's status or retry count is written.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub id: ConversationId,
    pub status: ConnectionStatus,
    pub retry_count: u32,
}

/// Opaque inbound payload handed to message listeners.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(self.as_bytes())?)
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}
