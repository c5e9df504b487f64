//! ActionCable command frames.
//!
//! The channel identifier is a JSON string that itself contains JSON: the server keys
//! subscriptions by that exact string, so it is encoded once, then embedded as a string.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::error::Error;
use crate::types::ChannelDescriptor;

/// Action name the chat channel exposes for inbound client messages.
pub const RECEIVE_ACTION: &str = "receive";

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
    Message,
}

/// Client to server frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    pub command: CommandKind,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Command {
    pub fn subscribe(channel: &ChannelDescriptor) -> Result<Self> {
        Ok(Self {
            command: CommandKind::Subscribe,
            identifier: identifier(channel)?,
            data: None,
        })
    }

    #[must_use]
    pub fn unsubscribe(identifier: &str) -> Self {
        Self {
            command: CommandKind::Unsubscribe,
            identifier: identifier.to_owned(),
            data: None,
        }
    }

    /// Invokes `action` on the subscribed channel, the message's own fields forming the payload.
    pub fn perform(identifier: &str, action: &str, message: &Value) -> Result<Self> {
        let Value::Object(fields) = message else {
            return Err(Error::validation(
                "channel actions take a JSON object payload",
            ));
        };

        let mut data = fields.clone();
        data.insert("action".to_owned(), Value::String(action.to_owned()));

        Ok(Self {
            command: CommandKind::Message,
            identifier: identifier.to_owned(),
            data: Some(serde_json::to_string(&data)?),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `{"channel": <name>, ...params}` serialized to a string. A `channel` param overrides the
/// name but keeps the leading position.
pub fn identifier(channel: &ChannelDescriptor) -> Result<String> {
    let mut object = Map::with_capacity(channel.params.len() + 1);
    object.insert("channel".to_owned(), Value::String(channel.name.clone()));
    for (key, value) in &channel.params {
        object.insert(key.clone(), value.clone());
    }

    Ok(serde_json::to_string(&object)?)
}

/// Server to client frame. Control frames carry `type`; channel broadcasts carry
/// `identifier` and `message`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: Option<ControlKind>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reconnect: Option<bool>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Welcome,
    Ping,
    ConfirmSubscription,
    RejectSubscription,
    Disconnect,
    #[serde(other)]
    Unknown,
}
