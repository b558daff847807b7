#![forbid(unsafe_code)]

use parley_domain::{Message, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default maximum size of one inbound WebSocket message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("invalid json: {0}")]
	Json(#[from] serde_json::Error),

	#[error("frame is not a json object")]
	NotAnObject,

	#[error("missing field: {0}")]
	MissingField(&'static str),

	#[error("invalid receiver_id: {0}")]
	InvalidReceiverId(String),

	#[error("invalid message: expected string, number or bool, got {0}")]
	InvalidMessage(&'static str),
}

/// Client -> server chat frame: `{"receiver_id": <int>, "message": <string>}`.
///
/// Decoding is lenient: `receiver_id` may also be a string holding a decimal
/// integer, and a numeric or boolean `message` is stringified. Unknown fields
/// are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChatFrame {
	pub receiver_id: UserId,
	pub message: String,
}

impl InboundChatFrame {
	/// Decode a frame from the text payload of a WebSocket message.
	pub fn parse(text: &str) -> Result<Self, FrameError> {
		let value: Value = serde_json::from_str(text)?;
		Self::from_value(value)
	}

	/// Decode a frame from an already-parsed JSON value.
	pub fn from_value(value: Value) -> Result<Self, FrameError> {
		let Value::Object(mut obj) = value else {
			return Err(FrameError::NotAnObject);
		};

		let receiver_id = match obj.remove("receiver_id") {
			None | Some(Value::Null) => return Err(FrameError::MissingField("receiver_id")),
			Some(Value::Number(n)) => n
				.as_i64()
				.map(UserId::new)
				.ok_or_else(|| FrameError::InvalidReceiverId(n.to_string()))?,
			Some(Value::String(s)) => s
				.parse::<UserId>()
				.map_err(|e| FrameError::InvalidReceiverId(e.to_string()))?,
			Some(other) => return Err(FrameError::InvalidReceiverId(json_kind(&other).to_string())),
		};

		let message = match obj.remove("message") {
			None | Some(Value::Null) => return Err(FrameError::MissingField("message")),
			Some(Value::String(s)) => s,
			Some(Value::Number(n)) => n.to_string(),
			Some(Value::Bool(b)) => b.to_string(),
			Some(other) => return Err(FrameError::InvalidMessage(json_kind(&other))),
		};

		Ok(Self { receiver_id, message })
	}

	/// Message content with surrounding whitespace removed, or `None` if nothing is left.
	pub fn trimmed_content(&self) -> Option<&str> {
		let content = self.message.trim();
		if content.is_empty() { None } else { Some(content) }
	}
}

/// Server -> client delivery frame: `{"sender_id": <int>, "content": <string>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFrame {
	pub sender_id: UserId,
	pub content: String,
}

impl DeliveryFrame {
	pub fn new(sender_id: UserId, content: impl Into<String>) -> Self {
		Self {
			sender_id,
			content: content.into(),
		}
	}

	/// Encode as the JSON text sent over the wire.
	pub fn to_json(&self) -> Result<String, FrameError> {
		Ok(serde_json::to_string(self)?)
	}
}

impl From<&Message> for DeliveryFrame {
	fn from(msg: &Message) -> Self {
		Self::new(msg.sender_id, msg.content.clone())
	}
}

fn json_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
