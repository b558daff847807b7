#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown user status: {0}")]
	UnknownStatus(i64),
}

/// Stable identity of a registered user (the authenticated principal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
	pub const fn new(id: i64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		s.parse::<i64>()
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected decimal user id, got {s:?}")))
	}
}

impl From<i64> for UserId {
	fn from(id: i64) -> Self {
		Self(id)
	}
}

/// Account status. Inactive accounts cannot log in or use authenticated routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum UserStatus {
	Inactive,
	#[default]
	Active,
}

impl UserStatus {
	pub const fn as_i64(self) -> i64 {
		match self {
			UserStatus::Inactive => 0,
			UserStatus::Active => 1,
		}
	}

	pub const fn is_active(self) -> bool {
		matches!(self, UserStatus::Active)
	}
}

impl From<UserStatus> for i64 {
	fn from(status: UserStatus) -> Self {
		status.as_i64()
	}
}

impl TryFrom<i64> for UserStatus {
	type Error = ParseIdError;

	fn try_from(v: i64) -> Result<Self, Self::Error> {
		match v {
			0 => Ok(UserStatus::Inactive),
			1 => Ok(UserStatus::Active),
			other => Err(ParseIdError::UnknownStatus(other)),
		}
	}
}

impl fmt::Display for UserStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			UserStatus::Inactive => f.write_str("inactive"),
			UserStatus::Active => f.write_str("active"),
		}
	}
}

/// A registered user as exposed by the API (no credentials).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub name: String,
	pub email: String,
	pub status: UserStatus,
	pub created_at: DateTime<Utc>,
}

/// A direct message accepted for persistence, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub sender_id: UserId,
	pub receiver_id: UserId,
	pub content: String,
}

/// A durably recorded direct message. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: i64,
	pub sender_id: UserId,
	pub receiver_id: UserId,
	pub content: String,
	pub created_at: DateTime<Utc>,
}

impl Message {
	/// Whether `user` is the sender or the receiver.
	pub fn involves(&self, user: UserId) -> bool {
		self.sender_id == user || self.receiver_id == user
	}

	/// Whether this message belongs to the conversation between `a` and `b`.
	pub fn is_between(&self, a: UserId, b: UserId) -> bool {
		(self.sender_id == a && self.receiver_id == b) || (self.sender_id == b && self.receiver_id == a)
	}
}

/// Convert stored unix milliseconds into a UTC timestamp.
pub fn datetime_from_unix_ms(ms: i64) -> DateTime<Utc> {
	DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_parse_and_display() {
		assert_eq!("42".parse::<UserId>().unwrap(), UserId::new(42));
		assert_eq!(" 7 ".parse::<UserId>().unwrap().get(), 7);
		assert_eq!(UserId::new(-3).to_string(), "-3");
	}

	#[test]
	fn rejects_bad_user_ids() {
		assert_eq!("".parse::<UserId>(), Err(ParseIdError::Empty));
		assert!("abc".parse::<UserId>().is_err());
		assert!("1.5".parse::<UserId>().is_err());
		assert!("99999999999999999999".parse::<UserId>().is_err());
	}

	#[test]
	fn user_status_serializes_as_integer() {
		assert_eq!(serde_json::to_string(&UserStatus::Active).unwrap(), "1");
		assert_eq!(serde_json::from_str::<UserStatus>("0").unwrap(), UserStatus::Inactive);
		assert!(serde_json::from_str::<UserStatus>("2").is_err());
	}

	#[test]
	fn message_participants() {
		let msg = Message {
			id: 1,
			sender_id: UserId::new(1),
			receiver_id: UserId::new(2),
			content: "hi".to_string(),
			created_at: datetime_from_unix_ms(0),
		};

		assert!(msg.involves(UserId::new(1)));
		assert!(msg.involves(UserId::new(2)));
		assert!(!msg.involves(UserId::new(3)));
		assert!(msg.is_between(UserId::new(2), UserId::new(1)));
		assert!(!msg.is_between(UserId::new(1), UserId::new(3)));
	}
}
