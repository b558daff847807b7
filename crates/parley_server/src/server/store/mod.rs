#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{Message, NewMessage, User, UserId, UserStatus};
use thiserror::Error;

mod memory;
mod sql;

pub use memory::InMemoryStore;
pub use sql::SqlStore;

/// Largest page `list_messages` will return.
pub const MAX_HISTORY_LIMIT: u32 = 500;
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("email already registered")]
	DuplicateEmail,
	#[error("unknown user {0}")]
	UnknownUser(UserId),
	#[error("stored row is invalid: {0}")]
	Corrupt(String),
	#[error("store unavailable: {0}")]
	Unavailable(String),
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// History query: messages where `participant` is sender or receiver,
/// optionally narrowed to the conversation with `peer`, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
	pub participant: UserId,
	pub peer: Option<UserId>,
	pub limit: u32,
}

impl MessageQuery {
	pub fn new(participant: UserId) -> Self {
		Self {
			participant,
			peer: None,
			limit: DEFAULT_HISTORY_LIMIT,
		}
	}

	pub fn with_peer(mut self, peer: Option<UserId>) -> Self {
		self.peer = peer;
		self
	}

	pub fn with_limit(mut self, limit: u32) -> Self {
		self.limit = limit.clamp(1, MAX_HISTORY_LIMIT);
		self
	}
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Durably record one message and return it with its assigned id.
	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError>;

	async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
	pub name: String,
	pub email: String,
	pub password_hash: String,
	pub status: UserStatus,
}

/// A user together with its stored credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub user: User,
	pub password_hash: String,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChanges {
	pub name: Option<String>,
	pub email: Option<String>,
	pub status: Option<UserStatus>,
	pub password_hash: Option<String>,
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
	async fn create_user(&self, new: NewUser) -> Result<User, StoreError>;

	async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

	async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

	async fn list_users(&self, status: Option<UserStatus>) -> Result<Vec<User>, StoreError>;

	/// Returns `Ok(None)` when the user does not exist.
	async fn update_user(&self, id: UserId, changes: UserChanges) -> Result<Option<User>, StoreError>;

	/// Returns whether a user was deleted. Their messages go with them.
	async fn delete_user(&self, id: UserId) -> Result<bool, StoreError>;
}

/// Both store roles, usually backed by one object.
#[derive(Clone)]
pub struct Stores {
	pub messages: Arc<dyn MessageStore>,
	pub users: Arc<dyn UserStore>,
}

impl Stores {
	pub fn from_backend<B>(backend: Arc<B>) -> Self
	where
		B: MessageStore + UserStore + 'static,
	{
		Self {
			messages: backend.clone(),
			users: backend,
		}
	}

	pub fn in_memory() -> Self {
		Self::from_backend(Arc::new(InMemoryStore::new()))
	}

	/// Connect to `database_url` when given, else fall back to memory.
	pub async fn open(database_url: Option<&str>, max_connections: u32) -> anyhow::Result<Self> {
		match database_url {
			Some(url) => Ok(Self::from_backend(Arc::new(SqlStore::connect(url, max_connections).await?))),
			None => Ok(Self::in_memory()),
		}
	}
}
