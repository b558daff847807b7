#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parley_domain::{Message, NewMessage, User, UserId, UserStatus, datetime_from_unix_ms};
use tokio::sync::Mutex;

use super::{MessageQuery, MessageStore, NewUser, StoreError, UserChanges, UserRecord, UserStore};
use crate::util::time::unix_ms_now;

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
	users: BTreeMap<UserId, UserRecord>,
	messages: Vec<Message>,
	next_user_id: i64,
	next_message_id: i64,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl MemoryState {
	fn email_taken(&self, email: &str, except: Option<UserId>) -> bool {
		self.users
			.values()
			.any(|r| r.user.email == email && Some(r.user.id) != except)
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
		let mut state = self.inner.lock().await;

		for id in [msg.sender_id, msg.receiver_id] {
			if !state.users.contains_key(&id) {
				return Err(StoreError::UnknownUser(id));
			}
		}

		state.next_message_id += 1;
		let stored = Message {
			id: state.next_message_id,
			sender_id: msg.sender_id,
			receiver_id: msg.receiver_id,
			content: msg.content,
			created_at: datetime_from_unix_ms(unix_ms_now()),
		};
		state.messages.push(stored.clone());
		Ok(stored)
	}

	async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
		let state = self.inner.lock().await;
		let mut items: Vec<Message> = state
			.messages
			.iter()
			.filter(|m| match query.peer {
				Some(peer) => m.is_between(query.participant, peer),
				None => m.involves(query.participant),
			})
			.cloned()
			.collect();

		items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
		items.truncate(query.limit as usize);
		Ok(items)
	}
}

#[async_trait::async_trait]
impl UserStore for InMemoryStore {
	async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
		let mut state = self.inner.lock().await;
		if state.email_taken(&new.email, None) {
			return Err(StoreError::DuplicateEmail);
		}

		state.next_user_id += 1;
		let user = User {
			id: UserId::new(state.next_user_id),
			name: new.name,
			email: new.email,
			status: new.status,
			created_at: datetime_from_unix_ms(unix_ms_now()),
		};
		state.users.insert(
			user.id,
			UserRecord {
				user: user.clone(),
				password_hash: new.password_hash,
			},
		);
		Ok(user)
	}

	async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
		Ok(self.inner.lock().await.users.get(&id).cloned())
	}

	async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
		let state = self.inner.lock().await;
		Ok(state.users.values().find(|r| r.user.email == email).cloned())
	}

	async fn list_users(&self, status: Option<UserStatus>) -> Result<Vec<User>, StoreError> {
		let state = self.inner.lock().await;
		Ok(state
			.users
			.values()
			.filter(|r| status.is_none_or(|s| r.user.status == s))
			.map(|r| r.user.clone())
			.collect())
	}

	async fn update_user(&self, id: UserId, changes: UserChanges) -> Result<Option<User>, StoreError> {
		let mut state = self.inner.lock().await;
		if !state.users.contains_key(&id) {
			return Ok(None);
		}
		if changes
			.email
			.as_deref()
			.is_some_and(|email| state.email_taken(email, Some(id)))
		{
			return Err(StoreError::DuplicateEmail);
		}

		let Some(record) = state.users.get_mut(&id) else {
			return Ok(None);
		};
		if let Some(name) = changes.name {
			record.user.name = name;
		}
		if let Some(email) = changes.email {
			record.user.email = email;
		}
		if let Some(status) = changes.status {
			record.user.status = status;
		}
		if let Some(hash) = changes.password_hash {
			record.password_hash = hash;
		}
		Ok(Some(record.user.clone()))
	}

	async fn delete_user(&self, id: UserId) -> Result<bool, StoreError> {
		let mut state = self.inner.lock().await;
		if state.users.remove(&id).is_none() {
			return Ok(false);
		}
		state.messages.retain(|m| !m.involves(id));
		Ok(true)
	}
}
