#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use parley_domain::{Message, NewMessage, User, UserId, UserStatus, datetime_from_unix_ms};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use super::{MessageQuery, MessageStore, NewUser, StoreError, UserChanges, UserRecord, UserStore};
use crate::util::time::unix_ms_now;

/// id, name, email, password, status, created_at
type UserRow = (i64, String, String, String, i64, i64);
/// id, sender_id, receiver_id, content, created_at
type MessageRow = (i64, i64, i64, String, i64);

/// sqlx-backed store for SQLite and Postgres.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		let max_connections = max_connections.max(1);
		if database_url.starts_with("sqlite:") {
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			info!(max_connections, "store: sqlite ready");

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			info!(max_connections, "store: postgres ready");

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

fn user_from_row((id, name, email, password, status, created_at): UserRow) -> Result<UserRecord, StoreError> {
	let status = UserStatus::try_from(status).map_err(|e| StoreError::Corrupt(format!("user {id}: {e}")))?;
	Ok(UserRecord {
		user: User {
			id: UserId::new(id),
			name,
			email,
			status,
			created_at: datetime_from_unix_ms(created_at),
		},
		password_hash: password,
	})
}

fn message_from_row((id, sender_id, receiver_id, content, created_at): MessageRow) -> Message {
	Message {
		id,
		sender_id: UserId::new(sender_id),
		receiver_id: UserId::new(receiver_id),
		content,
		created_at: datetime_from_unix_ms(created_at),
	}
}

/// Unique violations only come from `users.email`.
fn classify(err: sqlx::Error) -> StoreError {
	match &err {
		sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
		_ => StoreError::Database(err),
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
		let created_at = unix_ms_now();
		let result: Result<(i64,), sqlx::Error> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?, ?, ?, ?) RETURNING id",
				)
				.bind(msg.sender_id.get())
				.bind(msg.receiver_id.get())
				.bind(&msg.content)
				.bind(created_at)
				.fetch_one(pool)
				.await
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES ($1, $2, $3, $4) RETURNING id",
				)
				.bind(msg.sender_id.get())
				.bind(msg.receiver_id.get())
				.bind(&msg.content)
				.bind(created_at)
				.fetch_one(pool)
				.await
			}
		};

		let (id,) = result.map_err(classify)?;
		Ok(Message {
			id,
			sender_id: msg.sender_id,
			receiver_id: msg.receiver_id,
			content: msg.content,
			created_at: datetime_from_unix_ms(created_at),
		})
	}

	async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
		let me = query.participant.get();
		let limit = i64::from(query.limit);

		let rows: Vec<MessageRow> = match (&self.backend, query.peer) {
			(SqlBackend::Sqlite(pool), None) => {
				sqlx::query_as(
					"SELECT id, sender_id, receiver_id, content, created_at FROM messages \
					 WHERE sender_id = ?1 OR receiver_id = ?1 \
					 ORDER BY created_at DESC, id DESC LIMIT ?2",
				)
				.bind(me)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			(SqlBackend::Sqlite(pool), Some(peer)) => {
				sqlx::query_as(
					"SELECT id, sender_id, receiver_id, content, created_at FROM messages \
					 WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1) \
					 ORDER BY created_at DESC, id DESC LIMIT ?3",
				)
				.bind(me)
				.bind(peer.get())
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			(SqlBackend::Postgres(pool), None) => {
				sqlx::query_as(
					"SELECT id, sender_id, receiver_id, content, created_at FROM messages \
					 WHERE sender_id = $1 OR receiver_id = $1 \
					 ORDER BY created_at DESC, id DESC LIMIT $2",
				)
				.bind(me)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			(SqlBackend::Postgres(pool), Some(peer)) => {
				sqlx::query_as(
					"SELECT id, sender_id, receiver_id, content, created_at FROM messages \
					 WHERE (sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1) \
					 ORDER BY created_at DESC, id DESC LIMIT $3",
				)
				.bind(me)
				.bind(peer.get())
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
		};

		Ok(rows.into_iter().map(message_from_row).collect())
	}
}

#[async_trait::async_trait]
impl UserStore for SqlStore {
	async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
		let created_at = unix_ms_now();
		let result: Result<(i64,), sqlx::Error> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO users (name, email, password, status, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
				)
				.bind(&new.name)
				.bind(&new.email)
				.bind(&new.password_hash)
				.bind(new.status.as_i64())
				.bind(created_at)
				.fetch_one(pool)
				.await
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"INSERT INTO users (name, email, password, status, created_at) VALUES ($1, $2, $3, $4, $5) RETURNING id",
				)
				.bind(&new.name)
				.bind(&new.email)
				.bind(&new.password_hash)
				.bind(new.status.as_i64())
				.bind(created_at)
				.fetch_one(pool)
				.await
			}
		};

		let (id,) = result.map_err(classify)?;
		Ok(User {
			id: UserId::new(id),
			name: new.name,
			email: new.email,
			status: new.status,
			created_at: datetime_from_unix_ms(created_at),
		})
	}

	async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, email, password, status, created_at FROM users WHERE id = ?")
					.bind(id.get())
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, email, password, status, created_at FROM users WHERE id = $1")
					.bind(id.get())
					.fetch_optional(pool)
					.await?
			}
		};
		row.map(user_from_row).transpose()
	}

	async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, email, password, status, created_at FROM users WHERE email = ?")
					.bind(email)
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, email, password, status, created_at FROM users WHERE email = $1")
					.bind(email)
					.fetch_optional(pool)
					.await?
			}
		};
		row.map(user_from_row).transpose()
	}

	async fn list_users(&self, status: Option<UserStatus>) -> Result<Vec<User>, StoreError> {
		let rows: Vec<UserRow> = match (&self.backend, status) {
			(SqlBackend::Sqlite(pool), None) => {
				sqlx::query_as("SELECT id, name, email, password, status, created_at FROM users ORDER BY id")
					.fetch_all(pool)
					.await?
			}
			(SqlBackend::Sqlite(pool), Some(status)) => {
				sqlx::query_as(
					"SELECT id, name, email, password, status, created_at FROM users WHERE status = ? ORDER BY id",
				)
				.bind(status.as_i64())
				.fetch_all(pool)
				.await?
			}
			(SqlBackend::Postgres(pool), None) => {
				sqlx::query_as("SELECT id, name, email, password, status, created_at FROM users ORDER BY id")
					.fetch_all(pool)
					.await?
			}
			(SqlBackend::Postgres(pool), Some(status)) => {
				sqlx::query_as(
					"SELECT id, name, email, password, status, created_at FROM users WHERE status = $1 ORDER BY id",
				)
				.bind(status.as_i64())
				.fetch_all(pool)
				.await?
			}
		};

		rows.into_iter().map(|r| user_from_row(r).map(|rec| rec.user)).collect()
	}

	async fn update_user(&self, id: UserId, changes: UserChanges) -> Result<Option<User>, StoreError> {
		let status = changes.status.map(UserStatus::as_i64);
		let result: Result<Option<UserRow>, sqlx::Error> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"UPDATE users SET name = COALESCE(?, name), email = COALESCE(?, email), \
					 status = COALESCE(?, status), password = COALESCE(?, password) WHERE id = ? \
					 RETURNING id, name, email, password, status, created_at",
				)
				.bind(changes.name.as_deref())
				.bind(changes.email.as_deref())
				.bind(status)
				.bind(changes.password_hash.as_deref())
				.bind(id.get())
				.fetch_optional(pool)
				.await
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"UPDATE users SET name = COALESCE($1, name), email = COALESCE($2, email), \
					 status = COALESCE($3, status), password = COALESCE($4, password) WHERE id = $5 \
					 RETURNING id, name, email, password, status, created_at",
				)
				.bind(changes.name.as_deref())
				.bind(changes.email.as_deref())
				.bind(status)
				.bind(changes.password_hash.as_deref())
				.bind(id.get())
				.fetch_optional(pool)
				.await
			}
		};

		let row = result.map_err(classify)?;
		row.map(|r| user_from_row(r).map(|rec| rec.user)).transpose()
	}

	async fn delete_user(&self, id: UserId) -> Result<bool, StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM users WHERE id = ?")
					.bind(id.get())
					.execute(pool)
					.await?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM users WHERE id = $1")
					.bind(id.get())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};
		Ok(affected > 0)
	}
}
