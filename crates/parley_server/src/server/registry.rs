#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use parley_domain::UserId;
use parley_protocol::DeliveryFrame;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Process-wide map from an authenticated user to their single live session.
///
/// Cloning is cheap; every clone refers to the same map. Mutations
/// (`register`, `unregister`, `shutdown`) take the write lock. Lookups
/// (`deliver`, `broadcast`) take the read lock and only perform non-blocking
/// enqueues, so they never wait on a slow receiver.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	entries: RwLock<HashMap<UserId, ConnectionEntry>>,
	shutting_down: AtomicBool,
}

/// One live session's outbound channel.
#[derive(Debug)]
struct ConnectionEntry {
	conn_id: u64,
	tx: mpsc::Sender<DeliveryFrame>,
	connected_at: Instant,
}

/// Result of a single delivery attempt. None of these are errors for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// Frame was queued on the receiver's session.
	Delivered,
	/// Receiver has no live session (or it is closing).
	Offline,
	/// Receiver's outbound queue was full; the frame was dropped.
	Dropped,
}

impl DeliveryOutcome {
	pub const fn as_str(self) -> &'static str {
		match self {
			DeliveryOutcome::Delivered => "delivered",
			DeliveryOutcome::Offline => "offline",
			DeliveryOutcome::Dropped => "dropped",
		}
	}
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Install `tx` as the live channel for `user`, replacing any previous one.
	///
	/// Returns the connection id of the replaced session, if any. The replaced
	/// channel is dropped here; its session notices the closed queue and closes
	/// its own transport.
	pub fn register(&self, user: UserId, conn_id: u64, tx: mpsc::Sender<DeliveryFrame>) -> Option<u64> {
		// Checked under the write lock so a concurrent `shutdown` cannot miss us.
		let mut entries = self.inner.entries.write();
		if self.is_shutting_down() {
			debug!(%user, conn_id, "registry: shutting down, not registering");
			return None;
		}

		let entry = ConnectionEntry {
			conn_id,
			tx,
			connected_at: Instant::now(),
		};
		let previous = entries.insert(user, entry);
		drop(entries);

		let replaced = previous.map(|prev| prev.conn_id);
		debug!(%user, conn_id, replaced = ?replaced, "registry: registered");
		replaced
	}

	/// Remove the entry for `user` if it still belongs to `conn_id`.
	///
	/// A no-op when the user is absent or the entry was already replaced by a
	/// newer session. Returns whether an entry was removed.
	pub fn unregister(&self, user: UserId, conn_id: u64) -> bool {
		let mut entries = self.inner.entries.write();
		match entries.get(&user) {
			Some(entry) if entry.conn_id == conn_id => {
				if let Some(entry) = entries.remove(&user) {
					drop(entries);
					let uptime_ms = entry.connected_at.elapsed().as_millis() as u64;
					debug!(%user, conn_id, uptime_ms, "registry: unregistered");
				}
				true
			}
			Some(entry) => {
				debug!(%user, conn_id, current = entry.conn_id, "registry: entry owned by newer session, keeping");
				false
			}
			None => false,
		}
	}

	/// Push `frame` to `user`'s live session, if there is one.
	pub fn deliver(&self, user: UserId, frame: DeliveryFrame) -> DeliveryOutcome {
		let entries = self.inner.entries.read();
		let Some(entry) = entries.get(&user) else {
			return DeliveryOutcome::Offline;
		};

		match entry.tx.try_send(frame) {
			Ok(()) => DeliveryOutcome::Delivered,
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(%user, conn_id = entry.conn_id, "registry: outbound queue full, dropping frame");
				DeliveryOutcome::Dropped
			}
			Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Offline,
		}
	}

	/// Push `frame` to every live session. Returns how many accepted it.
	pub fn broadcast(&self, frame: &DeliveryFrame) -> usize {
		let entries = self.inner.entries.read();
		let mut accepted = 0usize;
		for (user, entry) in entries.iter() {
			if entry.tx.try_send(frame.clone()).is_ok() {
				accepted += 1;
			} else {
				debug!(%user, conn_id = entry.conn_id, "registry: broadcast skipped session");
			}
		}
		accepted
	}

	pub fn is_connected(&self, user: UserId) -> bool {
		self.inner.entries.read().contains_key(&user)
	}

	/// Connection id of `user`'s live session, if any.
	pub fn connection_id(&self, user: UserId) -> Option<u64> {
		self.inner.entries.read().get(&user).map(|e| e.conn_id)
	}

	pub fn connection_count(&self) -> usize {
		self.inner.entries.read().len()
	}

	/// Drop every entry and refuse new registrations.
	///
	/// Each session sees its outbound queue close and closes its transport.
	/// Returns the number of sessions that were live.
	pub fn shutdown(&self) -> usize {
		let drained: Vec<(UserId, ConnectionEntry)> = {
			let mut entries = self.inner.entries.write();
			self.inner.shutting_down.store(true, Ordering::SeqCst);
			entries.drain().collect()
		};
		debug!(sessions = drained.len(), "registry: shut down");
		drained.len()
	}

	pub fn is_shutting_down(&self) -> bool {
		self.inner.shutting_down.load(Ordering::SeqCst)
	}
}
