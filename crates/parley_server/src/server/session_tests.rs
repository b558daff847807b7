#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{Message, NewMessage, UserId, UserStatus};
use parley_protocol::DeliveryFrame;
use parley_util::secret::SecretString;
use tokio::sync::mpsc;

use crate::server::auth::JwtAuthority;
use crate::server::registry::{ConnectionRegistry, DeliveryOutcome};
use crate::server::session::{FrameDisposition, SessionContext, SessionSettings, handle_frame};
use crate::server::store::{InMemoryStore, MessageQuery, MessageStore, NewUser, StoreError, UserStore};

struct FailingStore;

#[async_trait::async_trait]
impl MessageStore for FailingStore {
	async fn append_message(&self, _msg: NewMessage) -> Result<Message, StoreError> {
		Err(StoreError::Unavailable("disk on fire".to_string()))
	}

	async fn list_messages(&self, _query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
		Ok(Vec::new())
	}
}

fn context(messages: Arc<dyn MessageStore>) -> SessionContext {
	SessionContext {
		registry: ConnectionRegistry::new(),
		messages,
		verifier: Arc::new(JwtAuthority::new(
			Some(SecretString::new("test")),
			Duration::from_secs(60),
		)),
		settings: SessionSettings::default(),
	}
}

async fn store_with_users() -> (Arc<InMemoryStore>, UserId, UserId) {
	let store = Arc::new(InMemoryStore::new());
	let mut ids = Vec::new();
	for email in ["a@x.io", "b@x.io"] {
		let user = store
			.create_user(NewUser {
				name: email.to_string(),
				email: email.to_string(),
				password_hash: "x".to_string(),
				status: UserStatus::Active,
			})
			.await
			.unwrap();
		ids.push(user.id);
	}
	(store, ids[0], ids[1])
}

#[tokio::test]
async fn accepted_frame_is_persisted_then_delivered() {
	let (store, a, b) = store_with_users().await;
	let ctx = context(store.clone());
	let (tx, mut rx) = mpsc::channel(4);
	ctx.registry.register(b, 7, tx);

	let raw = format!(r#"{{"receiver_id": {}, "message": "  hi  "}}"#, b.get());
	let disposition = handle_frame(&ctx, a, 1, &raw).await;
	assert_eq!(disposition, FrameDisposition::Routed(DeliveryOutcome::Delivered));

	assert_eq!(rx.recv().await, Some(DeliveryFrame::new(a, "hi")));
	let history = store.list_messages(&MessageQuery::new(b)).await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].content, "hi");
	assert_eq!(history[0].sender_id, a);
}

#[tokio::test]
async fn offline_receiver_still_gets_a_stored_message() {
	let (store, a, b) = store_with_users().await;
	let ctx = context(store.clone());

	let raw = format!(r#"{{"receiver_id": "{}", "message": "later"}}"#, b.get());
	let disposition = handle_frame(&ctx, a, 1, &raw).await;
	assert_eq!(disposition, FrameDisposition::Routed(DeliveryOutcome::Offline));
	assert_eq!(store.list_messages(&MessageQuery::new(a)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn whitespace_content_is_neither_stored_nor_delivered() {
	let (store, a, b) = store_with_users().await;
	let ctx = context(store.clone());
	let (tx, mut rx) = mpsc::channel(4);
	ctx.registry.register(b, 7, tx);

	let raw = format!(r#"{{"receiver_id": {}, "message": " \n\t "}}"#, b.get());
	assert_eq!(handle_frame(&ctx, a, 1, &raw).await, FrameDisposition::Empty);
	assert!(store.list_messages(&MessageQuery::new(a)).await.unwrap().is_empty());
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_frames_are_discarded() {
	let (store, a, _) = store_with_users().await;
	let ctx = context(store.clone());

	for raw in [
		"not json",
		"[]",
		r#"{"message": "no receiver"}"#,
		r#"{"receiver_id": "bob", "message": "x"}"#,
		r#"{"receiver_id": 2}"#,
	] {
		assert_eq!(handle_frame(&ctx, a, 1, raw).await, FrameDisposition::Malformed, "{raw}");
	}
	assert!(store.list_messages(&MessageQuery::new(a)).await.unwrap().is_empty());
}

#[tokio::test]
async fn persistence_failure_skips_delivery() {
	let ctx = context(Arc::new(FailingStore));
	let (tx, mut rx) = mpsc::channel(4);
	ctx.registry.register(UserId::new(2), 7, tx);

	let disposition = handle_frame(&ctx, UserId::new(1), 1, r#"{"receiver_id": 2, "message": "hi"}"#).await;
	assert_eq!(disposition, FrameDisposition::PersistFailed);
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn frames_from_one_sender_are_stored_in_order() {
	let (store, a, b) = store_with_users().await;
	let ctx = context(store.clone());
	let (tx, mut rx) = mpsc::channel(16);
	ctx.registry.register(b, 7, tx);

	for i in 0..5 {
		let raw = format!(r#"{{"receiver_id": {}, "message": "m{i}"}}"#, b.get());
		handle_frame(&ctx, a, 1, &raw).await;
	}

	for i in 0..5 {
		assert_eq!(rx.recv().await, Some(DeliveryFrame::new(a, format!("m{i}"))));
	}
	let history = store.list_messages(&MessageQuery::new(a)).await.unwrap();
	let ids: Vec<i64> = history.iter().rev().map(|m| m.id).collect();
	assert!(ids.windows(2).all(|w| w[0] < w[1]));
}
