#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_domain::{NewMessage, UserId};
use parley_protocol::{DEFAULT_MAX_MESSAGE_BYTES, DeliveryFrame, InboundChatFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::server::auth::{AuthError, TokenVerifier};
use crate::server::registry::{ConnectionRegistry, DeliveryOutcome};
use crate::server::store::MessageStore;

/// How long a rejected client gets to acknowledge our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Frames queued for one receiver before new ones are dropped.
	pub outbound_queue_capacity: usize,
	pub max_message_bytes: usize,
	/// Upper bound on the HTTP upgrade of a freshly accepted socket.
	pub handshake_timeout: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
		}
	}
}

/// Everything a session needs, shared by every session of the process.
#[derive(Clone)]
pub struct SessionContext {
	pub registry: ConnectionRegistry,
	pub messages: Arc<dyn MessageStore>,
	pub verifier: Arc<dyn TokenVerifier>,
	pub settings: SessionSettings,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
	Malformed,
	Empty,
	PersistFailed,
	Routed(DeliveryOutcome),
}

/// Unregisters the session on every exit path.
struct SessionGuard {
	registry: ConnectionRegistry,
	user: UserId,
	conn_id: u64,
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.registry.unregister(self.user, self.conn_id);
		metrics::gauge!("parley_server_active_sessions").decrement(1.0);
	}
}

/// Drive one upgraded WebSocket from authentication until it closes.
pub async fn handle_session<S>(
	conn_id: u64,
	mut ws: WebSocketStream<S>,
	token: Option<String>,
	ctx: SessionContext,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let verified = match token.as_deref() {
		Some(token) => ctx.verifier.verify(token),
		None => Err(AuthError::MissingToken),
	};
	let user = match verified {
		Ok(user) => user,
		Err(e) => {
			metrics::counter!("parley_server_auth_failures_total").increment(1);
			info!(conn_id, error = %e, "session: authentication failed");
			reject(&mut ws).await;
			return Ok(());
		}
	};

	let (tx, mut rx) = mpsc::channel::<DeliveryFrame>(ctx.settings.outbound_queue_capacity.max(1));
	if let Some(previous) = ctx.registry.register(user, conn_id, tx) {
		metrics::counter!("parley_server_sessions_replaced_total").increment(1);
		info!(conn_id, user_id = %user, previous_conn_id = previous, "session: replaced previous session");
	}

	metrics::gauge!("parley_server_active_sessions").increment(1.0);
	let _guard = SessionGuard {
		registry: ctx.registry.clone(),
		user,
		conn_id,
	};
	info!(conn_id, user_id = %user, "session: authenticated");

	let (mut sink, mut stream) = ws.split();

	let registry = ctx.registry.clone();
	let mut writer = tokio::spawn(async move {
		while let Some(frame) = rx.recv().await {
			let text = match frame.to_json() {
				Ok(text) => text,
				Err(e) => {
					warn!(conn_id, error = %e, "session: failed to encode delivery frame");
					continue;
				}
			};
			sink.send(Message::text(text)).await?;
		}

		// Queue closed: replaced by a newer session or the server is stopping.
		let close = if registry.is_shutting_down() {
			CloseFrame {
				code: CloseCode::Away,
				reason: Utf8Bytes::from_static("server shutting down"),
			}
		} else {
			CloseFrame {
				code: CloseCode::Normal,
				reason: Utf8Bytes::from_static("session replaced"),
			}
		};
		sink.send(Message::Close(Some(close))).await?;
		Ok::<(), tokio_tungstenite::tungstenite::Error>(())
	});

	loop {
		tokio::select! {
			incoming = stream.next() => match incoming {
				Some(Ok(Message::Text(text))) => {
					handle_frame(&ctx, user, conn_id, text.as_str()).await;
				}
				Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
					Ok(text) => {
						handle_frame(&ctx, user, conn_id, text).await;
					}
					Err(_) => {
						metrics::counter!("parley_server_frames_malformed_total").increment(1);
						debug!(conn_id, user_id = %user, "session: binary frame is not utf-8, ignoring");
					}
				},
				Some(Ok(Message::Close(frame))) => {
					debug!(conn_id, user_id = %user, close = ?frame, "session: peer closed");
					// The close reply is queued inside the stream; polling on flushes it.
					let _ = tokio::time::timeout(CLOSE_GRACE, async {
						while let Some(Ok(_)) = stream.next().await {}
					})
					.await;
					break;
				}
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(conn_id, user_id = %user, error = %e, "session: transport error");
					break;
				}
				None => break,
			},
			res = &mut writer => {
				match res {
					Ok(Ok(())) => debug!(conn_id, user_id = %user, "session: outbound queue closed"),
					Ok(Err(e)) => debug!(conn_id, user_id = %user, error = %e, "session: write failed"),
					Err(e) => warn!(conn_id, user_id = %user, error = %e, "session: writer task failed"),
				}
				break;
			}
		}
	}

	writer.abort();
	info!(conn_id, user_id = %user, "session: closed");
	Ok(())
}

/// Validate, persist and route one inbound text payload from `sender`.
///
/// Delivery is attempted only after the store accepted the message.
pub async fn handle_frame(ctx: &SessionContext, sender: UserId, conn_id: u64, raw: &str) -> FrameDisposition {
	metrics::counter!("parley_server_frames_in_total").increment(1);

	let frame = match InboundChatFrame::parse(raw) {
		Ok(frame) => frame,
		Err(e) => {
			metrics::counter!("parley_server_frames_malformed_total").increment(1);
			debug!(conn_id, user_id = %sender, error = %e, "session: malformed frame discarded");
			return FrameDisposition::Malformed;
		}
	};

	let Some(content) = frame.trimmed_content() else {
		metrics::counter!("parley_server_frames_empty_total").increment(1);
		return FrameDisposition::Empty;
	};

	let receiver = frame.receiver_id;
	let stored = match ctx
		.messages
		.append_message(NewMessage {
			sender_id: sender,
			receiver_id: receiver,
			content: content.to_string(),
		})
		.await
	{
		Ok(stored) => stored,
		Err(e) => {
			metrics::counter!("parley_server_persist_failures_total").increment(1);
			error!(conn_id, user_id = %sender, receiver_id = %receiver, error = %e, "session: failed to persist message");
			return FrameDisposition::PersistFailed;
		}
	};
	metrics::counter!("parley_server_messages_persisted_total").increment(1);

	let outcome = ctx.registry.deliver(receiver, DeliveryFrame::from(&stored));
	metrics::counter!("parley_server_deliveries_total", "outcome" => outcome.as_str()).increment(1);
	debug!(
		conn_id,
		user_id = %sender,
		receiver_id = %receiver,
		message_id = stored.id,
		outcome = outcome.as_str(),
		"session: message routed"
	);

	FrameDisposition::Routed(outcome)
}

async fn reject<S>(ws: &mut WebSocketStream<S>)
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let close = CloseFrame {
		code: CloseCode::Policy,
		reason: Utf8Bytes::from_static("authentication failed"),
	};
	if let Err(e) = ws.close(Some(close)).await {
		debug!(error = %e, "session: failed to send policy close");
		return;
	}
	let _ = tokio::time::timeout(CLOSE_GRACE, async {
		while let Some(Ok(_)) = ws.next().await {}
	})
	.await;
}
