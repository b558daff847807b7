#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_protocol::endpoint::{CHAT_PATH, TOKEN_QUERY_PARAM};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::server::session::{SessionContext, handle_session};

/// Accepts TCP connections and upgrades `/ws/chat` requests into sessions.
pub struct ChatListener {
	listener: TcpListener,
	ctx: SessionContext,
	next_conn_id: Arc<AtomicU64>,
}

impl ChatListener {
	pub async fn bind(addr: SocketAddr, ctx: SessionContext) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		Ok(Self::from_listener(listener, ctx))
	}

	pub fn from_listener(listener: TcpListener, ctx: SessionContext) -> Self {
		Self {
			listener,
			ctx,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	/// Accept until `shutdown` resolves, then close every live session.
	pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
		tokio::pin!(shutdown);

		loop {
			tokio::select! {
				_ = &mut shutdown => {
					info!("listener: shutdown requested, no longer accepting");
					break;
				}
				accepted = self.listener.accept() => {
					let (stream, remote) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!(error = %e, "listener: accept failed");
							continue;
						}
					};

					let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
					metrics::counter!("parley_server_connections_total").increment(1);
					debug!(conn_id, %remote, "listener: accepted tcp connection");

					let ctx = self.ctx.clone();
					tokio::spawn(async move {
						if let Err(e) = serve_connection(conn_id, stream, ctx).await {
							debug!(conn_id, %remote, error = %e, "listener: connection ended with error");
						}
					});
				}
			}
		}

		let closed = self.ctx.registry.shutdown();
		info!(sessions = closed, "listener: closed live sessions");
		Ok(())
	}
}

async fn serve_connection(conn_id: u64, stream: TcpStream, ctx: SessionContext) -> anyhow::Result<()> {
	let config = WebSocketConfig::default()
		.max_message_size(Some(ctx.settings.max_message_bytes))
		.max_frame_size(Some(ctx.settings.max_message_bytes));

	let mut token: Option<String> = None;
	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		if req.uri().path() != CHAT_PATH {
			let mut not_found = ErrorResponse::new(Some("not found".to_string()));
			*not_found.status_mut() = StatusCode::NOT_FOUND;
			return Err(not_found);
		}
		token = req.uri().query().and_then(token_from_query);
		Ok(resp)
	};

	let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config));
	let ws = match tokio::time::timeout(ctx.settings.handshake_timeout, handshake).await {
		Ok(res) => res?,
		Err(_) => {
			metrics::counter!("parley_server_handshake_timeouts_total").increment(1);
			debug!(conn_id, "listener: websocket handshake timed out");
			return Ok(());
		}
	};
	handle_session(conn_id, ws, token, ctx).await
}

/// Percent-decoded `token` value from a query string; empty counts as absent.
pub fn token_from_query(query: &str) -> Option<String> {
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == TOKEN_QUERY_PARAM)
		.map(|(_, v)| v.into_owned())
		.filter(|v| !v.trim().is_empty())
}
