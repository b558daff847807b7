#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use parley_domain::{UserId, UserStatus};
use parley_server::server::auth::JwtAuthority;
use parley_server::server::http::spawn_http_server;
use parley_server::server::listener::ChatListener;
use parley_server::server::password::PasswordHasher;
use parley_server::server::services::Services;
use parley_server::server::session::SessionSettings;
use parley_server::server::store::{MessageQuery, NewUser, Stores};
use parley_util::secret::SecretString;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const TEST_SECRET: &str = "parley-test-secret";
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("PARLEY_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub fn test_services(stores: Stores) -> Services {
	test_services_with(stores, SessionSettings::default())
}

pub fn test_services_with(stores: Stores, settings: SessionSettings) -> Services {
	Services::new(
		stores,
		JwtAuthority::new(Some(SecretString::new(TEST_SECRET)), Duration::from_secs(3600)),
		PasswordHasher::new(4),
		settings,
	)
}

/// A listener pair (WebSocket + HTTP) on ephemeral ports.
pub struct TestServer {
	pub services: Services,
	pub ws_addr: SocketAddr,
	pub http_addr: SocketAddr,
	shutdown: Option<oneshot::Sender<()>>,
	listener_task: JoinHandle<()>,
	http_task: JoinHandle<()>,
}

impl TestServer {
	pub async fn start() -> Self {
		Self::start_with(test_services(Stores::in_memory())).await
	}

	pub async fn start_with(services: Services) -> Self {
		init_test_logging();

		let ws = TcpListener::bind("127.0.0.1:0").await.expect("bind ws listener");
		let ws_addr = ws.local_addr().expect("ws local addr");
		let listener = ChatListener::from_listener(ws, services.session_context());

		let http = TcpListener::bind("127.0.0.1:0").await.expect("bind http listener");
		let http_addr = http.local_addr().expect("http local addr");
		let http_task = spawn_http_server(http, services.api_state());

		let (tx, rx) = oneshot::channel::<()>();
		let listener_task = tokio::spawn(async move {
			let _ = listener
				.run(async {
					let _ = rx.await;
				})
				.await;
		});

		services.health.mark_ready();

		Self {
			services,
			ws_addr,
			http_addr,
			shutdown: Some(tx),
			listener_task,
			http_task,
		}
	}

	/// Stop accepting and wait for the listener to close live sessions.
	pub async fn stop(&mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.send(());
		}
		let _ = tokio::time::timeout(READ_TIMEOUT, &mut self.listener_task).await;
	}

	/// Insert a user straight into the store; the hash is never checked here.
	pub async fn create_user(&self, name: &str) -> UserId {
		self.services
			.stores
			.users
			.create_user(NewUser {
				name: name.to_string(),
				email: format!("{name}@example.com"),
				password_hash: "unused".to_string(),
				status: UserStatus::Active,
			})
			.await
			.expect("create user")
			.id
	}

	pub fn token_for(&self, user: UserId) -> String {
		self.services.tokens.issue(user).expect("issue token")
	}

	pub fn ws_url(&self, path_and_query: &str) -> String {
		format!("ws://{}{}", self.ws_addr, path_and_query)
	}

	/// Open a chat connection for `user` and wait until the registry has it.
	pub async fn connect(&self, user: UserId) -> WsClient {
		let previous = self.services.registry.connection_id(user);
		let url = self.ws_url(&format!("/ws/chat?token={}", self.token_for(user)));
		let (ws, _resp) = tokio_tungstenite::connect_async(url).await.expect("ws connect");

		self.wait_for(|| {
			let current = self.services.registry.connection_id(user);
			current.is_some() && current != previous
		})
		.await;
		ws
	}

	pub async fn wait_for(&self, mut cond: impl FnMut() -> bool) {
		let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
		while !cond() {
			assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	/// Poll the message store until `user`'s history holds `count` messages.
	pub async fn wait_for_history(&self, user: UserId, count: usize) -> Vec<parley_domain::Message> {
		let query = MessageQuery::new(user);
		let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
		loop {
			let stored = self
				.services
				.stores
				.messages
				.list_messages(&query)
				.await
				.expect("list messages");
			if stored.len() == count {
				return stored;
			}
			assert!(
				tokio::time::Instant::now() < deadline,
				"expected {count} messages, found {}",
				stored.len()
			);
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	/// One HTTP/1.1 request against the API listener; the body is parsed as JSON when possible.
	pub async fn http(&self, method: Method, path: &str, token: Option<&str>, body: Option<(&str, String)>) -> (StatusCode, Value) {
		let stream = TcpStream::connect(self.http_addr).await.expect("connect http");
		let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
			.await
			.expect("http handshake");
		tokio::spawn(conn);

		let mut builder = Request::builder()
			.method(method)
			.uri(path)
			.header(hyper::header::HOST, "localhost");
		if let Some(token) = token {
			builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {token}"));
		}
		let payload = match body {
			Some((content_type, body)) => {
				builder = builder.header(hyper::header::CONTENT_TYPE, content_type);
				Bytes::from(body)
			}
			None => Bytes::new(),
		};

		let resp = sender
			.send_request(builder.body(Full::new(payload)).expect("build request"))
			.await
			.expect("send request");
		let status = resp.status();
		let bytes = resp.into_body().collect().await.expect("read body").to_bytes();
		let json = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
		(status, json)
	}

	pub async fn post_json(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
		self.http(Method::POST, path, token, Some(("application/json", body.to_string())))
			.await
	}

	pub async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
		self.http(Method::GET, path, token, None).await
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.send(());
		}
		self.http_task.abort();
	}
}

pub async fn send_chat(ws: &mut WsClient, receiver: UserId, message: &str) {
	let frame = serde_json::json!({ "receiver_id": receiver, "message": message });
	ws.send(Message::text(frame.to_string())).await.expect("send chat frame");
}

/// Next text frame as JSON, skipping control frames.
pub async fn next_json(ws: &mut WsClient) -> Value {
	loop {
		let msg = tokio::time::timeout(READ_TIMEOUT, ws.next())
			.await
			.expect("timed out waiting for a frame")
			.expect("stream ended")
			.expect("ws error");
		match msg {
			Message::Text(text) => return serde_json::from_str(text.as_str()).expect("delivery frame is json"),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}

/// Read until the peer closes; returns its close frame, if it sent one.
pub async fn next_close(ws: &mut WsClient) -> Option<CloseFrame> {
	loop {
		let next = tokio::time::timeout(READ_TIMEOUT, ws.next())
			.await
			.expect("timed out waiting for close");
		match next {
			Some(Ok(Message::Close(frame))) => return frame,
			Some(Ok(_)) => continue,
			Some(Err(_)) | None => return None,
		}
	}
}

/// Assert nothing but control frames arrive within `wait`.
pub async fn assert_silent(ws: &mut WsClient, wait: Duration) {
	let deadline = tokio::time::Instant::now() + wait;
	loop {
		match tokio::time::timeout_at(deadline, ws.next()).await {
			Err(_) => return,
			Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
			Ok(other) => panic!("expected no frames, got {other:?}"),
		}
	}
}
