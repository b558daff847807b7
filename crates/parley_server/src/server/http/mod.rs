#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parley_domain::User;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::server::auth::{JwtAuthority, TokenVerifier};
use crate::server::health::{self, HealthState};
use crate::server::password::PasswordHasher;
use crate::server::store::{StoreError, Stores};

mod messages;
mod users;

/// Request bodies larger than this are rejected with 413.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

pub type HttpResponse = Response<Full<Bytes>>;

/// Shared state for the HTTP API.
#[derive(Clone)]
pub struct ApiState {
	pub stores: Stores,
	pub tokens: Arc<JwtAuthority>,
	pub hasher: PasswordHasher,
	pub health: HealthState,
}

/// An error rendered as `{"detail": ...}` with the given status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
	pub status: StatusCode,
	pub detail: String,
}

impl ApiError {
	pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
		Self {
			status,
			detail: detail.into(),
		}
	}

	pub fn bad_request(detail: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_REQUEST, detail)
	}

	pub fn unauthorized(detail: impl Into<String>) -> Self {
		Self::new(StatusCode::UNAUTHORIZED, detail)
	}

	pub fn forbidden(detail: impl Into<String>) -> Self {
		Self::new(StatusCode::FORBIDDEN, detail)
	}

	pub fn not_found(detail: impl Into<String>) -> Self {
		Self::new(StatusCode::NOT_FOUND, detail)
	}

	pub fn unprocessable(detail: impl Into<String>) -> Self {
		Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
	}

	pub fn internal(detail: impl Into<String>) -> Self {
		Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
	}

	pub fn into_response(self) -> HttpResponse {
		let mut resp = json_response(self.status, &serde_json::json!({ "detail": self.detail }));
		if self.status == StatusCode::UNAUTHORIZED {
			resp.headers_mut()
				.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
		}
		resp
	}
}

impl From<StoreError> for ApiError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::DuplicateEmail => ApiError::bad_request("Email already registered"),
			other => {
				error!(error = %other, "http: store error");
				ApiError::internal("Internal server error")
			}
		}
	}
}

fn build_response(status: StatusCode, content_type: &'static str, body: Bytes) -> HttpResponse {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> HttpResponse {
	match serde_json::to_vec(body) {
		Ok(bytes) => build_response(status, "application/json", Bytes::from(bytes)),
		Err(e) => {
			error!(error = %e, "http: failed to encode response");
			text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
		}
	}
}

pub fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
	build_response(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

pub fn spawn_http_server(listener: TcpListener, state: ApiState) -> JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(listener, state).await {
			warn!(error = %err, "http server stopped");
		}
	})
}

async fn run_http_server(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: ApiState) -> Result<HttpResponse, Infallible> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let resp = match route(req, &state).await {
		Ok(resp) => resp,
		Err(e) => {
			debug!(%method, %path, status = e.status.as_u16(), detail = %e.detail, "http: request failed");
			e.into_response()
		}
	};
	metrics::counter!("parley_server_http_requests_total", "status" => resp.status().as_u16().to_string()).increment(1);
	Ok(resp)
}

async fn route(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	let path = req.uri().path().to_string();
	if *req.method() == Method::GET {
		if let Some(resp) = health::probe(&path, &state.health) {
			return Ok(resp);
		}
	}

	let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	let rest = match segments.as_slice() {
		["api", "v1", rest @ ..] => rest,
		_ => return Err(ApiError::not_found("Not Found")),
	};

	let method = req.method().clone();
	match (&method, rest) {
		(&Method::POST, ["users"]) => users::create(req, state).await,
		(&Method::GET, ["users"]) => users::list(req, state).await,
		(&Method::POST, ["users", "login"]) => users::login_json(req, state).await,
		(&Method::POST, ["users", "token"]) => users::login_form(req, state).await,
		(&Method::GET, ["users", "me"]) => users::me(req, state).await,
		(&Method::GET, ["users", id]) => users::get(req, state, parse_path_id(id)?).await,
		(&Method::PUT, ["users", id]) => users::update(req, state, parse_path_id(id)?).await,
		(&Method::DELETE, ["users", id]) => users::delete(req, state, parse_path_id(id)?).await,
		(&Method::GET, ["messages"]) => messages::list(req, state).await,
		(_, ["users"] | ["users", _] | ["messages"]) => Err(ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")),
		_ => Err(ApiError::not_found("Not Found")),
	}
}

fn parse_path_id(raw: &str) -> Result<i64, ApiError> {
	raw.parse::<i64>()
		.map_err(|_| ApiError::unprocessable(format!("invalid id in path: {raw:?}")))
}

pub(crate) fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
	req.uri()
		.query()
		.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
		.unwrap_or_default()
}

pub(crate) async fn read_body(body: Incoming) -> Result<Bytes, ApiError> {
	match Limited::new(body, MAX_BODY_BYTES).collect().await {
		Ok(collected) => Ok(collected.to_bytes()),
		Err(e) if e.is::<LengthLimitError>() => Err(ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")),
		Err(e) => Err(ApiError::bad_request(format!("could not read request body: {e}"))),
	}
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
	serde_json::from_slice(body).map_err(|e| ApiError::unprocessable(format!("invalid request body: {e}")))
}

/// Resolve the bearer token to an existing, active user.
pub(crate) async fn current_user(headers: &HeaderMap, state: &ApiState) -> Result<User, ApiError> {
	let token = headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| {
			let (scheme, token) = v.trim().split_once(' ')?;
			scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
		})
		.filter(|t| !t.is_empty())
		.ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;

	let user_id = state.tokens.verify(token).map_err(|e| {
		debug!(error = %e, "http: bearer token rejected");
		ApiError::unauthorized("Could not validate credentials")
	})?;

	let record = state
		.stores
		.users
		.user_by_id(user_id)
		.await?
		.ok_or_else(|| ApiError::unauthorized("Could not validate credentials"))?;

	if !record.user.status.is_active() {
		return Err(ApiError::forbidden("Inactive user"));
	}
	Ok(record.user)
}
