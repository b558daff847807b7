#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use crate::server::http::{json_response, text_response};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Answer liveness/readiness probes; `None` for any other path.
pub fn probe(path: &str, state: &HealthState) -> Option<Response<Full<Bytes>>> {
	match path {
		"/" => Some(json_response(StatusCode::OK, &serde_json::json!({ "message": "working" }))),
		"/health" => Some(json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))),
		"/healthz" => Some(text_response(StatusCode::OK, "ok")),
		"/readyz" => Some(if state.is_ready() {
			text_response(StatusCode::OK, "ready")
		} else {
			text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
		}),
		_ => None,
	}
}
