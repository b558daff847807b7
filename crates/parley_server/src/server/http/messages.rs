#![forbid(unsafe_code)]

use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use parley_domain::UserId;

use super::{ApiError, ApiState, HttpResponse, current_user, json_response, query_params};
use crate::server::store::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT, MessageQuery};

/// `GET /api/v1/messages?with_user_id=&limit=`: the caller's history, newest first.
pub(super) async fn list(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	let me = current_user(req.headers(), state).await?;
	let params = query_params(&req);

	let peer = match params.get("with_user_id") {
		Some(raw) => Some(
			raw.parse::<UserId>()
				.map_err(|_| ApiError::unprocessable("with_user_id must be an integer"))?,
		),
		None => None,
	};

	let limit = match params.get("limit") {
		Some(raw) => raw
			.trim()
			.parse::<u32>()
			.ok()
			.filter(|n| (1..=MAX_HISTORY_LIMIT).contains(n))
			.ok_or_else(|| ApiError::unprocessable(format!("limit must be between 1 and {MAX_HISTORY_LIMIT}")))?,
		None => DEFAULT_HISTORY_LIMIT,
	};

	let query = MessageQuery::new(me.id).with_peer(peer).with_limit(limit);
	let messages = state.stores.messages.list_messages(&query).await?;
	Ok(json_response(StatusCode::OK, &messages))
}
