#![forbid(unsafe_code)]

use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use parley_domain::{User, UserId, UserStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiError, ApiState, HttpResponse, current_user, json_response, parse_json, query_params, read_body};
use crate::server::auth::AuthError;
use crate::server::password::{PasswordCheck, PasswordError, PasswordHasher};
use crate::server::store::{NewUser, UserChanges};

#[derive(Debug, Deserialize)]
struct UserCreate {
	name: String,
	email: String,
	password: String,
	#[serde(default)]
	status: Option<UserStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct UserUpdate {
	name: Option<String>,
	email: Option<String>,
	password: Option<String>,
	status: Option<UserStatus>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
	email: String,
	password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
	access_token: String,
	token_type: &'static str,
}

async fn hash_password(hasher: PasswordHasher, password: String) -> Result<String, ApiError> {
	let joined = tokio::task::spawn_blocking(move || hasher.hash(&password)).await;
	match joined {
		Ok(Ok(hash)) => Ok(hash),
		Ok(Err(PasswordError::Empty)) => Err(ApiError::unprocessable("password must not be empty")),
		Ok(Err(e)) => Err(ApiError::internal(format!("password hashing failed: {e}"))),
		Err(e) => Err(ApiError::internal(format!("password hashing task failed: {e}"))),
	}
}

async fn check_password(hasher: PasswordHasher, password: String, stored: String) -> Result<PasswordCheck, ApiError> {
	let joined = tokio::task::spawn_blocking(move || hasher.verify(&password, &stored)).await;
	match joined {
		Ok(Ok(check)) => Ok(check),
		Ok(Err(e)) => {
			warn!(error = %e, "http: stored password hash is unreadable");
			Ok(PasswordCheck::Invalid)
		}
		Err(e) => Err(ApiError::internal(format!("password check task failed: {e}"))),
	}
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
	if value.trim().is_empty() {
		return Err(ApiError::unprocessable(format!("{field} must not be empty")));
	}
	Ok(())
}

pub(super) async fn create(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	let body = read_body(req.into_body()).await?;
	let input: UserCreate = parse_json(&body)?;
	require_non_empty("name", &input.name)?;
	require_non_empty("email", &input.email)?;

	if state.stores.users.user_by_email(&input.email).await?.is_some() {
		return Err(ApiError::bad_request("Email already registered"));
	}

	let password_hash = hash_password(state.hasher, input.password).await?;
	let user = state
		.stores
		.users
		.create_user(NewUser {
			name: input.name,
			email: input.email,
			password_hash,
			status: input.status.unwrap_or_default(),
		})
		.await?;

	info!(user_id = %user.id, "http: user registered");
	Ok(json_response(StatusCode::OK, &user))
}

pub(super) async fn login_json(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	let body = read_body(req.into_body()).await?;
	let input: LoginRequest = parse_json(&body)?;
	login(state, input.email, input.password).await
}

/// OAuth2 password-flow variant: form fields `username` (the email) and `password`.
pub(super) async fn login_form(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	let body = read_body(req.into_body()).await?;
	let mut username = None;
	let mut password = None;
	for (k, v) in url::form_urlencoded::parse(&body) {
		match k.as_ref() {
			"username" => username = Some(v.into_owned()),
			"password" => password = Some(v.into_owned()),
			_ => {}
		}
	}

	let (Some(username), Some(password)) = (username, password) else {
		return Err(ApiError::unprocessable("username and password are required"));
	};
	login(state, username, password).await
}

async fn login(state: &ApiState, email: String, password: String) -> Result<HttpResponse, ApiError> {
	let Some(record) = state.stores.users.user_by_email(&email).await? else {
		return Err(ApiError::unauthorized("Invalid credentials"));
	};

	let check = check_password(state.hasher, password.clone(), record.password_hash.clone()).await?;
	if !check.is_valid() {
		return Err(ApiError::unauthorized("Invalid credentials"));
	}
	if !record.user.status.is_active() {
		return Err(ApiError::forbidden("Account is inactive"));
	}

	let user_id = record.user.id;
	if check == PasswordCheck::ValidNeedsUpgrade {
		let password_hash = hash_password(state.hasher, password).await?;
		state
			.stores
			.users
			.update_user(
				user_id,
				UserChanges {
					password_hash: Some(password_hash),
					..UserChanges::default()
				},
			)
			.await?;
		info!(user_id = %user_id, "http: upgraded legacy plain-text password");
	}

	let access_token = state.tokens.issue(user_id).map_err(|e| match e {
		AuthError::NotConfigured => ApiError::internal("token signing is not configured"),
		other => ApiError::internal(format!("could not issue token: {other}")),
	})?;

	Ok(json_response(
		StatusCode::OK,
		&TokenResponse {
			access_token,
			token_type: "bearer",
		},
	))
}

pub(super) async fn list(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	current_user(req.headers(), state).await?;

	let status = match query_params(&req).get("status_filter") {
		Some(raw) => {
			let value = raw
				.trim()
				.parse::<i64>()
				.map_err(|_| ApiError::unprocessable("status_filter must be an integer"))?;
			Some(UserStatus::try_from(value).map_err(|e| ApiError::unprocessable(e.to_string()))?)
		}
		None => None,
	};

	let users: Vec<User> = state.stores.users.list_users(status).await?;
	Ok(json_response(StatusCode::OK, &users))
}

pub(super) async fn me(req: Request<Incoming>, state: &ApiState) -> Result<HttpResponse, ApiError> {
	let user = current_user(req.headers(), state).await?;
	Ok(json_response(StatusCode::OK, &user))
}

pub(super) async fn get(req: Request<Incoming>, state: &ApiState, id: i64) -> Result<HttpResponse, ApiError> {
	current_user(req.headers(), state).await?;

	let record = state
		.stores
		.users
		.user_by_id(UserId::new(id))
		.await?
		.ok_or_else(|| ApiError::not_found("User not found"))?;
	Ok(json_response(StatusCode::OK, &record.user))
}

pub(super) async fn update(req: Request<Incoming>, state: &ApiState, id: i64) -> Result<HttpResponse, ApiError> {
	let (parts, body) = req.into_parts();
	let me = current_user(&parts.headers, state).await?;
	if me.id.get() != id {
		return Err(ApiError::forbidden("Not allowed to update another user"));
	}

	let body = read_body(body).await?;
	let input: UserUpdate = if body.is_empty() {
		UserUpdate::default()
	} else {
		parse_json(&body)?
	};

	let password_hash = match input.password {
		Some(password) => Some(hash_password(state.hasher, password).await?),
		None => None,
	};

	let user = state
		.stores
		.users
		.update_user(
			me.id,
			UserChanges {
				name: input.name,
				email: input.email,
				status: input.status,
				password_hash,
			},
		)
		.await?
		.ok_or_else(|| ApiError::not_found("User not found"))?;

	info!(user_id = %user.id, "http: user updated");
	Ok(json_response(StatusCode::OK, &user))
}

pub(super) async fn delete(req: Request<Incoming>, state: &ApiState, id: i64) -> Result<HttpResponse, ApiError> {
	let me = current_user(req.headers(), state).await?;
	if me.id.get() != id {
		return Err(ApiError::forbidden("Not allowed to delete another user"));
	}

	if !state.stores.users.delete_user(me.id).await? {
		return Err(ApiError::not_found("User not found"));
	}

	info!(user_id = %me.id, "http: user deleted");
	Ok(json_response(
		StatusCode::OK,
		&serde_json::json!({ "message": "User deleted successfully" }),
	))
}
