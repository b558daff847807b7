#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::info;

use crate::config::ServerConfig;
use crate::server::auth::JwtAuthority;
use crate::server::health::HealthState;
use crate::server::http::ApiState;
use crate::server::password::PasswordHasher;
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{SessionContext, SessionSettings};
use crate::server::store::Stores;

/// Process-wide collaborators shared by the WebSocket and HTTP sides.
#[derive(Clone)]
pub struct Services {
	pub registry: ConnectionRegistry,
	pub stores: Stores,
	pub tokens: Arc<JwtAuthority>,
	pub hasher: PasswordHasher,
	pub health: HealthState,
	pub session_settings: SessionSettings,
}

impl Services {
	pub fn new(stores: Stores, tokens: JwtAuthority, hasher: PasswordHasher, session_settings: SessionSettings) -> Self {
		Self {
			registry: ConnectionRegistry::new(),
			stores,
			tokens: Arc::new(tokens),
			hasher,
			health: HealthState::new(),
			session_settings,
		}
	}

	/// Open the configured store and build every shared component.
	pub async fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let stores = Stores::open(
			cfg.persistence.database_url.as_deref(),
			cfg.persistence.max_connections,
		)
		.await?;
		if cfg.persistence.database_url.is_none() {
			info!("persistence: no database_url configured, using in-memory store");
		}

		let tokens = JwtAuthority::new(cfg.auth.jwt_secret.clone(), cfg.auth.access_token_ttl);
		let settings = SessionSettings {
			outbound_queue_capacity: cfg.server.outbound_queue_capacity,
			max_message_bytes: cfg.server.max_message_bytes,
			handshake_timeout: cfg.server.handshake_timeout,
		};

		Ok(Self::new(stores, tokens, PasswordHasher::new(cfg.auth.bcrypt_cost), settings))
	}

	pub fn session_context(&self) -> SessionContext {
		SessionContext {
			registry: self.registry.clone(),
			messages: self.stores.messages.clone(),
			verifier: self.tokens.clone(),
			settings: self.session_settings.clone(),
		}
	}

	pub fn api_state(&self) -> ApiState {
		ApiState {
			stores: self.stores.clone(),
			tokens: self.tokens.clone(),
			hasher: self.hasher,
			health: self.health.clone(),
		}
	}
}
