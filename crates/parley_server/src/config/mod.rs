#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_protocol::DEFAULT_MAX_MESSAGE_BYTES;
use parley_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::session::DEFAULT_HANDSHAKE_TIMEOUT;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_WS_BIND: &str = "ws://127.0.0.1:8001";
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_ACCESS_TOKEN_TTL_MINUTES: u64 = 60;
const DEFAULT_BCRYPT_COST: u32 = 12;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML at `path` (missing file = defaults) and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP API + health bind address (host:port).
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Per-session outbound queue size.
	pub outbound_queue_capacity: usize,
	/// Largest accepted WebSocket message.
	pub max_message_bytes: usize,
	/// Time a new TCP connection gets to complete the WebSocket upgrade.
	pub handshake_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			http_bind: DEFAULT_HTTP_BIND.to_string(),
			metrics_bind: None,
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HS256 signing secret for access tokens.
	pub jwt_secret: Option<SecretString>,
	pub access_token_ttl: Duration,
	pub bcrypt_cost: u32,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			jwt_secret: None,
			access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_MINUTES * 60),
			bcrypt_cost: DEFAULT_BCRYPT_COST,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:` or `postgres:` URL; `None` keeps everything in memory.
	pub database_url: Option<String>,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			max_connections: DEFAULT_DB_MAX_CONNECTIONS,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	outbound_queue_capacity: Option<usize>,
	max_message_bytes: Option<usize>,
	handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	jwt_secret: Option<String>,
	access_token_ttl_minutes: Option<u64>,
	bcrypt_cost: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	max_connections: Option<u32>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let auth_defaults = AuthSettings::default();
		let persistence_defaults = PersistenceSettings::default();

		Self {
			server: ServerSettings {
				http_bind: non_empty(file.server.http_bind).unwrap_or(server_defaults.http_bind),
				metrics_bind: non_empty(file.server.metrics_bind),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.outbound_queue_capacity),
				max_message_bytes: file
					.server
					.max_message_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_message_bytes),
				handshake_timeout: file
					.server
					.handshake_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.handshake_timeout),
			},
			auth: AuthSettings {
				jwt_secret: non_empty(file.auth.jwt_secret).map(SecretString::new),
				access_token_ttl: file
					.auth
					.access_token_ttl_minutes
					.filter(|v| *v > 0)
					.map(|m| Duration::from_secs(m * 60))
					.unwrap_or(auth_defaults.access_token_ttl),
				bcrypt_cost: file.auth.bcrypt_cost.unwrap_or(auth_defaults.bcrypt_cost),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(persistence_defaults.max_connections),
			},
		}
	}

	/// Clamp out-of-range values and warn about settings that disable features.
	fn validate(&mut self) {
		if !(4..=31).contains(&self.auth.bcrypt_cost) {
			warn!(
				bcrypt_cost = self.auth.bcrypt_cost,
				"auth config: bcrypt_cost out of range (4..=31); using default"
			);
			self.auth.bcrypt_cost = DEFAULT_BCRYPT_COST;
		}

		if self.auth.jwt_secret.is_none() {
			warn!("auth config: no jwt_secret configured; every token will be rejected");
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// First non-empty value among `keys`, trimmed.
fn first_env(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
	keys.iter().find_map(|k| non_empty(lookup(k)))
}

fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(v) = first_env(&lookup, &["PARLEY_HTTP_BIND"]) {
		cfg.server.http_bind = v;
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_METRICS_BIND"]) {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_OUTBOUND_QUEUE_CAPACITY"])
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_MAX_MESSAGE_BYTES"])
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_message_bytes = bytes;
		info!(bytes, "server config: max_message_bytes overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_JWT_SECRET", "SECRET_KEY"]) {
		cfg.auth.jwt_secret = Some(SecretString::new(v));
		info!("auth config: jwt_secret overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_ACCESS_TOKEN_TTL_MINUTES", "ACCESS_TOKEN_EXPIRE_MINUTES"])
		&& let Ok(minutes) = v.parse::<u64>()
		&& minutes > 0
	{
		cfg.auth.access_token_ttl = Duration::from_secs(minutes * 60);
		info!(minutes, "auth config: access_token_ttl overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_BCRYPT_COST"])
		&& let Ok(cost) = v.parse::<u32>()
	{
		cfg.auth.bcrypt_cost = cost;
		info!(cost, "auth config: bcrypt_cost overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_DATABASE_URL", "DATABASE_URL"]) {
		cfg.persistence.database_url = Some(v);
		info!("persistence config: database_url overridden by env");
	}

	if let Some(v) = first_env(&lookup, &["PARLEY_DB_MAX_CONNECTIONS"])
		&& let Ok(max) = v.parse::<u32>()
		&& max > 0
	{
		cfg.persistence.max_connections = max;
		info!(max, "persistence config: max_connections overridden by env");
	}

	cfg.validate();
}
