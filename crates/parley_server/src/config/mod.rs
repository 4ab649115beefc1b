#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use serde::Deserialize;
use tracing::{info, warn};

use parley_protocol::DEFAULT_MAX_FRAME_SIZE;
use parley_util::env::{parse_bool, var_nonempty};

/// Default token validity window.
pub const DEFAULT_TOKEN_VALIDITY_HOURS: u64 = 72;
/// Upper bound for `auth.token_validity_hours` (ten years).
pub const MAX_TOKEN_VALIDITY_HOURS: u64 = 10 * 365 * 24;
pub const DEFAULT_SINK_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_BROKER_CHANNEL: &str = "parley_messages";
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Hours to a `Duration`; values past `u64::MAX` seconds saturate and are caught by `validate`.
fn validity_hours(hours: u64) -> Duration {
	Duration::from_secs(hours.checked_mul(3600).unwrap_or(u64::MAX))
}

/// Load config from a TOML file (missing file means defaults), then apply `PARLEY_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| var_nonempty(key));
	cfg.validate()?;

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub database: DatabaseSettings,
	pub broker: BrokerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS. Dev cert when unset.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	pub max_frame_bytes: usize,
	/// Outbound queue depth per live chat connection.
	pub sink_queue_capacity: usize,
	/// Verbose per-delivery registry logs.
	pub debug_registry: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			sink_queue_capacity: DEFAULT_SINK_QUEUE_CAPACITY,
			debug_registry: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for session tokens. Required.
	pub token_secret: Option<SecretString>,
	pub token_validity: Duration,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			token_secret: None,
			token_validity: Duration::from_secs(DEFAULT_TOKEN_VALIDITY_HOURS * 3600),
		}
	}
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
	/// `sqlite:` or `postgres:` URL.
	pub url: String,
}

impl Default for DatabaseSettings {
	fn default() -> Self {
		Self {
			url: DEFAULT_DATABASE_URL.to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerKind {
	/// In-process broadcast; single instance only.
	#[default]
	Memory,
	/// PostgreSQL LISTEN/NOTIFY.
	Postgres,
}

impl FromStr for BrokerKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"memory" => Ok(BrokerKind::Memory),
			"postgres" | "postgresql" => Ok(BrokerKind::Postgres),
			other => Err(anyhow!("unknown broker kind {other:?} (expected memory|postgres)")),
		}
	}
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
	pub kind: BrokerKind,
	/// Broker connection URL. Falls back to `database.url` for postgres.
	pub url: Option<String>,
	pub channel: String,
	/// Total publish attempts per message (>= 1).
	pub publish_attempts: u32,
	pub retry_backoff: Duration,
}

impl Default for BrokerSettings {
	fn default() -> Self {
		Self {
			kind: BrokerKind::Memory,
			url: None,
			channel: DEFAULT_BROKER_CHANNEL.to_string(),
			publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
			retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
		}
	}
}

impl BrokerSettings {
	/// Effective broker URL for postgres.
	pub fn effective_url<'a>(&'a self, database: &'a DatabaseSettings) -> &'a str {
		self.url.as_deref().unwrap_or(&database.url)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	auth: FileAuthSettings,
	#[serde(default)]
	database: FileDatabaseSettings,
	#[serde(default)]
	broker: FileBrokerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	sink_queue_capacity: Option<usize>,
	debug_registry: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	token_secret: Option<String>,
	token_validity_hours: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDatabaseSettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBrokerSettings {
	kind: Option<String>,
	url: Option<String>,
	channel: Option<String>,
	publish_attempts: Option<u32>,
	retry_backoff_ms: Option<u64>,
}

fn nonempty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerConfig::default();

		let kind = match nonempty(file.broker.kind) {
			Some(k) => k.parse::<BrokerKind>().context("broker.kind")?,
			None => defaults.broker.kind,
		};

		Ok(Self {
			server: ServerSettings {
				tls_cert_path: nonempty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: nonempty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: nonempty(file.server.metrics_bind),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.server.max_frame_bytes),
				sink_queue_capacity: file
					.server
					.sink_queue_capacity
					.unwrap_or(defaults.server.sink_queue_capacity),
				debug_registry: file.server.debug_registry.unwrap_or(false),
			},
			auth: AuthSettings {
				token_secret: nonempty(file.auth.token_secret).map(SecretString::new),
				token_validity: file
					.auth
					.token_validity_hours
					.map(validity_hours)
					.unwrap_or(defaults.auth.token_validity),
			},
			database: DatabaseSettings {
				url: nonempty(file.database.url).unwrap_or(defaults.database.url),
			},
			broker: BrokerSettings {
				kind,
				url: nonempty(file.broker.url),
				channel: nonempty(file.broker.channel).unwrap_or(defaults.broker.channel),
				publish_attempts: file.broker.publish_attempts.unwrap_or(defaults.broker.publish_attempts),
				retry_backoff: file
					.broker
					.retry_backoff_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.broker.retry_backoff),
			},
		})
	}

	/// Reject configurations the server cannot start with.
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.auth.token_secret.is_none() {
			bail!("auth.token_secret is required (or set PARLEY_AUTH_TOKEN_SECRET)");
		}
		if self.auth.token_validity.is_zero() {
			bail!("auth.token_validity_hours must be > 0");
		}
		if self.auth.token_validity > validity_hours(MAX_TOKEN_VALIDITY_HOURS) {
			bail!("auth.token_validity_hours must be <= {MAX_TOKEN_VALIDITY_HOURS}");
		}
		if self.server.sink_queue_capacity == 0 {
			bail!("server.sink_queue_capacity must be > 0");
		}
		if self.broker.publish_attempts == 0 {
			bail!("broker.publish_attempts must be >= 1");
		}
		if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
			bail!("server.tls_cert_path and server.tls_key_path must be set together");
		}
		if self.broker.kind == BrokerKind::Postgres && !self.broker.effective_url(&self.database).starts_with("postgres")
		{
			bail!("broker.kind = postgres needs a postgres:// url (broker.url or database.url)");
		}
		Ok(())
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

/// Apply `PARLEY_*` overrides. `lookup` returns non-empty values only.
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(v) = lookup("PARLEY_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v.trim()));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = lookup("PARLEY_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v.trim()));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = lookup("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v.trim().to_string());
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = lookup("PARLEY_SINK_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.sink_queue_capacity = capacity;
		info!(capacity, "server config: sink_queue_capacity overridden by env");
	}

	if let Some(v) = lookup("PARLEY_AUTH_TOKEN_SECRET") {
		cfg.auth.token_secret = Some(SecretString::new(v.trim()));
		info!("auth config: token_secret overridden by env");
	}

	if let Some(v) = lookup("PARLEY_AUTH_TOKEN_VALIDITY_HOURS")
		&& let Ok(hours) = v.trim().parse::<u64>()
	{
		cfg.auth.token_validity = validity_hours(hours);
		info!(hours, "auth config: token_validity overridden by env");
	}

	if let Some(v) = lookup("PARLEY_DATABASE_URL") {
		cfg.database.url = v.trim().to_string();
		info!("database config: url overridden by env");
	}

	if let Some(v) = lookup("PARLEY_BROKER_KIND") {
		match v.parse::<BrokerKind>() {
			Ok(kind) => {
				cfg.broker.kind = kind;
				info!(?kind, "broker config: kind overridden by env");
			}
			Err(e) => warn!(error = %e, "broker config: ignoring PARLEY_BROKER_KIND"),
		}
	}

	if let Some(v) = lookup("PARLEY_BROKER_URL") {
		cfg.broker.url = Some(v.trim().to_string());
		info!("broker config: url overridden by env");
	}

	if let Some(v) = lookup("PARLEY_BROKER_CHANNEL") {
		cfg.broker.channel = v.trim().to_string();
		info!(channel = %cfg.broker.channel, "broker config: channel overridden by env");
	}

	if let Some(v) = lookup("PARLEY_BROKER_PUBLISH_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
	{
		cfg.broker.publish_attempts = attempts;
		info!(attempts, "broker config: publish_attempts overridden by env");
	}

	if let Some(v) = lookup("PARLEY_DEBUG_REGISTRY")
		&& let Some(enabled) = parse_bool(&v)
	{
		cfg.server.debug_registry = enabled;
		info!(enabled, "server config: debug_registry overridden by env");
	}
}

#[cfg(test)]
mod config_tests;
