#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BrokerKind, ServerConfig};
use crate::server::bus::{Broker, BusConfig, FanoutBus, MemoryBroker, PgBroker};
use crate::server::chat::ChatOrchestrator;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::identity::IdentityService;
use crate::server::membership::MembershipService;
use crate::server::registry::{ConnectionRegistry, RegistryConfig};
use crate::server::token::TokenCodec;
use crate::store::{ChatStore, SqlStore, UserStore};

/// Storage, broker and codec handles one server instance is built from.
pub struct AppParts {
	pub users: Arc<dyn UserStore>,
	pub chats: Arc<dyn ChatStore>,
	pub broker: Arc<dyn Broker>,
	pub tokens: TokenCodec,
	pub registry: RegistryConfig,
	pub bus: BusConfig,
	pub connection: ConnectionSettings,
}

/// A wired server instance: services, registry and the running bus subscriber.
pub struct App {
	chat: ChatOrchestrator,
	settings: ConnectionSettings,
	subscriber: JoinHandle<()>,
}

impl App {
	/// Connect storage and broker described by `cfg`.
	pub async fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let secret = cfg
			.auth
			.token_secret
			.as_ref()
			.ok_or_else(|| anyhow!("auth.token_secret is required"))?;
		let tokens = TokenCodec::new(secret.expose(), cfg.auth.token_validity).context("build token codec")?;

		let store = Arc::new(SqlStore::connect(&cfg.database.url).await?);
		info!(backend = store.backend_name(), "database ready");

		let broker: Arc<dyn Broker> = match cfg.broker.kind {
			BrokerKind::Memory => {
				info!("broker: in-process (single instance)");
				Arc::new(MemoryBroker::default())
			}
			BrokerKind::Postgres => {
				let url = cfg.broker.effective_url(&cfg.database);
				let broker = match store.pg_pool() {
					Some(pool) if url == cfg.database.url => PgBroker::new(pool.clone(), &cfg.broker.channel)?,
					_ => PgBroker::connect(url, &cfg.broker.channel).await?,
				};
				info!(channel = %cfg.broker.channel, "broker: postgres LISTEN/NOTIFY");
				Arc::new(broker)
			}
		};

		Self::assemble(AppParts {
			users: store.clone(),
			chats: store,
			broker,
			tokens,
			registry: RegistryConfig {
				sink_queue_capacity: cfg.server.sink_queue_capacity,
				debug_logs: cfg.server.debug_registry,
			},
			bus: BusConfig {
				publish_attempts: cfg.broker.publish_attempts,
				retry_backoff: cfg.broker.retry_backoff,
				debug_log_records: cfg.server.debug_registry,
			},
			connection: ConnectionSettings {
				max_frame_bytes: cfg.server.max_frame_bytes,
				sink_queue_capacity: cfg.server.sink_queue_capacity,
			},
		})
		.await
	}

	/// Wire services over `parts` and start the bus subscriber.
	pub async fn assemble(parts: AppParts) -> anyhow::Result<Self> {
		let registry = ConnectionRegistry::new(parts.registry);
		let bus = FanoutBus::new(parts.broker, parts.bus);
		let subscriber = bus
			.spawn_registry_subscriber(registry.clone())
			.await
			.context("start bus subscriber")?;

		let identity = IdentityService::new(parts.users.clone(), parts.tokens.clone());
		let membership = MembershipService::new(parts.chats.clone(), parts.users);
		let chat = ChatOrchestrator::new(identity, membership, parts.chats, parts.tokens, registry, bus);

		Ok(Self {
			chat,
			settings: parts.connection,
			subscriber,
		})
	}

	pub fn chat(&self) -> &ChatOrchestrator {
		&self.chat
	}

	/// Accept QUIC connections until the endpoint closes.
	pub async fn serve(&self, endpoint: quinn::Endpoint) -> anyhow::Result<()> {
		let mut next_conn_id: u64 = 1;

		while let Some(incoming) = endpoint.accept().await {
			let conn_id = next_conn_id;
			next_conn_id += 1;
			metrics::counter!("parley_server_connections_total").increment(1);

			let chat = self.chat.clone();
			let settings = self.settings.clone();
			tokio::spawn(async move {
				match incoming.await {
					Ok(connection) => {
						info!(conn_id, remote = %connection.remote_address(), "accepted connection");
						if let Err(e) = handle_connection(conn_id, connection, chat, settings).await {
							warn!(conn_id, error = %e, "connection handler exited with error");
						}
					}
					Err(e) => {
						warn!(conn_id, error = %e, "failed to establish QUIC connection");
					}
				}
			});
		}

		Ok(())
	}
}

impl Drop for App {
	fn drop(&mut self) {
		self.subscriber.abort();
	}
}
