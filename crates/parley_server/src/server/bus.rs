#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_domain::{ChatMessage, ConnectionId};

use crate::server::registry::ConnectionRegistry;

/// One record on the broker: key is the origin connection id, value the serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
	pub key: String,
	pub value: Vec<u8>,
}

/// Receiving side of a broker subscription.
pub type BusSubscription = broadcast::Receiver<BusRecord>;

/// Publish/subscribe transport shared by every server instance.
///
/// Every subscriber sees every record, including records its own instance published.
#[async_trait]
pub trait Broker: Send + Sync {
	async fn publish(&self, record: BusRecord) -> anyhow::Result<()>;

	async fn subscribe(&self) -> anyhow::Result<BusSubscription>;
}

/// In-process broker. Clones share one channel, so several server instances in
/// one process behave like a cluster.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
	tx: broadcast::Sender<BusRecord>,
}

impl MemoryBroker {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity.max(1));
		Self { tx }
	}
}

impl Default for MemoryBroker {
	fn default() -> Self {
		Self::new(4096)
	}
}

#[async_trait]
impl Broker for MemoryBroker {
	async fn publish(&self, record: BusRecord) -> anyhow::Result<()> {
		// no subscribers is not an error: nobody is listening yet
		let _ = self.tx.send(record);
		Ok(())
	}

	async fn subscribe(&self) -> anyhow::Result<BusSubscription> {
		Ok(self.tx.subscribe())
	}
}

/// NOTIFY payload. `value` is base64 so arbitrary bytes survive the text channel.
#[derive(Debug, Serialize, Deserialize)]
struct NotifyPayload {
	key: String,
	value: String,
}

pub(crate) fn encode_notify_payload(record: &BusRecord) -> anyhow::Result<String> {
	serde_json::to_string(&NotifyPayload {
		key: record.key.clone(),
		value: STANDARD.encode(&record.value),
	})
	.context("serialize notify payload")
}

pub(crate) fn decode_notify_payload(payload: &str) -> anyhow::Result<BusRecord> {
	let p: NotifyPayload = serde_json::from_str(payload).context("parse notify payload")?;
	let value = STANDARD.decode(p.value).context("decode notify value")?;
	Ok(BusRecord { key: p.key, value })
}

/// PostgreSQL LISTEN/NOTIFY broker.
///
/// NOTIFY payloads are capped by the server (8000 bytes by default); larger
/// messages fail to publish and are only persisted.
#[derive(Debug, Clone)]
pub struct PgBroker {
	pool: sqlx::PgPool,
	channel: String,
	fanout_capacity: usize,
}

impl PgBroker {
	pub async fn connect(url: &str, channel: &str) -> anyhow::Result<Self> {
		let pool = sqlx::PgPool::connect(url).await.context("connect postgres broker")?;
		Self::new(pool, channel)
	}

	pub fn new(pool: sqlx::PgPool, channel: &str) -> anyhow::Result<Self> {
		if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
			return Err(anyhow!("broker channel must be [A-Za-z0-9_]+, got {channel:?}"));
		}
		Ok(Self {
			pool,
			channel: channel.to_string(),
			fanout_capacity: 4096,
		})
	}
}

#[async_trait]
impl Broker for PgBroker {
	async fn publish(&self, record: BusRecord) -> anyhow::Result<()> {
		let payload = encode_notify_payload(&record)?;
		sqlx::query("SELECT pg_notify($1, $2)")
			.bind(&self.channel)
			.bind(payload)
			.execute(&self.pool)
			.await
			.context("pg_notify")?;
		Ok(())
	}

	async fn subscribe(&self) -> anyhow::Result<BusSubscription> {
		let mut listener = PgListener::connect_with(&self.pool)
			.await
			.context("connect pg listener")?;
		listener
			.listen(&self.channel)
			.await
			.with_context(|| format!("LISTEN {}", self.channel))?;

		let (tx, rx) = broadcast::channel(self.fanout_capacity);
		let channel = self.channel.clone();

		tokio::spawn(async move {
			info!(%channel, "pg broker: listening");
			loop {
				match listener.recv().await {
					Ok(n) => match decode_notify_payload(n.payload()) {
						Ok(record) => {
							if tx.send(record).is_err() {
								break;
							}
						}
						Err(e) => {
							warn!(%channel, error = %e, "pg broker: skipping malformed notification");
						}
					},
					Err(e) => {
						// the listener reconnects on the next recv
						warn!(%channel, error = %e, "pg broker: listener error");
						tokio::time::sleep(Duration::from_millis(500)).await;
					}
				}
			}
			info!(%channel, "pg broker: listener stopped (no subscribers)");
		});

		Ok(rx)
	}
}

/// Publish settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
	/// Total attempts per publish (>= 1).
	pub publish_attempts: u32,
	/// Backoff unit; attempt `n` waits `n * retry_backoff`.
	pub retry_backoff: Duration,
	pub debug_log_records: bool,
}

impl Default for BusConfig {
	fn default() -> Self {
		Self {
			publish_attempts: 3,
			retry_backoff: Duration::from_millis(50),
			debug_log_records: false,
		}
	}
}

/// A decoded bus record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusDelivery {
	pub correlation_id: String,
	pub message: ChatMessage,
}

impl BusDelivery {
	/// The origin connection, if the key is a connection id this process could hold.
	pub fn origin(&self) -> Option<ConnectionId> {
		self.correlation_id.parse().ok()
	}
}

/// Serializes chat messages onto a `Broker` and feeds broker records back into the registry.
#[derive(Clone)]
pub struct FanoutBus {
	broker: Arc<dyn Broker>,
	cfg: BusConfig,
}

impl std::fmt::Debug for FanoutBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FanoutBus").field("cfg", &self.cfg).finish()
	}
}

impl FanoutBus {
	pub fn new(broker: Arc<dyn Broker>, cfg: BusConfig) -> Self {
		Self { broker, cfg }
	}

	/// Publish `msg` keyed by `correlation_id`, retrying up to `publish_attempts` times.
	pub async fn publish(&self, correlation_id: ConnectionId, msg: &ChatMessage) -> anyhow::Result<()> {
		let record = BusRecord {
			key: correlation_id.to_string(),
			value: serde_json::to_vec(msg).context("serialize chat message")?,
		};

		let attempts = self.cfg.publish_attempts.max(1);
		let mut attempt = 0u32;
		loop {
			attempt += 1;
			match self.broker.publish(record.clone()).await {
				Ok(()) => {
					metrics::counter!("parley_server_bus_published_total").increment(1);
					return Ok(());
				}
				Err(e) if attempt < attempts => {
					warn!(
						attempt,
						attempts,
						connection_id = %correlation_id,
						error = %e,
						"bus: publish failed; retrying"
					);
					tokio::time::sleep(self.cfg.retry_backoff * attempt).await;
				}
				Err(e) => {
					metrics::counter!("parley_server_bus_publish_failures_total").increment(1);
					return Err(e.context(format!("publish failed after {attempt} attempts")));
				}
			}
		}
	}

	/// Start a background loop passing every decodable record to `on_message`.
	pub async fn subscribe<F>(&self, on_message: F) -> anyhow::Result<JoinHandle<()>>
	where
		F: Fn(BusDelivery) + Send + 'static,
	{
		let rx = self.broker.subscribe().await.context("subscribe to broker")?;
		let debug_log_records = self.cfg.debug_log_records;
		Ok(tokio::spawn(run_subscriber(rx, on_message, debug_log_records)))
	}

	/// Subscribe and deliver every record into `registry`, skipping the origin connection.
	pub async fn spawn_registry_subscriber(&self, registry: ConnectionRegistry) -> anyhow::Result<JoinHandle<()>> {
		self.subscribe(move |delivery| {
			let origin = delivery.origin();
			let room = delivery.message.chat_id;
			registry.deliver(room, origin, Arc::new(delivery.message));
		})
		.await
	}
}

/// Decode a record value. Fails on anything that is not a serialized `ChatMessage`.
pub fn decode_record(record: BusRecord) -> anyhow::Result<BusDelivery> {
	let message: ChatMessage = serde_json::from_slice(&record.value).context("decode chat message")?;
	Ok(BusDelivery {
		correlation_id: record.key,
		message,
	})
}

async fn run_subscriber<F>(mut rx: BusSubscription, on_message: F, debug_log_records: bool)
where
	F: Fn(BusDelivery),
{
	info!("bus subscriber started");

	loop {
		let record = match rx.recv().await {
			Ok(r) => r,
			Err(broadcast::error::RecvError::Lagged(n)) => {
				warn!(lagged = n, "bus subscriber lagged; some records were skipped");
				metrics::counter!("parley_server_bus_lagged_total").increment(n);
				continue;
			}
			Err(broadcast::error::RecvError::Closed) => {
				info!("bus subscriber exiting (broker closed)");
				break;
			}
		};

		let key = record.key.clone();
		let delivery = match decode_record(record) {
			Ok(d) => d,
			Err(e) => {
				warn!(key = %key, error = %format!("{e:#}"), "bus: skipping malformed record");
				metrics::counter!("parley_server_bus_malformed_total").increment(1);
				continue;
			}
		};

		if debug_log_records {
			debug!(
				key = %delivery.correlation_id,
				chat_id = %delivery.message.chat_id,
				"bus: record received"
			);
		}

		on_message(delivery);
	}
}
