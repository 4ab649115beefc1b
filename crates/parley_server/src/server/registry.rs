#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use parley_domain::{ChatMessage, ConnectionId, RoomId, UserId};

/// Outbound handle of one live chat stream.
pub type Sink = mpsc::Sender<Arc<ChatMessage>>;

/// Configuration for `ConnectionRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Queue depth of sinks created by `attach`.
	pub sink_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			sink_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Process-local map of live chat streams.
///
/// Keeps `room -> connections` and `user -> rooms` consistent under one lock.
/// The lock is never held while writing to a sink: `deliver` snapshots the
/// room, releases, then writes with `try_send`.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<Inner>>,
	cfg: RegistryConfig,
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, Vec<Entry>>,
	user_rooms: HashMap<UserId, HashSet<RoomId>>,
}

#[derive(Debug, Clone)]
struct Entry {
	user: UserId,
	conn: ConnectionId,
	sink: Sink,
}

impl ConnectionRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a sink. Dropping the returned guard unregisters it.
	pub fn register(&self, user: UserId, room: RoomId, conn: ConnectionId, sink: Sink) -> RegistrationGuard {
		let live = {
			let mut inner = self.inner.lock();
			let entries = inner.rooms.entry(room).or_default();
			entries.push(Entry { user, conn, sink });
			let live = entries.len();
			inner.user_rooms.entry(user).or_default().insert(room);
			live
		};

		metrics::gauge!("parley_server_registry_connections").increment(1.0);
		if self.cfg.debug_logs {
			debug!(%user, %room, connection_id = %conn, live, "registry: registered");
		}

		RegistrationGuard {
			registry: self.clone(),
			user,
			room,
			conn,
		}
	}

	/// Create a bounded sink, register it, and hand back the receiving half.
	pub fn attach(
		&self,
		user: UserId,
		room: RoomId,
		conn: ConnectionId,
	) -> (RegistrationGuard, mpsc::Receiver<Arc<ChatMessage>>) {
		let (tx, rx) = mpsc::channel(self.cfg.sink_queue_capacity.max(1));
		(self.register(user, room, conn, tx), rx)
	}

	/// Remove every entry of `conn`. Idempotent; entries of other connections are untouched.
	pub fn unregister(&self, user: UserId, conn: ConnectionId) {
		let removed = {
			let mut inner = self.inner.lock();
			let Some(rooms) = inner.user_rooms.remove(&user) else {
				return;
			};

			let mut removed = 0usize;
			let mut still_held = HashSet::new();
			for room in rooms {
				let Some(entries) = inner.rooms.get_mut(&room) else {
					continue;
				};

				let before = entries.len();
				entries.retain(|e| e.conn != conn);
				removed += before - entries.len();

				if entries.is_empty() {
					inner.rooms.remove(&room);
				} else if entries.iter().any(|e| e.user == user) {
					// the user is still in this room through another stream
					still_held.insert(room);
				}
			}

			if !still_held.is_empty() {
				inner.user_rooms.insert(user, still_held);
			}
			removed
		};

		if removed > 0 {
			metrics::gauge!("parley_server_registry_connections").decrement(removed as f64);
		}
		if self.cfg.debug_logs {
			debug!(%user, connection_id = %conn, removed, "registry: unregistered");
		}
	}

	/// Write `msg` to every sink in `room` except `exclude`. Returns the number of sinks written.
	///
	/// A full or closed sink is skipped; the others still receive the message.
	pub fn deliver(&self, room: RoomId, exclude: Option<ConnectionId>, msg: Arc<ChatMessage>) -> usize {
		let targets: Vec<(ConnectionId, Sink)> = {
			let inner = self.inner.lock();
			let Some(entries) = inner.rooms.get(&room) else {
				return 0;
			};
			entries
				.iter()
				.filter(|e| Some(e.conn) != exclude)
				.map(|e| (e.conn, e.sink.clone()))
				.collect()
		};

		let mut delivered = 0usize;
		let mut dropped = 0usize;
		for (conn, sink) in targets {
			match sink.try_send(msg.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped += 1;
					if self.cfg.debug_logs {
						debug!(%room, connection_id = %conn, "registry: sink full, message dropped");
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		metrics::counter!("parley_server_registry_delivered_total").increment(delivered as u64);
		if dropped > 0 {
			metrics::counter!("parley_server_registry_dropped_total").increment(dropped as u64);
			debug!(%room, dropped, "registry: dropped due to full sink queues");
		}

		delivered
	}

	/// Live connections in `room`.
	pub fn room_connection_count(&self, room: RoomId) -> usize {
		self.inner.lock().rooms.get(&room).map(Vec::len).unwrap_or(0)
	}

	/// Rooms `user` currently holds a live connection in.
	pub fn rooms_for_user(&self, user: UserId) -> Vec<RoomId> {
		let inner = self.inner.lock();
		let mut rooms: Vec<RoomId> = inner
			.user_rooms
			.get(&user)
			.map(|set| set.iter().copied().collect())
			.unwrap_or_default();
		rooms.sort();
		rooms
	}

	/// Number of rooms with at least one live connection.
	pub fn active_rooms(&self) -> usize {
		self.inner.lock().rooms.len()
	}

	/// Check that both maps describe the same set of (user, room) pairs.
	#[cfg(test)]
	pub(crate) fn check_consistency(&self) -> Result<(), String> {
		let inner = self.inner.lock();

		let mut from_rooms: HashSet<(UserId, RoomId)> = HashSet::new();
		for (room, entries) in &inner.rooms {
			if entries.is_empty() {
				return Err(format!("room {room} kept with no entries"));
			}
			from_rooms.extend(entries.iter().map(|e| (e.user, *room)));
		}

		let mut from_users: HashSet<(UserId, RoomId)> = HashSet::new();
		for (user, rooms) in &inner.user_rooms {
			if rooms.is_empty() {
				return Err(format!("user {user} kept with no rooms"));
			}
			from_users.extend(rooms.iter().map(|r| (*user, *r)));
		}

		if from_rooms != from_users {
			return Err(format!("maps disagree: rooms={from_rooms:?} users={from_users:?}"));
		}
		Ok(())
	}
}

/// Unregisters its connection on drop.
#[derive(Debug)]
pub struct RegistrationGuard {
	registry: ConnectionRegistry,
	user: UserId,
	room: RoomId,
	conn: ConnectionId,
}

impl RegistrationGuard {
	pub fn connection_id(&self) -> ConnectionId {
		self.conn
	}

	pub fn room(&self) -> RoomId {
		self.room
	}

	pub fn user(&self) -> UserId {
		self.user
	}
}

impl Drop for RegistrationGuard {
	fn drop(&mut self) {
		self.registry.unregister(self.user, self.conn);
	}
}
