#![forbid(unsafe_code)]

//! Relational storage for users, chats, memberships and messages.
//!
//! Services depend on the `UserStore`/`ChatStore` traits only. `SqlStore` backs
//! production (sqlite or postgres); `MemoryStore` backs tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use parley_domain::{ChatMessage, ChatName, Login, Membership, Role, RoomId, UserId};

pub mod sql;

pub use sql::SqlStore;

/// Stored user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub id: UserId,
	pub login: String,
	pub password_hash: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
	/// Insert a user. `None` when the login is taken.
	async fn create_user(&self, login: &Login, password_hash: &str) -> anyhow::Result<Option<UserId>>;

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserRecord>>;

	async fn user_by_id(&self, id: UserId) -> anyhow::Result<Option<UserRecord>>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
	/// Create a chat and its owner membership atomically. `None` when the name is taken.
	async fn create_chat_with_owner(&self, name: &ChatName, owner: UserId) -> anyhow::Result<Option<RoomId>>;

	/// Members of a chat. `None` when the chat does not exist.
	async fn chat_members(&self, chat: RoomId) -> anyhow::Result<Option<Vec<Membership>>>;

	/// Add a membership. `false` when the user was already a member.
	async fn add_member(&self, chat: RoomId, user: UserId, role: Role) -> anyhow::Result<bool>;

	async fn save_message(&self, msg: &ChatMessage) -> anyhow::Result<()>;

	/// Latest `limit` messages of a chat, oldest first.
	///
	/// Read-back accessor for tests and tooling. No RPC serves history.
	async fn recent_messages(&self, chat: RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;
}

/// In-process store with the same semantics as `SqlStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
	fail_message_writes: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryInner {
	users: Vec<UserRecord>,
	chats: HashMap<RoomId, MemoryChat>,
	messages: Vec<ChatMessage>,
	next_chat_id: i64,
}

#[derive(Debug)]
struct MemoryChat {
	name: String,
	members: Vec<Membership>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make every subsequent `save_message` fail.
	pub fn set_fail_message_writes(&self, fail: bool) {
		self.fail_message_writes.store(fail, Ordering::SeqCst);
	}
}

#[async_trait]
impl UserStore for MemoryStore {
	async fn create_user(&self, login: &Login, password_hash: &str) -> anyhow::Result<Option<UserId>> {
		let mut inner = self.inner.lock();
		if inner.users.iter().any(|u| u.login == login.as_str()) {
			return Ok(None);
		}
		let id = UserId(inner.users.len() as i64 + 1);
		inner.users.push(UserRecord {
			id,
			login: login.as_str().to_string(),
			password_hash: password_hash.to_string(),
		});
		Ok(Some(id))
	}

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserRecord>> {
		Ok(self.inner.lock().users.iter().find(|u| u.login == login).cloned())
	}

	async fn user_by_id(&self, id: UserId) -> anyhow::Result<Option<UserRecord>> {
		Ok(self.inner.lock().users.iter().find(|u| u.id == id).cloned())
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn create_chat_with_owner(&self, name: &ChatName, owner: UserId) -> anyhow::Result<Option<RoomId>> {
		let mut inner = self.inner.lock();
		if inner.chats.values().any(|c| c.name == name.as_str()) {
			return Ok(None);
		}
		if !inner.users.iter().any(|u| u.id == owner) {
			return Err(anyhow!("owner {owner} does not exist"));
		}

		inner.next_chat_id += 1;
		let id = RoomId(inner.next_chat_id);
		inner.chats.insert(
			id,
			MemoryChat {
				name: name.as_str().to_string(),
				members: vec![Membership {
					user_id: owner,
					role: Role::Owner,
				}],
			},
		);
		Ok(Some(id))
	}

	async fn chat_members(&self, chat: RoomId) -> anyhow::Result<Option<Vec<Membership>>> {
		Ok(self.inner.lock().chats.get(&chat).map(|c| c.members.clone()))
	}

	async fn add_member(&self, chat: RoomId, user: UserId, role: Role) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock();
		let entry = inner
			.chats
			.get_mut(&chat)
			.ok_or_else(|| anyhow!("chat {chat} does not exist"))?;
		if entry.members.iter().any(|m| m.user_id == user) {
			return Ok(false);
		}
		entry.members.push(Membership { user_id: user, role });
		Ok(true)
	}

	async fn save_message(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		if self.fail_message_writes.load(Ordering::SeqCst) {
			return Err(anyhow!("message store unavailable"));
		}
		self.inner.lock().messages.push(msg.clone());
		Ok(())
	}

	async fn recent_messages(&self, chat: RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		let inner = self.inner.lock();
		let in_chat: Vec<_> = inner.messages.iter().filter(|m| m.chat_id == chat).cloned().collect();
		let skip = in_chat.len().saturating_sub(limit);
		Ok(in_chat.into_iter().skip(skip).collect())
	}
}

#[cfg(test)]
mod store_tests;
