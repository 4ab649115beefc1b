#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use parley_domain::{ChatMessage, ChatName, Login, Membership, Role, RoomId, UserId};

use super::{ChatStore, UserRecord, UserStore};

/// sqlx-backed store. The backend is picked from the URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl std::fmt::Debug for SqlStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SqlStore").field("backend", &self.backend_name()).finish()
	}
}

impl SqlStore {
	/// Connect and run embedded migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true)
				.foreign_keys(true);

			// every connection to an in-memory database is a separate database
			let in_memory = database_url.contains(":memory:");
			let mut pool_opts = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 8 });
			if in_memory {
				pool_opts = pool_opts.min_connections(1).idle_timeout(None).max_lifetime(None);
			}
			let pool = pool_opts
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(16)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self.backend {
			Backend::Sqlite(_) => "sqlite",
			Backend::Postgres(_) => "postgres",
		}
	}

	/// Postgres pool, when this store runs on postgres.
	pub fn pg_pool(&self) -> Option<&sqlx::PgPool> {
		match &self.backend {
			Backend::Postgres(pool) => Some(pool),
			Backend::Sqlite(_) => None,
		}
	}
}

fn user_record((id, login, password_hash): (i64, String, String)) -> UserRecord {
	UserRecord {
		id: UserId(id),
		login,
		password_hash,
	}
}

fn memberships(rows: Vec<(i64, String)>) -> anyhow::Result<Vec<Membership>> {
	rows.into_iter()
		.map(|(user_id, role)| {
			let role = Role::from_str(&role).with_context(|| format!("stored role for user {user_id}"))?;
			Ok(Membership {
				user_id: UserId(user_id),
				role,
			})
		})
		.collect()
}

#[async_trait]
impl UserStore for SqlStore {
	async fn create_user(&self, login: &Login, password_hash: &str) -> anyhow::Result<Option<UserId>> {
		let row: Option<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO users (login, password_hash) VALUES (?, ?) ON CONFLICT (login) DO NOTHING RETURNING id",
			)
			.bind(login.as_str())
			.bind(password_hash)
			.fetch_optional(pool)
			.await
			.context("insert user (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO users (login, password_hash) VALUES ($1, $2) ON CONFLICT (login) DO NOTHING RETURNING id",
			)
			.bind(login.as_str())
			.bind(password_hash)
			.fetch_optional(pool)
			.await
			.context("insert user (postgres)")?,
		};
		Ok(row.map(|(id,)| UserId(id)))
	}

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserRecord>> {
		let row: Option<(i64, String, String)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT id, login, password_hash FROM users WHERE login = ?")
				.bind(login)
				.fetch_optional(pool)
				.await
				.context("select user by login (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT id, login, password_hash FROM users WHERE login = $1")
				.bind(login)
				.fetch_optional(pool)
				.await
				.context("select user by login (postgres)")?,
		};
		Ok(row.map(user_record))
	}

	async fn user_by_id(&self, id: UserId) -> anyhow::Result<Option<UserRecord>> {
		let row: Option<(i64, String, String)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT id, login, password_hash FROM users WHERE id = ?")
				.bind(id.get())
				.fetch_optional(pool)
				.await
				.context("select user by id (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT id, login, password_hash FROM users WHERE id = $1")
				.bind(id.get())
				.fetch_optional(pool)
				.await
				.context("select user by id (postgres)")?,
		};
		Ok(row.map(user_record))
	}
}

#[async_trait]
impl ChatStore for SqlStore {
	async fn create_chat_with_owner(&self, name: &ChatName, owner: UserId) -> anyhow::Result<Option<RoomId>> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let row: Option<(i64,)> =
					sqlx::query_as("INSERT INTO chats (name) VALUES (?) ON CONFLICT (name) DO NOTHING RETURNING id")
						.bind(name.as_str())
						.fetch_optional(&mut *tx)
						.await
						.context("insert chat (sqlite)")?;
				let Some((chat_id,)) = row else {
					return Ok(None);
				};

				sqlx::query("INSERT INTO users_to_chats (chat_id, user_id, role) VALUES (?, ?, ?)")
					.bind(chat_id)
					.bind(owner.get())
					.bind(Role::Owner.as_str())
					.execute(&mut *tx)
					.await
					.context("insert chat owner (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				Ok(Some(RoomId(chat_id)))
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let row: Option<(i64,)> =
					sqlx::query_as("INSERT INTO chats (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id")
						.bind(name.as_str())
						.fetch_optional(&mut *tx)
						.await
						.context("insert chat (postgres)")?;
				let Some((chat_id,)) = row else {
					return Ok(None);
				};

				sqlx::query("INSERT INTO users_to_chats (chat_id, user_id, role) VALUES ($1, $2, $3)")
					.bind(chat_id)
					.bind(owner.get())
					.bind(Role::Owner.as_str())
					.execute(&mut *tx)
					.await
					.context("insert chat owner (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				Ok(Some(RoomId(chat_id)))
			}
		}
	}

	async fn chat_members(&self, chat: RoomId) -> anyhow::Result<Option<Vec<Membership>>> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM chats WHERE id = ?")
					.bind(chat.get())
					.fetch_optional(pool)
					.await
					.context("select chat (sqlite)")?;
				if exists.is_none() {
					return Ok(None);
				}
				let rows: Vec<(i64, String)> = sqlx::query_as("SELECT user_id, role FROM users_to_chats WHERE chat_id = ?")
					.bind(chat.get())
					.fetch_all(pool)
					.await
					.context("select chat members (sqlite)")?;
				memberships(rows).map(Some)
			}
			Backend::Postgres(pool) => {
				let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM chats WHERE id = $1")
					.bind(chat.get())
					.fetch_optional(pool)
					.await
					.context("select chat (postgres)")?;
				if exists.is_none() {
					return Ok(None);
				}
				let rows: Vec<(i64, String)> =
					sqlx::query_as("SELECT user_id, role FROM users_to_chats WHERE chat_id = $1")
						.bind(chat.get())
						.fetch_all(pool)
						.await
						.context("select chat members (postgres)")?;
				memberships(rows).map(Some)
			}
		}
	}

	async fn add_member(&self, chat: RoomId, user: UserId, role: Role) -> anyhow::Result<bool> {
		let res = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query(
				"INSERT INTO users_to_chats (chat_id, user_id, role) VALUES (?, ?, ?) \
				ON CONFLICT (chat_id, user_id) DO NOTHING",
			)
			.bind(chat.get())
			.bind(user.get())
			.bind(role.as_str())
			.execute(pool)
			.await
			.context("insert chat member (sqlite)")?
			.rows_affected(),
			Backend::Postgres(pool) => sqlx::query(
				"INSERT INTO users_to_chats (chat_id, user_id, role) VALUES ($1, $2, $3) \
				ON CONFLICT (chat_id, user_id) DO NOTHING",
			)
			.bind(chat.get())
			.bind(user.get())
			.bind(role.as_str())
			.execute(pool)
			.await
			.context("insert chat member (postgres)")?
			.rows_affected(),
		};
		Ok(res == 1)
	}

	async fn save_message(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO messages (chat_id, user_id, message) VALUES (?, ?, ?)")
					.bind(msg.chat_id.get())
					.bind(msg.user_id.get())
					.bind(&msg.message)
					.execute(pool)
					.await
					.context("insert message (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO messages (chat_id, user_id, message) VALUES ($1, $2, $3)")
					.bind(msg.chat_id.get())
					.bind(msg.user_id.get())
					.bind(&msg.message)
					.execute(pool)
					.await
					.context("insert message (postgres)")?;
			}
		}
		Ok(())
	}

	async fn recent_messages(&self, chat: RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let mut rows: Vec<(i64, i64, String, String)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT m.chat_id, m.user_id, u.login, m.message FROM messages m \
				JOIN users u ON u.id = m.user_id WHERE m.chat_id = ? ORDER BY m.id DESC LIMIT ?",
			)
			.bind(chat.get())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent messages (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT m.chat_id, m.user_id, u.login, m.message FROM messages m \
				JOIN users u ON u.id = m.user_id WHERE m.chat_id = $1 ORDER BY m.id DESC LIMIT $2",
			)
			.bind(chat.get())
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent messages (postgres)")?,
		};
		rows.reverse();

		Ok(rows
			.into_iter()
			.map(|(chat_id, user_id, login, message)| ChatMessage {
				chat_id: RoomId(chat_id),
				user_id: UserId(user_id),
				login,
				message,
			})
			.collect())
	}
}
