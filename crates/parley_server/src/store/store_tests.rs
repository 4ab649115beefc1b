#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ChatMessage, ChatName, Login, Membership, Role, RoomId, UserId};

use super::{ChatStore, MemoryStore, SqlStore, UserStore};

trait Store: UserStore + ChatStore {}
impl<T: UserStore + ChatStore> Store for T {}

async fn stores() -> Vec<(&'static str, Arc<dyn Store>)> {
	let sqlite = SqlStore::connect("sqlite::memory:").await.expect("connect sqlite");
	vec![("memory", Arc::new(MemoryStore::new())), ("sqlite", Arc::new(sqlite))]
}

fn login(s: &str) -> Login {
	Login::new(s).expect("login")
}

fn name(s: &str) -> ChatName {
	ChatName::new(s).expect("name")
}

#[tokio::test]
async fn users_are_unique_by_login() {
	for (kind, store) in stores().await {
		let id = store
			.create_user(&login("alice"), "hash-a")
			.await
			.expect("create")
			.expect("fresh login");
		assert!(
			store.create_user(&login("alice"), "hash-b").await.expect("create").is_none(),
			"{kind}: duplicate login must be reported"
		);

		let by_login = store.user_by_login("alice").await.expect("lookup").expect("exists");
		assert_eq!(by_login.id, id, "{kind}");
		assert_eq!(by_login.password_hash, "hash-a", "{kind}: first write wins");

		let by_id = store.user_by_id(id).await.expect("lookup").expect("exists");
		assert_eq!(by_id.login, "alice", "{kind}");
		assert!(store.user_by_id(UserId(999)).await.expect("lookup").is_none(), "{kind}");
	}
}

#[tokio::test]
async fn chat_creation_assigns_owner_and_rejects_duplicates() {
	for (kind, store) in stores().await {
		let owner = store.create_user(&login("owner"), "h").await.unwrap().unwrap();
		let other = store.create_user(&login("other"), "h").await.unwrap().unwrap();

		let chat = store
			.create_chat_with_owner(&name("general"), owner)
			.await
			.expect("create chat")
			.expect("fresh name");
		assert!(
			store.create_chat_with_owner(&name("general"), other).await.unwrap().is_none(),
			"{kind}: duplicate name"
		);

		let members = store.chat_members(chat).await.unwrap().expect("chat exists");
		assert_eq!(
			members,
			vec![Membership {
				user_id: owner,
				role: Role::Owner
			}],
			"{kind}: duplicate create must not touch membership"
		);
		assert!(store.chat_members(RoomId(4242)).await.unwrap().is_none(), "{kind}");
	}
}

#[tokio::test]
async fn add_member_is_idempotent() {
	for (kind, store) in stores().await {
		let owner = store.create_user(&login("owner"), "h").await.unwrap().unwrap();
		let bob = store.create_user(&login("bobby"), "h").await.unwrap().unwrap();
		let chat = store.create_chat_with_owner(&name("room"), owner).await.unwrap().unwrap();

		assert!(store.add_member(chat, bob, Role::Member).await.unwrap(), "{kind}");
		assert!(!store.add_member(chat, bob, Role::Member).await.unwrap(), "{kind}");

		let members = store.chat_members(chat).await.unwrap().unwrap();
		assert_eq!(members.len(), 2, "{kind}");
		assert!(members.iter().any(|m| m.user_id == bob && m.role == Role::Member), "{kind}");
	}
}

#[tokio::test]
async fn messages_are_returned_oldest_first() {
	for (kind, store) in stores().await {
		let owner = store.create_user(&login("writer"), "h").await.unwrap().unwrap();
		let chat = store.create_chat_with_owner(&name("log"), owner).await.unwrap().unwrap();

		for body in ["one", "two", "three"] {
			store
				.save_message(&ChatMessage {
					chat_id: chat,
					user_id: owner,
					login: "writer".into(),
					message: body.into(),
				})
				.await
				.expect("save");
		}

		let recent = store.recent_messages(chat, 2).await.expect("recent");
		let bodies: Vec<_> = recent.iter().map(|m| m.message.as_str()).collect();
		assert_eq!(bodies, ["two", "three"], "{kind}");
		assert_eq!(recent[0].login, "writer", "{kind}");
	}
}

#[tokio::test]
async fn memory_store_can_simulate_write_failures() {
	let store = MemoryStore::new();
	store.set_fail_message_writes(true);
	let msg = ChatMessage {
		chat_id: RoomId(1),
		user_id: UserId(1),
		login: "x".into(),
		message: "y".into(),
	};
	assert!(store.save_message(&msg).await.is_err());

	store.set_fail_message_writes(false);
	store.save_message(&msg).await.expect("save");
}

#[tokio::test]
async fn unsupported_url_is_rejected() {
	let err = SqlStore::connect("mysql://localhost/db").await.unwrap_err();
	assert!(err.to_string().contains("unsupported"));
}
