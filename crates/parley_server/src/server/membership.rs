#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::info;

use parley_domain::{ChatName, Role, RoomId, UserId};

use crate::server::error::{ServiceError, ServiceResult};
use crate::store::{ChatStore, UserStore};

/// Room existence, membership and ownership rules.
#[derive(Clone)]
pub struct MembershipService {
	chats: Arc<dyn ChatStore>,
	users: Arc<dyn UserStore>,
}

impl MembershipService {
	pub fn new(chats: Arc<dyn ChatStore>, users: Arc<dyn UserStore>) -> Self {
		Self { chats, users }
	}

	/// `ChatNotFound` if the room is missing, `ChatHaveNoUser` if `user` is not a member.
	pub async fn validate_membership(&self, user: UserId, chat: RoomId) -> ServiceResult<()> {
		let members = self.chats.chat_members(chat).await?.ok_or(ServiceError::ChatNotFound)?;
		if !members.iter().any(|m| m.user_id == user) {
			return Err(ServiceError::ChatHaveNoUser);
		}
		Ok(())
	}

	/// Create a room owned by `owner`.
	pub async fn create_chat(&self, owner: UserId, name: &str) -> ServiceResult<RoomId> {
		let name = ChatName::new(name)?;
		let chat = self
			.chats
			.create_chat_with_owner(&name, owner)
			.await?
			.ok_or(ServiceError::AlreadyExists("chat"))?;

		info!(chat_id = %chat, owner = %owner, name = %name, "membership: chat created");
		Ok(chat)
	}

	/// Owner-only. Adding an existing member is a no-op.
	pub async fn add_user_to_chat(&self, requester: UserId, chat: RoomId, user: UserId) -> ServiceResult<()> {
		let members = self.chats.chat_members(chat).await?.ok_or(ServiceError::ChatNotFound)?;
		let is_owner = members
			.iter()
			.any(|m| m.user_id == requester && m.role == Role::Owner);
		if !is_owner {
			return Err(ServiceError::UserNotOwner);
		}

		self.users.user_by_id(user).await?.ok_or(ServiceError::UserNotFound)?;

		if self.chats.add_member(chat, user, Role::Member).await? {
			info!(chat_id = %chat, %user, by = %requester, "membership: user added");
		}
		Ok(())
	}
}
