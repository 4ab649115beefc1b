#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_domain::{ChatMessage, ConnectionId, RoomId, UserId};

use crate::server::bus::FanoutBus;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::identity::IdentityService;
use crate::server::membership::MembershipService;
use crate::server::registry::{ConnectionRegistry, RegistrationGuard, Sink};
use crate::server::token::{CLAIM_CHAT_ID, CLAIM_USER_ID, Claims, TokenCodec};
use crate::store::ChatStore;

/// Source of inbound message bodies for one chat stream.
#[async_trait]
pub trait InboundMessages: Send {
	/// `Ok(None)` on clean end of input.
	async fn next_message(&mut self) -> anyhow::Result<Option<String>>;
}

#[async_trait]
impl InboundMessages for mpsc::Receiver<anyhow::Result<String>> {
	async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
		self.recv().await.transpose()
	}
}

/// A verified room-join token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
	pub user_id: UserId,
	pub chat_id: RoomId,
	pub login: String,
}

/// Room lifecycle RPCs plus the per-stream receive loop.
#[derive(Clone)]
pub struct ChatOrchestrator {
	identity: IdentityService,
	membership: MembershipService,
	chats: Arc<dyn ChatStore>,
	tokens: TokenCodec,
	registry: ConnectionRegistry,
	bus: FanoutBus,
}

impl ChatOrchestrator {
	pub fn new(
		identity: IdentityService,
		membership: MembershipService,
		chats: Arc<dyn ChatStore>,
		tokens: TokenCodec,
		registry: ConnectionRegistry,
		bus: FanoutBus,
	) -> Self {
		Self {
			identity,
			membership,
			chats,
			tokens,
			registry,
			bus,
		}
	}

	pub fn identity(&self) -> &IdentityService {
		&self.identity
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	pub async fn create_chat(&self, owner: UserId, name: &str) -> ServiceResult<RoomId> {
		self.membership.create_chat(owner, name).await
	}

	pub async fn add_user_to_chat(&self, requester: UserId, chat: RoomId, user: UserId) -> ServiceResult<()> {
		self.membership.add_user_to_chat(requester, chat, user).await
	}

	/// Issue a room-join token for a member of `chat`.
	pub async fn join_chat(&self, user: UserId, chat: RoomId) -> ServiceResult<String> {
		self.membership.validate_membership(user, chat).await?;

		let claims = Claims::from([
			(CLAIM_USER_ID.to_string(), user.to_string()),
			(CLAIM_CHAT_ID.to_string(), chat.to_string()),
		]);
		Ok(self.tokens.issue(claims)?)
	}

	/// Verify a room-join token and resolve the sender. Touches no registry state.
	pub async fn admit(&self, session_token: &str) -> ServiceResult<Admission> {
		let claims = self.tokens.verify_and_extract(session_token)?;
		let user_id = claim_id(&claims, CLAIM_USER_ID)?;
		let chat_id = claim_id(&claims, CLAIM_CHAT_ID)?;

		let user = self.identity.user(user_id).await?;
		Ok(Admission {
			user_id,
			chat_id,
			login: user.login,
		})
	}

	/// Register `sink` under a fresh connection id.
	pub fn open_session(&self, admission: Admission, sink: Sink) -> ChatSession {
		let conn = ConnectionId::new_v4();
		let guard = self.registry.register(admission.user_id, admission.chat_id, conn, sink);

		info!(
			user_id = %admission.user_id,
			chat_id = %admission.chat_id,
			connection_id = %conn,
			"chat: stream opened"
		);

		ChatSession {
			admission,
			guard,
			chats: self.chats.clone(),
			bus: self.bus.clone(),
		}
	}
}

fn claim_id<T: std::str::FromStr>(claims: &Claims, key: &str) -> ServiceResult<T> {
	claims
		.get(key)
		.and_then(|v| v.parse::<T>().ok())
		.ok_or(ServiceError::InvalidToken)
}

/// A registered chat stream. Dropping it (or finishing `run`) unregisters the connection.
pub struct ChatSession {
	admission: Admission,
	guard: RegistrationGuard,
	chats: Arc<dyn ChatStore>,
	bus: FanoutBus,
}

impl ChatSession {
	pub fn connection_id(&self) -> ConnectionId {
		self.guard.connection_id()
	}

	pub fn admission(&self) -> &Admission {
		&self.admission
	}

	/// Persist then publish every non-empty inbound message until the input ends.
	///
	/// A persistence failure ends the session with an error. A publish failure is
	/// logged and the loop continues.
	pub async fn run<I: InboundMessages>(self, mut inbound: I) -> ServiceResult<()> {
		let conn = self.connection_id();
		let Admission {
			user_id,
			chat_id,
			ref login,
		} = self.admission;

		let result = loop {
			let body = match inbound.next_message().await {
				Ok(Some(body)) => body,
				Ok(None) => break Ok(()),
				Err(e) => break Err(ServiceError::Internal(e.context("receive chat message"))),
			};

			if body.is_empty() {
				continue;
			}

			let msg = ChatMessage {
				chat_id,
				user_id,
				login: login.clone(),
				message: body,
			};

			if let Err(e) = self.chats.save_message(&msg).await {
				metrics::counter!("parley_server_messages_persist_failures_total").increment(1);
				break Err(ServiceError::Internal(e.context("persist chat message")));
			}
			metrics::counter!("parley_server_messages_total").increment(1);

			if let Err(e) = self.bus.publish(conn, &msg).await {
				warn!(
					connection_id = %conn,
					chat_id = %chat_id,
					error = %format!("{e:#}"),
					"chat: message persisted but not published"
				);
			}
		};

		match &result {
			Ok(()) => debug!(connection_id = %conn, "chat: stream closed by client"),
			Err(e) => warn!(connection_id = %conn, error = %e, "chat: stream aborted"),
		}

		// dropping self releases the registration guard
		result
	}
}
