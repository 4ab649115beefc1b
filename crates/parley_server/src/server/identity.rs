#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use tracing::{debug, info};

use parley_domain::{Login, Password, UserId};

use crate::server::error::{ServiceError, ServiceResult};
use crate::server::token::{CLAIM_LOGIN, CLAIM_USER_ID, Claims, TokenCodec};
use crate::store::{UserRecord, UserStore};

/// Caller identity proven by an identity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub login: String,
}

/// Sign-up, sign-in and identity token checks.
#[derive(Clone)]
pub struct IdentityService {
	users: Arc<dyn UserStore>,
	tokens: TokenCodec,
}

impl IdentityService {
	pub fn new(users: Arc<dyn UserStore>, tokens: TokenCodec) -> Self {
		Self { users, tokens }
	}

	/// Create an account and return an identity token.
	pub async fn sign_up(&self, login: &str, password: &str) -> ServiceResult<String> {
		let login = Login::new(login)?;
		let password = Password::new(password)?;

		let hash = hash_password(password).await?;
		let user_id = self
			.users
			.create_user(&login, &hash)
			.await?
			.ok_or(ServiceError::AlreadyExists("user"))?;

		info!(%user_id, login = %login, "identity: user signed up");
		metrics::counter!("parley_server_sign_ups_total").increment(1);
		self.identity_token(user_id, login.as_str())
	}

	/// Check credentials and return an identity token.
	pub async fn sign_in(&self, login: &str, password: &str) -> ServiceResult<String> {
		let login = Login::new(login)?;
		let password = Password::new(password)?;

		let user = self
			.users
			.user_by_login(login.as_str())
			.await?
			.ok_or(ServiceError::UserNotFound)?;

		if !verify_password(&user.password_hash, password).await? {
			debug!(user_id = %user.id, "identity: wrong password");
			return Err(ServiceError::WrongCredentials);
		}

		metrics::counter!("parley_server_sign_ins_total").increment(1);
		self.identity_token(user.id, &user.login)
	}

	/// Verify an identity token and read its claims.
	pub fn authenticate(&self, token: &str) -> ServiceResult<Identity> {
		let claims = self.tokens.verify_and_extract(token)?;
		let user_id = claims
			.get(CLAIM_USER_ID)
			.and_then(|v| v.parse::<UserId>().ok())
			.ok_or(ServiceError::InvalidToken)?;
		let login = claims.get(CLAIM_LOGIN).cloned().ok_or(ServiceError::InvalidToken)?;
		Ok(Identity { user_id, login })
	}

	pub async fn user(&self, id: UserId) -> ServiceResult<UserRecord> {
		self.users.user_by_id(id).await?.ok_or(ServiceError::UserNotFound)
	}

	fn identity_token(&self, user_id: UserId, login: &str) -> ServiceResult<String> {
		let claims = Claims::from([
			(CLAIM_USER_ID.to_string(), user_id.to_string()),
			(CLAIM_LOGIN.to_string(), login.to_string()),
		]);
		Ok(self.tokens.issue(claims)?)
	}
}

async fn hash_password(password: Password) -> anyhow::Result<String> {
	tokio::task::spawn_blocking(move || {
		let salt = SaltString::generate(&mut OsRng);
		Argon2::default()
			.hash_password(password.expose().as_bytes(), &salt)
			.map(|h| h.to_string())
			.map_err(|e| anyhow!("hash password: {e}"))
	})
	.await
	.context("password hashing task")?
}

async fn verify_password(hash: &str, password: Password) -> anyhow::Result<bool> {
	let hash = hash.to_string();
	tokio::task::spawn_blocking(move || {
		let parsed = PasswordHash::new(&hash).map_err(|e| anyhow!("stored password hash is malformed: {e}"))?;
		Ok(Argon2::default()
			.verify_password(password.expose().as_bytes(), &parsed)
			.is_ok())
	})
	.await
	.context("password verification task")?
}
