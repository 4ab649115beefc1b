#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use parley_util::time::unix_secs_now;

/// String claims carried by a session token.
pub type Claims = BTreeMap<String, String>;

/// Reserved expiry claim (unix seconds, decimal). Overwritten on issue.
pub const CLAIM_VALID_UNTIL: &str = "validUntil";
pub const CLAIM_USER_ID: &str = "userID";
pub const CLAIM_LOGIN: &str = "login";
pub const CLAIM_CHAT_ID: &str = "chatID";

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
	#[error("invalid token")]
	InvalidToken,
	#[error("token expired")]
	TokenExpired,
	#[error("token signing key is unusable")]
	SigningKey,
}

/// Mints and verifies `v1.<payload>.<signature>` tokens (HMAC-SHA256, base64url).
///
/// Tokens are bearer credentials with no revocation: a leaked token stays valid
/// until its `validUntil` passes.
#[derive(Clone)]
pub struct TokenCodec {
	secret: Arc<[u8]>,
	validity: Duration,
}

impl std::fmt::Debug for TokenCodec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenCodec")
			.field("secret", &"<redacted>")
			.field("validity", &self.validity)
			.finish()
	}
}

impl TokenCodec {
	pub fn new(secret: impl AsRef<[u8]>, validity: Duration) -> Result<Self, TokenError> {
		let secret = secret.as_ref();
		if secret.is_empty() {
			return Err(TokenError::SigningKey);
		}
		Ok(Self {
			secret: Arc::from(secret),
			validity,
		})
	}

	pub fn validity(&self) -> Duration {
		self.validity
	}

	/// Stamp `now + validity` and sign.
	pub fn issue(&self, claims: Claims) -> Result<String, TokenError> {
		self.issue_at(claims, unix_secs_now())
	}

	pub fn issue_at(&self, mut claims: Claims, now_secs: i64) -> Result<String, TokenError> {
		let validity = i64::try_from(self.validity.as_secs()).unwrap_or(i64::MAX);
		let valid_until = now_secs.saturating_add(validity);
		claims.insert(CLAIM_VALID_UNTIL.to_string(), valid_until.to_string());

		let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::SigningKey)?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = self.sign(payload_b64.as_bytes())?;

		Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	pub fn verify(&self, token: &str) -> Result<(), TokenError> {
		self.verify_and_extract(token).map(|_| ())
	}

	/// Verify signature and expiry, then return every claim (including `validUntil`).
	pub fn verify_and_extract(&self, token: &str) -> Result<Claims, TokenError> {
		self.verify_and_extract_at(token, unix_secs_now())
	}

	pub fn verify_and_extract_at(&self, token: &str, now_secs: i64) -> Result<Claims, TokenError> {
		let mut parts = token.trim().split('.');
		let (Some(TOKEN_VERSION), Some(payload_b64), Some(sig_b64), None) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(TokenError::InvalidToken);
		};

		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| TokenError::InvalidToken)?;
		let expected_sig = self.sign(payload_b64.as_bytes())?;
		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(TokenError::InvalidToken);
		}

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| TokenError::InvalidToken)?;
		let claims: Claims = serde_json::from_slice(&payload).map_err(|_| TokenError::InvalidToken)?;

		// unparsable expiry counts as missing
		let valid_until = claims
			.get(CLAIM_VALID_UNTIL)
			.and_then(|v| v.parse::<i64>().ok())
			.ok_or(TokenError::TokenExpired)?;
		if now_secs > valid_until {
			return Err(TokenError::TokenExpired);
		}

		Ok(claims)
	}

	fn sign(&self, payload_b64: &[u8]) -> Result<Vec<u8>, TokenError> {
		let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).map_err(|_| TokenError::SigningKey)?;
		mac.update(payload_b64);
		Ok(mac.finalize().into_bytes().to_vec())
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
