#![forbid(unsafe_code)]

use parley_domain::ValidationError;
use parley_protocol::{codes, pb};
use thiserror::Error;

use crate::server::token::TokenError;

/// Errors surfaced by the chat services and mapped onto `pb::Error`.
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("invalid token")]
	InvalidToken,

	#[error("token expired")]
	TokenExpired,

	#[error("wrong login or password")]
	WrongCredentials,

	#[error("user not found")]
	UserNotFound,

	#[error("chat not found")]
	ChatNotFound,

	#[error("{0} already exists")]
	AlreadyExists(&'static str),

	#[error("user is not a member of the chat")]
	ChatHaveNoUser,

	#[error("user is not the chat owner")]
	UserNotOwner,

	#[error("internal error: {0:#}")]
	Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
	/// Stable wire code.
	pub fn code(&self) -> &'static str {
		match self {
			ServiceError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
			ServiceError::InvalidToken => codes::INVALID_TOKEN,
			ServiceError::TokenExpired => codes::TOKEN_EXPIRED,
			ServiceError::WrongCredentials => codes::UNAUTHENTICATED,
			ServiceError::UserNotFound | ServiceError::ChatNotFound => codes::NOT_FOUND,
			ServiceError::AlreadyExists(_) => codes::ALREADY_EXISTS,
			ServiceError::ChatHaveNoUser | ServiceError::UserNotOwner => codes::PERMISSION_DENIED,
			ServiceError::Internal(_) => codes::INTERNAL,
		}
	}

	/// Wire form. Internal details are not sent to clients.
	pub fn to_pb(&self) -> pb::Error {
		let message = match self {
			ServiceError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		};
		pb::Error {
			code: self.code().to_string(),
			message,
		}
	}
}

impl From<TokenError> for ServiceError {
	fn from(e: TokenError) -> Self {
		match e {
			TokenError::InvalidToken => ServiceError::InvalidToken,
			TokenError::TokenExpired => ServiceError::TokenExpired,
			TokenError::SigningKey => ServiceError::Internal(anyhow::Error::new(e)),
		}
	}
}

impl From<ValidationError> for ServiceError {
	fn from(e: ValidationError) -> Self {
		ServiceError::InvalidArgument(e.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn taxonomy_codes() {
		assert_eq!(ServiceError::from(ValidationError::EmptyChatName).code(), codes::INVALID_ARGUMENT);
		assert_eq!(ServiceError::from(TokenError::TokenExpired).code(), codes::TOKEN_EXPIRED);
		assert_eq!(ServiceError::from(TokenError::SigningKey).code(), codes::INTERNAL);
		assert_eq!(ServiceError::UserNotOwner.code(), codes::PERMISSION_DENIED);
		assert_eq!(ServiceError::ChatHaveNoUser.code(), codes::PERMISSION_DENIED);
		assert_eq!(ServiceError::ChatNotFound.code(), codes::NOT_FOUND);
	}

	#[test]
	fn internal_details_stay_server_side() {
		let err = ServiceError::Internal(anyhow::anyhow!("db password=hunter2 rejected"));
		let wire = err.to_pb();
		assert_eq!(wire.code, codes::INTERNAL);
		assert!(!wire.message.contains("hunter2"));
	}
}
