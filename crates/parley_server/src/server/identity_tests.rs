#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::UserId;
use parley_util::time::unix_secs_now;

use crate::server::error::ServiceError;
use crate::server::identity::IdentityService;
use crate::server::token::{CLAIM_LOGIN, CLAIM_USER_ID, CLAIM_VALID_UNTIL, Claims, TokenCodec};
use crate::store::{MemoryStore, UserStore};

fn codec() -> TokenCodec {
	TokenCodec::new("identity-test-secret", Duration::from_secs(3600)).expect("codec")
}

fn service() -> (IdentityService, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	(IdentityService::new(store.clone(), codec()), store)
}

#[tokio::test]
async fn sign_up_issues_identity_token() {
	let (identity, store) = service();

	let token = identity.sign_up("alice", "correct-horse").await.expect("sign up");
	let who = identity.authenticate(&token).expect("authenticate");
	assert_eq!(who.user_id, UserId(1));
	assert_eq!(who.login, "alice");

	let claims = codec().verify_and_extract(&token).expect("verify");
	assert_eq!(claims.get(CLAIM_USER_ID).map(String::as_str), Some("1"));
	assert_eq!(claims.get(CLAIM_LOGIN).map(String::as_str), Some("alice"));
	assert!(claims.contains_key(CLAIM_VALID_UNTIL));

	let stored = store.user_by_id(UserId(1)).await.expect("lookup").expect("row");
	assert!(stored.password_hash.starts_with("$argon2"), "hash: {}", stored.password_hash);
	assert!(!stored.password_hash.contains("correct-horse"));
}

#[tokio::test]
async fn duplicate_login_is_rejected() {
	let (identity, _) = service();
	identity.sign_up("alice", "correct-horse").await.expect("first");

	let err = identity.sign_up("alice", "another-pass").await.unwrap_err();
	assert!(matches!(err, ServiceError::AlreadyExists("user")), "{err:?}");
}

#[tokio::test]
async fn sign_in_checks_password() {
	let (identity, _) = service();
	identity.sign_up("alice", "correct-horse").await.expect("sign up");

	let token = identity.sign_in("alice", "correct-horse").await.expect("sign in");
	assert_eq!(identity.authenticate(&token).expect("auth").user_id, UserId(1));

	let err = identity.sign_in("alice", "wrong-horse").await.unwrap_err();
	assert!(matches!(err, ServiceError::WrongCredentials), "{err:?}");
	assert_eq!(err.code(), "UNAUTHENTICATED");

	let err = identity.sign_in("nobody", "correct-horse").await.unwrap_err();
	assert!(matches!(err, ServiceError::UserNotFound), "{err:?}");
}

#[tokio::test]
async fn malformed_credentials_are_invalid_arguments() {
	let (identity, store) = service();

	for (login, password) in [("abc", "long-enough"), ("alice", "short"), ("tab\there", "long-enough")] {
		let err = identity.sign_up(login, password).await.unwrap_err();
		assert!(matches!(err, ServiceError::InvalidArgument(_)), "{login}/{password}: {err:?}");
	}
	assert!(store.user_by_login("abc").await.expect("lookup").is_none());
}

#[tokio::test]
async fn login_may_contain_spaces() {
	let (identity, _) = service();

	let token = identity.sign_up("bob smith", "password123").await.expect("sign up");
	assert_eq!(identity.authenticate(&token).expect("auth").login, "bob smith");
	identity.sign_in("bob smith", "password123").await.expect("sign in");
}

#[test]
fn authenticate_rejects_bad_tokens() {
	let (identity, _) = service();

	assert!(matches!(identity.authenticate("garbage"), Err(ServiceError::InvalidToken)));

	let other = TokenCodec::new("someone-else", Duration::from_secs(3600)).expect("codec");
	let forged = other
		.issue(Claims::from([
			(CLAIM_USER_ID.to_string(), "1".to_string()),
			(CLAIM_LOGIN.to_string(), "alice".to_string()),
		]))
		.expect("issue");
	assert!(matches!(identity.authenticate(&forged), Err(ServiceError::InvalidToken)));

	let expired = codec()
		.issue_at(
			Claims::from([
				(CLAIM_USER_ID.to_string(), "1".to_string()),
				(CLAIM_LOGIN.to_string(), "alice".to_string()),
			]),
			unix_secs_now() - 7200,
		)
		.expect("issue");
	assert!(matches!(identity.authenticate(&expired), Err(ServiceError::TokenExpired)));

	// a room-join token carries no login claim
	let join = codec()
		.issue(Claims::from([
			(CLAIM_USER_ID.to_string(), "1".to_string()),
			("chatID".to_string(), "3".to_string()),
		]))
		.expect("issue");
	assert!(matches!(identity.authenticate(&join), Err(ServiceError::InvalidToken)));
}
