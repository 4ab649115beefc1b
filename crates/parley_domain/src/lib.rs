#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Login length bounds, counted in characters.
pub const LOGIN_MIN_CHARS: usize = 4;
pub const LOGIN_MAX_CHARS: usize = 20;

/// Password length bounds, counted in characters.
pub const PASSWORD_MIN_CHARS: usize = 8;
pub const PASSWORD_MAX_CHARS: usize = 30;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown role: {0}")]
	UnknownRole(String),
}

/// Validation failures for user-supplied values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("login must be 4..=20 characters, got {0}")]
	LoginLength(usize),
	#[error("login must not contain control characters")]
	LoginNotPrintable,
	#[error("password must be 8..=30 characters, got {0}")]
	PasswordLength(usize),
	#[error("chat name must be non-empty")]
	EmptyChatName,
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub i64);

		impl $name {
			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<i64>()
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(format!("expected integer id, got {s:?}")))
			}
		}

		impl From<i64> for $name {
			fn from(v: i64) -> Self {
				Self(v)
			}
		}
	};
}

numeric_id!(
	/// Store-assigned user identifier.
	UserId
);

numeric_id!(
	/// Store-assigned chat room identifier.
	RoomId
);

/// Per-stream correlation id. Tags a live connection in the registry and on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
	/// Create a new random connection id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConnectionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Validated login name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Login(String);

impl Login {
	pub fn new(login: impl Into<String>) -> Result<Self, ValidationError> {
		let login = login.into();
		let chars = login.chars().count();
		if !(LOGIN_MIN_CHARS..=LOGIN_MAX_CHARS).contains(&chars) {
			return Err(ValidationError::LoginLength(chars));
		}
		if login.chars().any(char::is_control) {
			return Err(ValidationError::LoginNotPrintable);
		}
		Ok(Self(login))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Login {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for Login {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Login::new(value)
	}
}

impl From<Login> for String {
	fn from(value: Login) -> Self {
		value.0
	}
}

/// Plaintext password accepted at sign-up. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
	pub fn new(password: impl Into<String>) -> Result<Self, ValidationError> {
		let password = password.into();
		let chars = password.chars().count();
		if !(PASSWORD_MIN_CHARS..=PASSWORD_MAX_CHARS).contains(&chars) {
			return Err(ValidationError::PasswordLength(chars));
		}
		Ok(Self(password))
	}
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for Password {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("Password(<redacted>)")
	}
}

/// Non-empty chat room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatName(String);

impl ChatName {
	pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
		let name = name.into();
		if name.is_empty() {
			return Err(ValidationError::EmptyChatName);
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChatName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Membership role inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Owner,
	Member,
}

impl Role {
	/// Stable string identifier, as stored.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Owner => "owner",
			Role::Member => "member",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"owner" => Ok(Role::Owner),
			"member" => Ok(Role::Member),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// A room member with its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
	pub user_id: UserId,
	pub role: Role,
}

/// A chat message as persisted and carried on the fan-out bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub chat_id: RoomId,
	pub user_id: UserId,
	pub login: String,
	pub message: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numeric_ids_parse_and_display() {
		assert_eq!("42".parse::<UserId>().unwrap(), UserId(42));
		assert_eq!(" 7 ".parse::<RoomId>().unwrap(), RoomId(7));
		assert_eq!(RoomId(9).to_string(), "9");
		assert_eq!("".parse::<UserId>().unwrap_err(), ParseIdError::Empty);
		assert!("abc".parse::<RoomId>().is_err());
	}

	#[test]
	fn connection_id_parse_roundtrip() {
		let id = ConnectionId::new_v4();
		assert_eq!(id.to_string().parse::<ConnectionId>().unwrap(), id);
		assert!("not-a-uuid".parse::<ConnectionId>().is_err());
	}

	#[test]
	fn login_bounds_count_characters() {
		assert!(Login::new("abc").is_err());
		assert!(Login::new("abcd").is_ok());
		assert!(Login::new("a".repeat(20)).is_ok());
		assert!(Login::new("a".repeat(21)).is_err());
		// four multi-byte chars are still four characters
		assert!(Login::new("日本語字").is_ok());
		assert_eq!(Login::new("bob smith").unwrap().as_str(), "bob smith");
		assert_eq!(Login::new("ab\tcd").unwrap_err(), ValidationError::LoginNotPrintable);
		assert_eq!(Login::new("abc\u{7f}").unwrap_err(), ValidationError::LoginNotPrintable);
	}

	#[test]
	fn password_bounds() {
		assert!(Password::new("short").is_err());
		assert!(Password::new("exactly8").is_ok());
		assert!(Password::new("x".repeat(30)).is_ok());
		assert!(Password::new("x".repeat(31)).is_err());
		assert_eq!(format!("{:?}", Password::new("hunter2hunter2").unwrap()), "Password(<redacted>)");
	}

	#[test]
	fn chat_name_rejects_only_empty() {
		assert_eq!(ChatName::new("").unwrap_err(), ValidationError::EmptyChatName);
		assert_eq!(ChatName::new("   ").unwrap().as_str(), "   ");
		assert_eq!(ChatName::new("general").unwrap().as_str(), "general");
	}

	#[test]
	fn role_parse_and_display() {
		assert_eq!("owner".parse::<Role>().unwrap(), Role::Owner);
		assert_eq!("MEMBER".parse::<Role>().unwrap(), Role::Member);
		assert_eq!(Role::Owner.to_string(), "owner");
		assert!("admin".parse::<Role>().is_err());
	}

	#[test]
	fn chat_message_json_shape() {
		let msg = ChatMessage {
			chat_id: RoomId(3),
			user_id: UserId(1),
			login: "alice".into(),
			message: "hi".into(),
		};
		let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
		assert_eq!(v["chat_id"], 3);
		assert_eq!(v["user_id"], 1);
		assert_eq!(v["login"], "alice");
		assert_eq!(v["message"], "hi");
	}
}
