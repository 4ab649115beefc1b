#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, LENGTH_PREFIX_LEN, decode_frame, encode_frame};

/// Generated protobuf types (`parley.v1`).
///
/// Every RPC is one client-opened bidirectional stream carrying `Envelope` frames.
/// Credentials travel in `Envelope.metadata`, never in message bodies.
pub mod pb {
	include!(concat!(env!("OUT_DIR"), "/parley.v1.rs"));
}

/// Well-known `Envelope.metadata` keys.
pub mod metadata {
	/// Identity token issued by `SignUp`/`SignIn`.
	pub const AUTHENTICATION: &str = "authentication";
	/// Room-join token issued by `JoinChat`.
	pub const SESSION: &str = "session";
}

/// `pb::Error.code` values.
pub mod codes {
	pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
	pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
	pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
	pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
	pub const NOT_FOUND: &str = "NOT_FOUND";
	pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
	pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
	pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
	pub const INTERNAL: &str = "INTERNAL";
}

/// Protocol version constants.
pub mod version {
	pub const PROTOCOL_MAJOR: u32 = 1;
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation carried in `Envelope.version`.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}

/// ALPN identifier negotiated on every QUIC connection.
pub const ALPN: &[u8] = b"parley-v1";
