#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use parley_protocol::pb::envelope::Msg;
use parley_protocol::version::PROTOCOL_VERSION_U32;
use parley_protocol::{ALPN, DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, encode_frame, metadata, pb};
use parley_util::endpoint::{DEFAULT_PORT, QuicEndpoint};
use parley_util::time::unix_ms_now;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tracing::{debug, info};

/// Client configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal). Also the TLS server name.
	pub server_host: String,

	pub server_port: u16,

	/// Resolved address override; skips DNS.
	pub server_addr: Option<SocketAddr>,

	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,

	/// Timeout for a single request/response exchange.
	pub request_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let e = QuicEndpoint::parse(endpoint).map_err(ClientError::Connect)?;
		Ok(Self {
			server_host: e.server_name().to_string(),
			server_port: e.port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: DEFAULT_PORT,
			server_addr: Some(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
			request_timeout: Duration::from_secs(30),
		}
	}
}

/// Errors for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering/types.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),

	/// The server answered with `pb::Error`.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	#[error("error: {0}")]
	Other(String),
}

impl ClientError {
	/// Server error code (`codes::*`), if the server rejected the request.
	pub fn server_code(&self) -> Option<&str> {
		match self {
			ClientError::Server { code, .. } => Some(code),
			_ => None,
		}
	}
}

impl From<anyhow::Error> for ClientError {
	fn from(e: anyhow::Error) -> Self {
		ClientError::Other(format!("{e:#}"))
	}
}

impl From<pb::Error> for ClientError {
	fn from(e: pb::Error) -> Self {
		ClientError::Server {
			code: e.code,
			message: e.message,
		}
	}
}

/// One QUIC connection to a parley server. Every call opens its own stream, so a
/// client can run RPCs while chat sessions are live.
pub struct ParleyClient {
	// the endpoint must outlive the connection
	_endpoint: Endpoint,
	conn: quinn::Connection,
	max_frame_bytes: usize,
	request_timeout: Duration,
	next_request: AtomicU64,
}

impl ParleyClient {
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = if cfg.server_host.contains(':') {
					format!("[{}]:{}", cfg.server_host, cfg.server_port)
				} else {
					format!("{}:{}", cfg.server_host, cfg.server_port)
				};
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientError::Connect(last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")))
		})?;

		info!(remote = %conn.remote_address(), "connected");

		Ok(Self {
			_endpoint: endpoint,
			conn,
			max_frame_bytes: cfg.max_frame_bytes,
			request_timeout: cfg.request_timeout,
			next_request: AtomicU64::new(1),
		})
	}

	/// Register and return an identity token.
	pub async fn sign_up(&self, login: &str, password: &str) -> Result<String, ClientError> {
		let msg = Msg::SignUp(pb::SignUp {
			login: login.to_string(),
			password: password.to_string(),
		});
		match self.request(None, msg).await? {
			Msg::AuthToken(t) => Ok(t.token),
			other => Err(unexpected("AuthToken", &other)),
		}
	}

	/// Check credentials and return an identity token.
	pub async fn sign_in(&self, login: &str, password: &str) -> Result<String, ClientError> {
		let msg = Msg::SignIn(pb::SignIn {
			login: login.to_string(),
			password: password.to_string(),
		});
		match self.request(None, msg).await? {
			Msg::AuthToken(t) => Ok(t.token),
			other => Err(unexpected("AuthToken", &other)),
		}
	}

	/// Create a room owned by the token's user. Returns the room id.
	pub async fn create_chat(&self, identity_token: &str, name: &str) -> Result<i64, ClientError> {
		let msg = Msg::CreateChat(pb::CreateChat { name: name.to_string() });
		match self.request(Some((metadata::AUTHENTICATION, identity_token)), msg).await? {
			Msg::ChatCreated(c) => Ok(c.chat_id),
			other => Err(unexpected("ChatCreated", &other)),
		}
	}

	/// Owner-only.
	pub async fn add_user_to_chat(&self, identity_token: &str, chat_id: i64, user_id: i64) -> Result<(), ClientError> {
		let msg = Msg::AddUserToChat(pb::AddUserToChat { chat_id, user_id });
		match self.request(Some((metadata::AUTHENTICATION, identity_token)), msg).await? {
			Msg::Ack(_) => Ok(()),
			other => Err(unexpected("Ack", &other)),
		}
	}

	/// Return a room-join token for a room the token's user belongs to.
	pub async fn join_chat(&self, identity_token: &str, chat_id: i64) -> Result<String, ClientError> {
		let msg = Msg::JoinChat(pb::JoinChat { chat_id });
		match self.request(Some((metadata::AUTHENTICATION, identity_token)), msg).await? {
			Msg::JoinToken(t) => Ok(t.token),
			other => Err(unexpected("JoinToken", &other)),
		}
	}

	pub async fn ping(&self) -> Result<pb::Pong, ClientError> {
		let msg = Msg::Ping(pb::Ping {
			client_time_unix_ms: unix_ms_now(),
		});
		match self.request(None, msg).await? {
			Msg::Pong(p) => Ok(p),
			other => Err(unexpected("Pong", &other)),
		}
	}

	/// Open a chat stream with a room-join token.
	pub async fn connect_to_chat(&self, session_token: &str) -> Result<ChatSession, ClientError> {
		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientError::Io(format!("open_bi(chat) failed: {e}")))?;

		let env = self.envelope(Some((metadata::SESSION, session_token)), Msg::Connect(pb::Connect {}));
		write_envelope(&mut send, &env, self.max_frame_bytes).await?;

		let mut receiver = ChatReceiver {
			recv,
			decoder: FrameDecoder::new(self.max_frame_bytes),
		};
		let first = tokio::time::timeout(self.request_timeout, receiver.read_envelope())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for Connected after {:?}", self.request_timeout)))??;

		let connected = match first.and_then(|e| e.msg) {
			Some(Msg::Connected(c)) => c,
			Some(Msg::Error(e)) => return Err(e.into()),
			Some(other) => return Err(unexpected("Connected", &other)),
			None => return Err(ClientError::Protocol("chat stream closed before Connected".to_string())),
		};

		debug!(
			chat_id = connected.chat_id,
			connection_id = %connected.connection_id,
			"chat stream open"
		);

		Ok(ChatSession {
			sender: ChatSender {
				send,
				max_frame_bytes: self.max_frame_bytes,
			},
			receiver,
			connected,
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn request(&self, auth: Option<(&str, &str)>, msg: Msg) -> Result<Msg, ClientError> {
		let env = self.envelope(auth, msg);
		let request_id = env.request_id.clone();

		let exchange = async {
			let (mut send, recv) = self
				.conn
				.open_bi()
				.await
				.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;
			write_envelope(&mut send, &env, self.max_frame_bytes).await?;
			let _ = send.finish();

			let mut reader = ChatReceiver {
				recv,
				decoder: FrameDecoder::new(self.max_frame_bytes),
			};
			reader
				.read_envelope()
				.await?
				.ok_or_else(|| ClientError::Protocol("stream closed before response".to_string()))
		};

		let resp = tokio::time::timeout(self.request_timeout, exchange)
			.await
			.map_err(|_| ClientError::Protocol(format!("request timed out after {:?}", self.request_timeout)))??;

		if resp.request_id != request_id {
			return Err(ClientError::Protocol(format!(
				"response request_id {:?} does not match {request_id:?}",
				resp.request_id
			)));
		}

		match resp.msg {
			Some(Msg::Error(e)) => Err(e.into()),
			Some(m) => Ok(m),
			None => Err(ClientError::Protocol("empty response envelope".to_string())),
		}
	}

	fn envelope(&self, auth: Option<(&str, &str)>, msg: Msg) -> pb::Envelope {
		let n = self.next_request.fetch_add(1, Ordering::Relaxed);
		pb::Envelope {
			version: PROTOCOL_VERSION_U32,
			request_id: format!("r{n}"),
			metadata: auth
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.into_iter()
				.collect(),
			msg: Some(msg),
		}
	}
}

/// A live chat stream.
pub struct ChatSession {
	sender: ChatSender,
	receiver: ChatReceiver,
	connected: pb::Connected,
}

impl ChatSession {
	pub fn connected(&self) -> &pb::Connected {
		&self.connected
	}

	pub async fn send(&mut self, message: &str) -> Result<(), ClientError> {
		self.sender.send(message).await
	}

	pub async fn next_message(&mut self) -> Result<Option<pb::ChatMessage>, ClientError> {
		self.receiver.next_message().await
	}

	/// Split into halves that can live on different tasks.
	pub fn into_split(self) -> (ChatSender, ChatReceiver) {
		(self.sender, self.receiver)
	}
}

/// Outbound half of a chat stream.
pub struct ChatSender {
	send: quinn::SendStream,
	max_frame_bytes: usize,
}

impl ChatSender {
	pub async fn send(&mut self, message: &str) -> Result<(), ClientError> {
		let env = pb::Envelope {
			version: PROTOCOL_VERSION_U32,
			request_id: String::new(),
			metadata: Default::default(),
			msg: Some(Msg::SendMessage(pb::SendMessage {
				message: message.to_string(),
			})),
		};
		write_envelope(&mut self.send, &env, self.max_frame_bytes).await
	}

	/// Signal end of input; the server leaves the room.
	pub fn finish(&mut self) -> Result<(), ClientError> {
		self.send.finish().map_err(|e| ClientError::Io(e.to_string()))
	}
}

/// Inbound half of a chat stream.
pub struct ChatReceiver {
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
}

impl ChatReceiver {
	/// Next message from another member. `Ok(None)` when the server closed the stream.
	pub async fn next_message(&mut self) -> Result<Option<pb::ChatMessage>, ClientError> {
		loop {
			let Some(env) = self.read_envelope().await? else {
				return Ok(None);
			};
			match env.msg {
				Some(Msg::ChatMessage(m)) => return Ok(Some(m)),
				Some(Msg::Error(e)) => return Err(e.into()),
				Some(other) => return Err(unexpected("ChatMessage", &other)),
				None => continue,
			}
		}
	}

	async fn read_envelope(&mut self) -> Result<Option<pb::Envelope>, ClientError> {
		let mut tmp = [0u8; 8192];
		loop {
			if let Some(env) = self.decoder.next_frame::<pb::Envelope>()? {
				return Ok(Some(env));
			}

			match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => self.decoder.push(&tmp[..n]),
				Ok(None) if self.decoder.buffered() == 0 => return Ok(None),
				Ok(None) => {
					return Err(ClientError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			}
		}
	}
}

async fn write_envelope(send: &mut quinn::SendStream, env: &pb::Envelope, max_frame_bytes: usize) -> Result<(), ClientError> {
	let frame = encode_frame(env, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
	Ok(())
}

fn unexpected(expected: &str, got: &Msg) -> ClientError {
	match got {
		Msg::Error(e) => ClientError::Server {
			code: e.code.clone(),
			message: e.message.clone(),
		},
		other => ClientError::Protocol(format!("expected {expected}, got {other:?}")),
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(64));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_targets_local_server() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_addr.map(|a| a.port()), Some(DEFAULT_PORT));
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn endpoint_config_strips_ipv6_brackets() {
		let cfg = ClientConfig::from_quic_endpoint("quic://[::1]:9000").expect("parse");
		assert_eq!(cfg.server_host, "::1");
		assert_eq!(cfg.server_port, 9000);
		assert!(cfg.server_addr.is_none());

		assert!(matches!(
			ClientConfig::from_quic_endpoint("http://x:1"),
			Err(ClientError::Connect(_))
		));
	}

	#[test]
	fn server_errors_keep_their_code() {
		let e: ClientError = pb::Error {
			code: "NOT_FOUND".to_string(),
			message: "chat not found".to_string(),
		}
		.into();
		assert_eq!(e.server_code(), Some("NOT_FOUND"));
		assert_eq!(e.to_string(), "server error NOT_FOUND: chat not found");
		assert_eq!(ClientError::Io("x".into()).server_code(), None);
	}
}
