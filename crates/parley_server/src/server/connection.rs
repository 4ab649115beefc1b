#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use parley_protocol::pb::envelope::Msg;
use parley_protocol::version::PROTOCOL_VERSION_U32;
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, codes, encode_frame, metadata, pb};
use parley_util::time::unix_ms_now;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::chat::{ChatOrchestrator, InboundMessages};
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::identity::Identity;

const READ_CHUNK: usize = 8192;

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// Outbound queue depth of a chat stream.
	pub sink_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			sink_queue_capacity: 256,
		}
	}
}

/// Serve one QUIC connection: every client-opened bidirectional stream is one RPC
/// or one chat stream, handled on its own task.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	chat: ChatOrchestrator,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut stream_seq: u64 = 0;
	loop {
		let (send, recv) = match connection.accept_bi().await {
			Ok(s) => s,
			Err(e) => {
				debug!(conn_id, reason = %e, "connection closed");
				break;
			}
		};

		stream_seq += 1;
		let stream_id = stream_seq;
		let chat = chat.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_stream(conn_id, send, recv, chat, settings).await {
				debug!(conn_id, stream_id, error = %format!("{e:#}"), "stream ended with error");
			}
		});
	}

	Ok(())
}

async fn handle_stream(
	conn_id: u64,
	mut send: quinn::SendStream,
	mut recv: quinn::RecvStream,
	chat: ChatOrchestrator,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let mut decoder = FrameDecoder::new(settings.max_frame_bytes);
	let Some(first) = read_envelope(&mut recv, &mut decoder).await? else {
		return Ok(());
	};
	metrics::counter!("parley_server_envelopes_in_total").increment(1);

	let pb::Envelope {
		request_id,
		metadata,
		msg,
		..
	} = first;

	let Some(msg) = msg else {
		let err = protocol_error("envelope carries no message");
		send_envelope(&mut send, reply(request_id, Msg::Error(err)), settings.max_frame_bytes).await?;
		return finish(send);
	};

	if let Msg::Connect(_) = msg {
		return run_chat_stream(conn_id, send, recv, decoder, request_id, &metadata, chat, settings).await;
	}

	let kind = request_kind(&msg);
	metrics::counter!("parley_server_requests_total", "kind" => kind).increment(1);

	let answer = match answer_request(&chat, &metadata, msg).await {
		Ok(m) => m,
		Err(e) => {
			metrics::counter!("parley_server_request_errors_total", "kind" => kind, "code" => e.code.clone())
				.increment(1);
			Msg::Error(e)
		}
	};

	send_envelope(&mut send, reply(request_id, answer), settings.max_frame_bytes).await?;
	finish(send)
}

async fn answer_request(
	chat: &ChatOrchestrator,
	metadata: &HashMap<String, String>,
	msg: Msg,
) -> Result<Msg, pb::Error> {
	let result: ServiceResult<Msg> = match msg {
		Msg::SignUp(req) => chat
			.identity()
			.sign_up(&req.login, &req.password)
			.await
			.map(|token| Msg::AuthToken(pb::AuthToken { token })),
		Msg::SignIn(req) => chat
			.identity()
			.sign_in(&req.login, &req.password)
			.await
			.map(|token| Msg::AuthToken(pb::AuthToken { token })),
		Msg::CreateChat(req) => match caller(chat, metadata) {
			Ok(who) => chat
				.create_chat(who.user_id, &req.name)
				.await
				.map(|id| Msg::ChatCreated(pb::ChatCreated { chat_id: id.get() })),
			Err(e) => Err(e),
		},
		Msg::AddUserToChat(req) => match caller(chat, metadata) {
			Ok(who) => chat
				.add_user_to_chat(who.user_id, req.chat_id.into(), req.user_id.into())
				.await
				.map(|()| Msg::Ack(pb::Ack {})),
			Err(e) => Err(e),
		},
		Msg::JoinChat(req) => match caller(chat, metadata) {
			Ok(who) => chat
				.join_chat(who.user_id, req.chat_id.into())
				.await
				.map(|token| Msg::JoinToken(pb::JoinToken { token })),
			Err(e) => Err(e),
		},
		Msg::Ping(p) => Ok(Msg::Pong(pb::Pong {
			client_time_unix_ms: p.client_time_unix_ms,
			server_time_unix_ms: unix_ms_now(),
		})),
		other => {
			return Err(protocol_error(&format!(
				"unexpected request on a new stream: {}",
				request_kind(&other)
			)));
		}
	};

	result.map_err(|e| {
		if let ServiceError::Internal(inner) = &e {
			warn!(error = %format!("{inner:#}"), "request failed");
		}
		e.to_pb()
	})
}

/// Identity behind the `authentication` metadata entry.
fn caller(chat: &ChatOrchestrator, metadata: &HashMap<String, String>) -> ServiceResult<Identity> {
	let token = metadata_token(metadata, metadata::AUTHENTICATION)?;
	chat.identity().authenticate(token)
}

fn metadata_token<'a>(metadata: &'a HashMap<String, String>, key: &str) -> ServiceResult<&'a str> {
	metadata
		.get(key)
		.map(|v| v.trim())
		.filter(|v| !v.is_empty())
		.ok_or(ServiceError::InvalidToken)
}

#[allow(clippy::too_many_arguments)]
async fn run_chat_stream(
	conn_id: u64,
	mut send: quinn::SendStream,
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
	request_id: String,
	metadata: &HashMap<String, String>,
	chat: ChatOrchestrator,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let max_frame = settings.max_frame_bytes;

	let admitted = match metadata_token(metadata, metadata::SESSION) {
		Ok(token) => chat.admit(token).await,
		Err(e) => Err(e),
	};
	let admission = match admitted {
		Ok(a) => a,
		Err(e) => {
			info!(conn_id, code = e.code(), "chat: admission refused");
			metrics::counter!("parley_server_admissions_refused_total").increment(1);
			send_envelope(&mut send, reply(request_id, Msg::Error(e.to_pb())), max_frame).await?;
			return finish(send);
		}
	};

	let (sink, mut outbound) = mpsc::channel(settings.sink_queue_capacity.max(1));
	let session = chat.open_session(admission, sink);
	let connected = pb::Connected {
		chat_id: session.admission().chat_id.get(),
		user_id: session.admission().user_id.get(),
		connection_id: session.connection_id().to_string(),
	};
	send_envelope(&mut send, reply(request_id, Msg::Connected(connected)), max_frame).await?;

	// ends once the registry has dropped the sink
	let writer = tokio::spawn(async move {
		while let Some(msg) = outbound.recv().await {
			let frame = pb::ChatMessage {
				message: msg.message.clone(),
				sender_user_id: msg.user_id.get(),
				chat_id: msg.chat_id.get(),
				sender_login: msg.login.clone(),
			};
			if let Err(e) = send_envelope(&mut send, reply(String::new(), Msg::ChatMessage(frame)), max_frame).await {
				debug!(conn_id, error = %e, "chat: writer stopped");
				break;
			}
		}
		send
	});

	let inbound = StreamInbound {
		recv,
		decoder,
		max_frame_bytes: max_frame,
	};
	let outcome = session.run(inbound).await;

	let mut send = writer.await.context("chat writer task")?;
	if let Err(e) = outcome {
		let _ = send_envelope(&mut send, reply(String::new(), Msg::Error(e.to_pb())), max_frame).await;
	}
	finish(send)
}

/// Inbound side of a chat stream: `SendMessage` frames decoded straight off the QUIC stream.
struct StreamInbound {
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
	max_frame_bytes: usize,
}

#[async_trait]
impl InboundMessages for StreamInbound {
	async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
		loop {
			let frame = self
				.decoder
				.next_frame::<pb::Envelope>()
				.map_err(|e| anyhow!(e).context("decode chat frame"))?;

			if let Some(env) = frame {
				metrics::counter!("parley_server_envelopes_in_total").increment(1);
				match env.msg {
					Some(Msg::SendMessage(m)) => return Ok(Some(m.message)),
					Some(Msg::Ping(_)) => continue,
					Some(other) => {
						return Err(anyhow!("unexpected {} frame on chat stream", request_kind(&other)));
					}
					None => continue,
				}
			}

			if !fill(&mut self.recv, &mut self.decoder).await? {
				if self.decoder.buffered() > 0 {
					debug!(
						buffered = self.decoder.buffered(),
						max_frame_bytes = self.max_frame_bytes,
						"chat: stream ended mid-frame"
					);
				}
				return Ok(None);
			}
		}
	}
}

async fn read_envelope(recv: &mut quinn::RecvStream, decoder: &mut FrameDecoder) -> anyhow::Result<Option<pb::Envelope>> {
	loop {
		if let Some(env) = decoder
			.next_frame::<pb::Envelope>()
			.map_err(|e| anyhow!(e).context("decode request frame"))?
		{
			return Ok(Some(env));
		}
		if !fill(recv, decoder).await? {
			if decoder.buffered() > 0 {
				return Err(anyhow!("stream ended mid-frame ({} bytes buffered)", decoder.buffered()));
			}
			return Ok(None);
		}
	}
}

/// Read one chunk into `decoder`. `false` on end of stream.
async fn fill(recv: &mut quinn::RecvStream, decoder: &mut FrameDecoder) -> anyhow::Result<bool> {
	let mut tmp = [0u8; READ_CHUNK];
	match recv.read(&mut tmp).await.context("stream read")? {
		Some(n) => {
			metrics::counter!("parley_server_bytes_in_total").increment(n as u64);
			decoder.push(&tmp[..n]);
			Ok(true)
		}
		None => Ok(false),
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope, max_frame_size: usize) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame_size).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_envelopes_out_total").increment(1);
	metrics::counter!("parley_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

fn finish(mut send: quinn::SendStream) -> anyhow::Result<()> {
	// already reset by the peer is fine
	let _ = send.finish();
	Ok(())
}

fn reply(request_id: String, msg: Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION_U32,
		request_id,
		metadata: HashMap::new(),
		msg: Some(msg),
	}
}

fn protocol_error(message: &str) -> pb::Error {
	pb::Error {
		code: codes::PROTOCOL_ERROR.to_string(),
		message: message.to_string(),
	}
}

fn request_kind(msg: &Msg) -> &'static str {
	match msg {
		Msg::SignUp(_) => "sign_up",
		Msg::SignIn(_) => "sign_in",
		Msg::AuthToken(_) => "auth_token",
		Msg::CreateChat(_) => "create_chat",
		Msg::ChatCreated(_) => "chat_created",
		Msg::AddUserToChat(_) => "add_user_to_chat",
		Msg::Ack(_) => "ack",
		Msg::JoinChat(_) => "join_chat",
		Msg::JoinToken(_) => "join_token",
		Msg::Connect(_) => "connect",
		Msg::Connected(_) => "connected",
		Msg::SendMessage(_) => "send_message",
		Msg::ChatMessage(_) => "chat_message",
		Msg::Error(_) => "error",
		Msg::Ping(_) => "ping",
		Msg::Pong(_) => "pong",
	}
}
