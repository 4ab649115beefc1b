use parley_protocol::pb::{self, envelope::Msg};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, decode_frame, encode_frame, metadata};
use proptest::prelude::*;

fn chat_envelope(body: &str) -> pb::Envelope {
	pb::Envelope {
		version: parley_protocol::version::PROTOCOL_VERSION_U32,
		request_id: "req-1".to_string(),
		metadata: Default::default(),
		msg: Some(Msg::SendMessage(pb::SendMessage {
			message: body.to_string(),
		})),
	}
}

#[test]
fn envelope_with_metadata_survives_framing() {
	let mut env = chat_envelope("hello");
	env.metadata.insert(metadata::SESSION.to_string(), "v1.abc.def".to_string());

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded.metadata.get(metadata::SESSION).map(String::as_str), Some("v1.abc.def"));
	match decoded.msg {
		Some(Msg::SendMessage(m)) => assert_eq!(m.message, "hello"),
		other => panic!("unexpected msg: {other:?}"),
	}
}

#[test]
fn chat_message_keeps_its_schema_tag() {
	use prost::Message as _;

	let env = pb::Envelope {
		msg: Some(Msg::ChatMessage(pb::ChatMessage {
			message: "hi".to_string(),
			..Default::default()
		})),
		..Default::default()
	};

	// field 22, length-delimited, then ChatMessage.message (field 1)
	assert_eq!(env.encode_to_vec(), vec![0xB2, 0x01, 0x04, 0x0A, 0x02, b'h', b'i']);

	let decoded = pb::Envelope::decode(&[0xB2, 0x01, 0x04, 0x0A, 0x02, b'h', b'i'][..]).expect("decode");
	assert_eq!(decoded, env);
}

#[test]
fn decode_requires_full_frame() {
	let frame = encode_frame(&chat_envelope(&"x".repeat(10)), DEFAULT_MAX_FRAME_SIZE).expect("encode");

	let err = decode_frame::<pb::Envelope>(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::InsufficientData { need, have } => {
			assert!(need > have);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn decoder_yields_nothing_until_frame_complete() {
	let env = chat_envelope("hello");
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");

	let mut dec = FrameDecoder::default();

	dec.push(&frame[..2]);
	assert!(dec.next_frame::<pb::Envelope>().expect("ok").is_none());

	dec.push(&frame[2..8]);
	assert!(dec.next_frame::<pb::Envelope>().expect("ok").is_none());

	dec.push(&frame[8..]);
	let decoded = dec.next_frame::<pb::Envelope>().expect("ok").expect("some");
	assert_eq!(decoded, env);
	assert_eq!(dec.buffered(), 0);
}

#[test]
fn encode_rejects_too_large() {
	let err = encode_frame(&chat_envelope(&"a".repeat(10_000)), 32).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn decoder_rejects_oversized_prefix() {
	let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
	dec.push(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	match dec.next_frame::<pb::Envelope>().unwrap_err() {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn garbage_payload_is_a_decode_error() {
	let mut dec = FrameDecoder::default();
	dec.push(&[0, 0, 0, 2, 0xff, 0xff]);

	match dec.next_frame::<pb::Envelope>().unwrap_err() {
		FramingError::Decode(_) => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn arbitrary_chunking_preserves_frame_order(
		bodies in proptest::collection::vec("[a-z ]{0,40}", 1..8),
		split_every in 1usize..17,
	) {
		let mut wire = Vec::new();
		for b in &bodies {
			wire.extend(encode_frame(&chat_envelope(b), DEFAULT_MAX_FRAME_SIZE).unwrap());
		}

		let mut dec = FrameDecoder::default();
		let mut seen = Vec::new();
		for chunk in wire.chunks(split_every) {
			dec.push(chunk);
			while let Some(env) = dec.next_frame::<pb::Envelope>().unwrap() {
				match env.msg {
					Some(Msg::SendMessage(m)) => seen.push(m.message),
					other => panic!("unexpected msg: {other:?}"),
				}
			}
		}

		prop_assert_eq!(seen, bodies);
		prop_assert_eq!(dec.buffered(), 0);
	}
}
