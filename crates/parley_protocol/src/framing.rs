#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Length prefix size in bytes (big-endian u32).
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default maximum frame payload size for v1. Chat frames are small.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

fn check_len(len: usize, max: usize) -> Result<(), FramingError> {
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}
	Ok(())
}

fn peek_len(src: &[u8]) -> Option<usize> {
	let prefix: [u8; LENGTH_PREFIX_LEN] = src.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
	Some(u32::from_be_bytes(prefix) as usize)
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload_len);
	out.put_u32(payload_len as u32);
	msg.encode(&mut out)?;
	Ok(out.to_vec())
}

/// Decode one frame from the start of `src`, returning the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let len = peek_len(src).ok_or(FramingError::InsufficientData {
		need: LENGTH_PREFIX_LEN,
		have: src.len(),
	})?;
	check_len(len, max_frame_size)?;

	let need = LENGTH_PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[LENGTH_PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
///
/// Bytes are pushed as they arrive from the transport; `next_frame` yields a
/// message once a whole frame is buffered.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_size,
		}
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Bytes buffered but not yet decoded.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		let Some(len) = peek_len(&self.buf) else {
			return Ok(None);
		};
		check_len(len, self.max_frame_size)?;

		if self.buf.len() < LENGTH_PREFIX_LEN + len {
			return Ok(None);
		}

		self.buf.advance(LENGTH_PREFIX_LEN);
		let payload = self.buf.split_to(len);
		Ok(Some(M::decode(payload.freeze())?))
	}
}

impl Default for FrameDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}
