//! Framed message codec
//!
//! Encoding is infallible; decoding validates the header magic, the type
//! code and the body length before any body byte is interpreted. All
//! integers are big-endian, strings are UTF-8, paths use `/` separators
//! regardless of platform.

use crate::error::ProtocolError;
use crate::protocol::{HEADER_LEN, MAGIC, MAX_BODY_LEN};

/// Registry of message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
	Hello = 0x1000,
	Auth = 0x1001,
	GetSystemTimeMillis = 0x1801,
	FetchFileTree = 0x2001,
	CommitSyncPlan = 0x2002,
	UploadFile = 0x2003,
	UploadArchive = 0x2004,
	ConfirmArchives = 0x2005,
	ConfirmFiles = 0x2006,
	Bye = 0x2007,
	CommonResponse = 0xA001,
	DataBlock = 0xA002,
}

impl MessageType {
	pub fn code(self) -> u32 {
		self as u32
	}

	pub fn from_code(code: u32) -> Option<Self> {
		match code {
			0x1000 => Some(MessageType::Hello),
			0x1001 => Some(MessageType::Auth),
			0x1801 => Some(MessageType::GetSystemTimeMillis),
			0x2001 => Some(MessageType::FetchFileTree),
			0x2002 => Some(MessageType::CommitSyncPlan),
			0x2003 => Some(MessageType::UploadFile),
			0x2004 => Some(MessageType::UploadArchive),
			0x2005 => Some(MessageType::ConfirmArchives),
			0x2006 => Some(MessageType::ConfirmFiles),
			0x2007 => Some(MessageType::Bye),
			0xA001 => Some(MessageType::CommonResponse),
			0xA002 => Some(MessageType::DataBlock),
			_ => None,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			MessageType::Hello => "Hello",
			MessageType::Auth => "Auth",
			MessageType::GetSystemTimeMillis => "GetSystemTimeMillis",
			MessageType::FetchFileTree => "FetchFileTree",
			MessageType::CommitSyncPlan => "CommitSyncPlan",
			MessageType::UploadFile => "UploadFile",
			MessageType::UploadArchive => "UploadArchive",
			MessageType::ConfirmArchives => "ConfirmArchives",
			MessageType::ConfirmFiles => "ConfirmFiles",
			MessageType::Bye => "Bye",
			MessageType::CommonResponse => "CommonResponse",
			MessageType::DataBlock => "DataBlock",
		}
	}
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// Protocol version negotiation, first version is the preferred one
	Hello { versions: Vec<u64> },

	/// Workspace name, random challenge or encrypted challenge, depending
	/// on the handshake step
	Auth { payload: Vec<u8> },

	GetSystemTimeMillis,

	FetchFileTree,

	/// Serialised plan subtrees, each length-prefixed
	CommitSyncPlan { subtrees: Vec<Vec<u8>> },

	/// Header for a single-file transfer; `size` bytes of DataBlocks follow
	UploadFile { nonce: u64, perm: u32, size: u64, path: String },

	/// Header for an archive transfer; `archive_size` bytes of DataBlocks follow
	UploadArchive { seq_id: u64, archive_size: u64 },

	ConfirmArchives { no_block: bool },

	ConfirmFiles,

	Bye,

	/// Code 0 means success; `data` carries an operation-specific payload
	CommonResponse { code: i32, message: String, data: Vec<u8> },

	/// Opaque payload bytes belonging to the preceding upload operation
	DataBlock { payload: Vec<u8> },
}

impl Message {
	pub fn message_type(&self) -> MessageType {
		match self {
			Message::Hello { .. } => MessageType::Hello,
			Message::Auth { .. } => MessageType::Auth,
			Message::GetSystemTimeMillis => MessageType::GetSystemTimeMillis,
			Message::FetchFileTree => MessageType::FetchFileTree,
			Message::CommitSyncPlan { .. } => MessageType::CommitSyncPlan,
			Message::UploadFile { .. } => MessageType::UploadFile,
			Message::UploadArchive { .. } => MessageType::UploadArchive,
			Message::ConfirmArchives { .. } => MessageType::ConfirmArchives,
			Message::ConfirmFiles => MessageType::ConfirmFiles,
			Message::Bye => MessageType::Bye,
			Message::CommonResponse { .. } => MessageType::CommonResponse,
			Message::DataBlock { .. } => MessageType::DataBlock,
		}
	}

	/// Shorthand for a bare success response
	pub fn ok() -> Message {
		Message::CommonResponse { code: 0, message: String::new(), data: Vec::new() }
	}

	/// Success response carrying a payload
	pub fn ok_with_data(data: Vec<u8>) -> Message {
		Message::CommonResponse { code: 0, message: String::new(), data }
	}

	/// Failure response with a message
	pub fn fail(code: i32, message: impl Into<String>) -> Message {
		Message::CommonResponse { code, message: message.into(), data: Vec::new() }
	}

	/// Encode the full frame (header + body) into a fresh buffer
	pub fn encode(&self) -> Vec<u8> {
		let mut body = Vec::new();
		self.encode_body(&mut body);

		let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
		frame.extend_from_slice(&MAGIC);
		frame.extend_from_slice(&self.message_type().code().to_be_bytes());
		frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
		frame.extend_from_slice(&body);
		frame
	}

	/// Append the type-specific body to `buf`
	pub fn encode_body(&self, buf: &mut Vec<u8>) {
		match self {
			Message::Hello { versions } => {
				for v in versions {
					buf.extend_from_slice(&v.to_be_bytes());
				}
			}
			Message::Auth { payload } => buf.extend_from_slice(payload),
			Message::GetSystemTimeMillis
			| Message::FetchFileTree
			| Message::ConfirmFiles
			| Message::Bye => {}
			Message::CommitSyncPlan { subtrees } => {
				for tree in subtrees {
					buf.extend_from_slice(&(tree.len() as u64).to_be_bytes());
					buf.extend_from_slice(tree);
				}
			}
			Message::UploadFile { nonce, perm, size, path } => {
				buf.extend_from_slice(&nonce.to_be_bytes());
				buf.extend_from_slice(&perm.to_be_bytes());
				buf.extend_from_slice(&0u32.to_be_bytes());
				buf.extend_from_slice(&size.to_be_bytes());
				buf.extend_from_slice(path.as_bytes());
			}
			Message::UploadArchive { seq_id, archive_size } => {
				buf.extend_from_slice(&seq_id.to_be_bytes());
				buf.extend_from_slice(&archive_size.to_be_bytes());
			}
			Message::ConfirmArchives { no_block } => {
				buf.extend_from_slice(&(*no_block as u32).to_be_bytes());
			}
			Message::CommonResponse { code, message, data } => {
				buf.extend_from_slice(&code.to_be_bytes());
				buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
				buf.extend_from_slice(message.as_bytes());
				buf.extend_from_slice(data);
			}
			Message::DataBlock { payload } => buf.extend_from_slice(payload),
		}
	}

	/// Validate a 16-byte header and return the type and body length
	pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(MessageType, u64), ProtocolError> {
		if header[0..4] != MAGIC {
			let mut got = [0u8; 4];
			got.copy_from_slice(&header[0..4]);
			return Err(ProtocolError::BadMagic { got });
		}

		let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
		let msg_type =
			MessageType::from_code(code).ok_or(ProtocolError::UnknownType { code })?;

		let mut len_bytes = [0u8; 8];
		len_bytes.copy_from_slice(&header[8..16]);
		let body_len = u64::from_be_bytes(len_bytes);
		if body_len > MAX_BODY_LEN {
			return Err(ProtocolError::OversizeBody { len: body_len });
		}

		Ok((msg_type, body_len))
	}

	/// Decode a body of the given type
	pub fn decode_body(msg_type: MessageType, body: &[u8]) -> Result<Message, ProtocolError> {
		let mut cur = Cursor::new(body);
		let msg = match msg_type {
			MessageType::Hello => {
				if body.len() % 8 != 0 {
					return Err(ProtocolError::InvalidField { what: "Hello versions" });
				}
				let mut versions = Vec::with_capacity(body.len() / 8);
				while cur.remaining() > 0 {
					versions.push(cur.get_u64("Hello version")?);
				}
				Message::Hello { versions }
			}
			MessageType::Auth => Message::Auth { payload: body.to_vec() },
			MessageType::GetSystemTimeMillis => Message::GetSystemTimeMillis,
			MessageType::FetchFileTree => Message::FetchFileTree,
			MessageType::CommitSyncPlan => {
				let mut subtrees = Vec::new();
				while cur.remaining() > 0 {
					let len = cur.get_u64("plan subtree length")?;
					let bytes = cur.get_bytes(len as usize, "plan subtree")?;
					subtrees.push(bytes.to_vec());
				}
				Message::CommitSyncPlan { subtrees }
			}
			MessageType::UploadFile => {
				let nonce = cur.get_u64("UploadFile nonce")?;
				let perm = cur.get_u32("UploadFile perm")?;
				let _reserved = cur.get_u32("UploadFile reserved")?;
				let size = cur.get_u64("UploadFile size")?;
				let path = cur.rest_utf8("UploadFile path")?;
				Message::UploadFile { nonce, perm, size, path }
			}
			MessageType::UploadArchive => {
				let seq_id = cur.get_u64("UploadArchive seq_id")?;
				let archive_size = cur.get_u64("UploadArchive size")?;
				Message::UploadArchive { seq_id, archive_size }
			}
			MessageType::ConfirmArchives => {
				let no_block = cur.get_u32("ConfirmArchives no_block")?;
				if no_block > 1 {
					return Err(ProtocolError::InvalidField { what: "ConfirmArchives no_block" });
				}
				Message::ConfirmArchives { no_block: no_block == 1 }
			}
			MessageType::ConfirmFiles => Message::ConfirmFiles,
			MessageType::Bye => Message::Bye,
			MessageType::CommonResponse => {
				let code = cur.get_i32("CommonResponse code")?;
				let msg_len = cur.get_u32("CommonResponse msg_len")?;
				let msg_bytes = cur.get_bytes(msg_len as usize, "CommonResponse msg")?;
				let message = String::from_utf8(msg_bytes.to_vec())
					.map_err(|_| ProtocolError::InvalidField { what: "CommonResponse msg" })?;
				let data = cur.rest().to_vec();
				Message::CommonResponse { code, message, data }
			}
			MessageType::DataBlock => Message::DataBlock { payload: body.to_vec() },
		};
		Ok(msg)
	}
}

/// Bounds-checked byte cursor used by body decoders
pub struct Cursor<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	pub fn new(buf: &'a [u8]) -> Self {
		Cursor { buf, pos: 0 }
	}

	pub fn remaining(&self) -> usize {
		self.buf.len() - self.pos
	}

	pub fn get_bytes(
		&mut self,
		len: usize,
		what: &'static str,
	) -> Result<&'a [u8], ProtocolError> {
		if self.remaining() < len {
			return Err(ProtocolError::Truncated { what });
		}
		let slice = &self.buf[self.pos..self.pos + len];
		self.pos += len;
		Ok(slice)
	}

	pub fn get_u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
		Ok(self.get_bytes(1, what)?[0])
	}

	pub fn get_u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
		let b = self.get_bytes(2, what)?;
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}

	pub fn get_u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
		let b = self.get_bytes(4, what)?;
		Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	pub fn get_i32(&mut self, what: &'static str) -> Result<i32, ProtocolError> {
		let b = self.get_bytes(4, what)?;
		Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	pub fn get_u64(&mut self, what: &'static str) -> Result<u64, ProtocolError> {
		let b = self.get_bytes(8, what)?;
		Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
	}

	pub fn get_i64(&mut self, what: &'static str) -> Result<i64, ProtocolError> {
		let b = self.get_bytes(8, what)?;
		Ok(i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
	}

	pub fn rest(&mut self) -> &'a [u8] {
		let slice = &self.buf[self.pos..];
		self.pos = self.buf.len();
		slice
	}

	pub fn rest_utf8(&mut self, what: &'static str) -> Result<String, ProtocolError> {
		String::from_utf8(self.rest().to_vec())
			.map_err(|_| ProtocolError::InvalidField { what })
	}
}


// vim: ts=4
