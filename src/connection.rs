//! Stateful request/response layer over a socket
//!
//! One `Connection` owns one socket exclusively. All frames are strictly
//! serialised: a sender never interleaves frames of different logical
//! operations, and DataBlocks following an UploadFile/UploadArchive header
//! belong to that operation until its byte budget is consumed. Uploads may
//! be pipelined; ACKs accumulate server-side until a confirm drain.

use std::time::Duration;

use crate::crypto;
use crate::error::{JanusError, ProtocolError};
use crate::logging::*;
use crate::mmap::MemoryMappedFile;
use crate::plan::{encode_plan, PlanNode};
use crate::protocol::message::Cursor;
use crate::protocol::{pool, Message, MessageType, DATA_BLOCK_SIZE, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
use crate::socket::JanusSocket;
use crate::tree::{decode_tree, now_millis, TreeNode};

pub struct Connection {
	socket: JanusSocket,
}

impl Connection {
	pub fn new(socket: JanusSocket) -> Self {
		Connection { socket }
	}

	pub fn peer(&self) -> &str {
		self.socket.peer()
	}

	pub async fn close(&mut self) {
		self.socket.close().await;
	}

	/// Write one framed message
	pub async fn send(&mut self, msg: &Message) -> Result<(), JanusError> {
		let frame = msg.encode();
		self.socket.write_all(&frame).await?;
		self.socket.flush().await?;
		Ok(())
	}

	/// Write a DataBlock frame around `payload` without an intermediate copy
	pub async fn send_data_block(&mut self, payload: &[u8]) -> Result<(), JanusError> {
		let mut header = [0u8; HEADER_LEN];
		header[0..4].copy_from_slice(&MAGIC);
		header[4..8].copy_from_slice(&MessageType::DataBlock.code().to_be_bytes());
		header[8..16].copy_from_slice(&(payload.len() as u64).to_be_bytes());
		self.socket.write_all(&header).await?;
		self.socket.write_all(payload).await?;
		self.socket.flush().await?;
		Ok(())
	}

	/// Read and decode the next framed message
	pub async fn recv(&mut self) -> Result<Message, JanusError> {
		let mut header = [0u8; HEADER_LEN];
		self.socket.read_exact(&mut header).await?;
		let (msg_type, body_len) = Message::decode_header(&header)?;

		let mut body = pool::acquire_body(msg_type, body_len as usize);
		body.resize(body_len as usize, 0);
		self.socket.read_exact(&mut body).await?;

		let msg = Message::decode_body(msg_type, &body);
		pool::recycle_body(msg_type, body);
		Ok(msg?)
	}

	/// Read the next message and insist on its type
	pub async fn recv_expect(&mut self, expected: MessageType) -> Result<Message, JanusError> {
		let msg = self.recv().await?;
		if msg.message_type() != expected {
			return Err(ProtocolError::UnexpectedMessage {
				expected: expected.name(),
				got: msg.message_type().name(),
			}
			.into());
		}
		Ok(msg)
	}

	/// Unwrap a CommonResponse, returning its data payload on code 0
	pub async fn recv_ok(&mut self) -> Result<Vec<u8>, JanusError> {
		match self.recv_expect(MessageType::CommonResponse).await? {
			Message::CommonResponse { code: 0, data, .. } => Ok(data),
			Message::CommonResponse { code, message, .. } => {
				Err(ProtocolError::ResponseCode { code, message }.into())
			}
			_ => unreachable!("recv_expect checked the type"),
		}
	}

	///////////
	// Hello //
	///////////

	/// Client half of the three-message handshake
	pub async fn hello_client(&mut self) -> Result<u64, JanusError> {
		self.send(&Message::Hello { versions: vec![PROTOCOL_VERSION] }).await?;
		let chosen = match self.recv_expect(MessageType::Hello).await? {
			Message::Hello { versions } => check_version(versions)?,
			_ => unreachable!(),
		};
		// One confirming Hello closes the handshake
		self.send(&Message::Hello { versions: vec![chosen] }).await?;
		Ok(chosen)
	}

	/// Server half: receive, echo the chosen version, await confirmation
	pub async fn hello_server(&mut self) -> Result<u64, JanusError> {
		let chosen = match self.recv_expect(MessageType::Hello).await? {
			Message::Hello { versions } => check_version(versions)?,
			_ => unreachable!(),
		};
		self.send(&Message::Hello { versions: vec![chosen] }).await?;
		match self.recv_expect(MessageType::Hello).await? {
			Message::Hello { versions } => check_version(versions)?,
			_ => unreachable!(),
		};
		Ok(chosen)
	}

	//////////
	// Auth //
	//////////

	/// Client side of the challenge-response handshake
	///
	/// Without a configured key the challenge is echoed verbatim, which
	/// only authenticates anything when the transport itself does.
	pub async fn auth_client(
		&mut self,
		workspace_name: &str,
		key: Option<&[u8]>,
	) -> Result<(), JanusError> {
		self.send(&Message::Auth { payload: workspace_name.as_bytes().to_vec() }).await?;

		let challenge = match self.recv_expect(MessageType::Auth).await? {
			Message::Auth { payload } => payload,
			_ => unreachable!(),
		};

		let response = match key {
			Some(secret) => {
				let key = crypto::derive_key(secret);
				crypto::encrypt_challenge(&key, &challenge)?
			}
			None => challenge,
		};
		self.send(&Message::Auth { payload: response }).await?;

		self.recv_ok().await?;
		Ok(())
	}

	/////////////////
	// Client ops  //
	/////////////////

	/// Round-trip a clock probe; returns remote − local − rtt/2 in millis
	pub async fn probe_clock(&mut self) -> Result<i64, JanusError> {
		let t0 = now_millis();
		self.send(&Message::GetSystemTimeMillis).await?;
		let data = self.recv_ok().await?;
		let t1 = now_millis();

		let mut cur = Cursor::new(&data);
		let server_millis = cur.get_u64("system time")? as i64;
		let rtt = t1 - t0;
		let skew = server_millis - t0 - rtt / 2;
		debug!("Clock probe: server={} rtt={}ms skew={}ms", server_millis, rtt, skew);
		Ok(skew)
	}

	/// Fetch the remote tree; empty data means an empty workspace
	pub async fn fetch_file_tree(&mut self) -> Result<Option<TreeNode>, JanusError> {
		self.send(&Message::FetchFileTree).await?;
		let data = self.recv_ok().await?;
		if data.is_empty() {
			return Ok(None);
		}
		Ok(Some(decode_tree(&data)?))
	}

	/// Ship the whole plan forest in one message
	pub async fn commit_plan(&mut self, forest: &[PlanNode]) -> Result<(), JanusError> {
		let subtrees = forest.iter().map(encode_plan).collect();
		self.send(&Message::CommitSyncPlan { subtrees }).await?;
		self.recv_ok().await?;
		Ok(())
	}

	/// Stream one large file; the ACK arrives later via `confirm_files`
	pub async fn upload_file(
		&mut self,
		nonce: u64,
		perm: u32,
		path: &str,
		mapped: &mut MemoryMappedFile,
	) -> Result<(), JanusError> {
		let size = mapped.len();
		self.send(&Message::UploadFile { nonce, perm, size, path: pathlike(path) }).await?;

		let mut chunk = vec![0u8; DATA_BLOCK_SIZE.min(size.max(1) as usize)];
		let mut offset = 0u64;
		while offset < size {
			let step = (size - offset).min(chunk.len() as u64) as usize;
			mapped.read_at(&mut chunk[..step], offset)?;
			self.send_data_block(&chunk[..step]).await?;
			offset += step as u64;
		}
		Ok(())
	}

	/// Ship a serialised archive; the per-archive status arrives later via
	/// `confirm_archives`, the response here only covers the upload
	pub async fn upload_archive(&mut self, seq_id: u64, bytes: &[u8]) -> Result<(), JanusError> {
		self.send(&Message::UploadArchive { seq_id, archive_size: bytes.len() as u64 }).await?;
		for chunk in bytes.chunks(DATA_BLOCK_SIZE.max(1)) {
			self.send_data_block(chunk).await?;
		}
		self.recv_ok().await?;
		Ok(())
	}

	/// Drain completed archive statuses
	pub async fn confirm_archives(
		&mut self,
		no_block: bool,
	) -> Result<Vec<(u64, i32)>, JanusError> {
		self.send(&Message::ConfirmArchives { no_block }).await?;
		let data = self.recv_ok().await?;
		decode_ack_pairs(&data)
	}

	/// Drain accumulated per-file ACKs
	pub async fn confirm_files(&mut self) -> Result<Vec<(u64, i32)>, JanusError> {
		self.send(&Message::ConfirmFiles).await?;
		let data = self.recv_ok().await?;
		decode_ack_pairs(&data)
	}

	/// Say goodbye and wait for the server's Bye
	pub async fn bye(&mut self) -> Result<(), JanusError> {
		self.send(&Message::Bye).await?;
		match self.recv().await {
			Ok(Message::Bye) => Ok(()),
			Ok(other) => Err(ProtocolError::UnexpectedMessage {
				expected: "Bye",
				got: other.message_type().name(),
			}
			.into()),
			// A peer that closes right after Bye is fine
			Err(JanusError::Disconnected) => Ok(()),
			Err(e) => Err(e),
		}
	}

	//////////////////
	// Server side  //
	//////////////////

	/// Receive DataBlocks totalling exactly `total` bytes, handing each
	/// payload to `sink` in arrival order
	pub async fn recv_data_blocks<F>(
		&mut self,
		total: u64,
		mut sink: F,
	) -> Result<(), JanusError>
	where
		F: FnMut(Vec<u8>) -> Result<(), JanusError>,
	{
		let mut remaining = total;
		while remaining > 0 {
			let payload = match self.recv_expect(MessageType::DataBlock).await? {
				Message::DataBlock { payload } => payload,
				_ => unreachable!(),
			};
			if payload.len() as u64 > remaining {
				return Err(ProtocolError::InvalidField { what: "DataBlock overrun" }.into());
			}
			remaining -= payload.len() as u64;
			sink(payload)?;
		}
		Ok(())
	}

	/// Optional-deadline raw read used by transports layered on top
	pub async fn read_some(
		&mut self,
		buf: &mut [u8],
		deadline: Option<Duration>,
	) -> Result<usize, JanusError> {
		self.socket.read_some(buf, deadline).await
	}
}

fn check_version(versions: Vec<u64>) -> Result<u64, JanusError> {
	match versions.first() {
		Some(&v) if v == PROTOCOL_VERSION => Ok(v),
		_ => Err(ProtocolError::VersionMismatch { offered: versions }.into()),
	}
}

/// Normalise a relative path to wire form with `/` separators
pub fn pathlike(path: &str) -> String {
	if std::path::MAIN_SEPARATOR == '/' {
		path.to_string()
	} else {
		path.replace(std::path::MAIN_SEPARATOR, "/")
	}
}

/// Encode drained ACKs as repeated `{id:u64, code:i32}`
pub fn encode_ack_pairs(pairs: &[(u64, i32)]) -> Vec<u8> {
	let mut buf = Vec::with_capacity(pairs.len() * 12);
	for (id, code) in pairs {
		buf.extend_from_slice(&id.to_be_bytes());
		buf.extend_from_slice(&code.to_be_bytes());
	}
	buf
}

pub fn decode_ack_pairs(data: &[u8]) -> Result<Vec<(u64, i32)>, JanusError> {
	if data.len() % 12 != 0 {
		return Err(ProtocolError::InvalidField { what: "ACK pair list" }.into());
	}
	let mut cur = Cursor::new(data);
	let mut pairs = Vec::with_capacity(data.len() / 12);
	while cur.remaining() > 0 {
		let id = cur.get_u64("ACK id")?;
		let code = cur.get_i32("ACK code")?;
		pairs.push((id, code));
	}
	Ok(pairs)
}


// vim: ts=4
