//! Server-side per-connection session
//!
//! A lounge owns one connection for its lifetime: it runs Hello and Auth,
//! binds to a workspace under the per-workspace mutex, then dispatches
//! incoming messages in a tight loop. Any handler error terminates the
//! loop, closes the connection and releases the workspace; the accept
//! loop keeps running.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::{Config, Role, WorkspaceConfig};
use crate::connection::{encode_ack_pairs, Connection};
use crate::crypto;
use crate::error::{AuthError, JanusError, ProtocolError};
use crate::extract::{move_into_place, tmp_path, ExtractorPool};
use crate::filter::RuleSet;
use crate::logging::*;
use crate::mmap::MemoryMappedFile;
use crate::plan::{decode_plan, Action, PlanNode};
use crate::protocol::{Message, MessageType};
use crate::tree::{encode_tree, glob_files_relative, now_millis, safe_join, NodeType};

/// Process-wide admission control: at most one lounge per `(role, name)`
pub struct WorkspaceRegistry {
	held: Mutex<HashSet<(Role, String)>>,
}

impl WorkspaceRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(WorkspaceRegistry { held: Mutex::new(HashSet::new()) })
	}

	/// Non-blocking exclusive acquisition; the guard releases on drop
	pub fn try_lock(self: &Arc<Self>, role: Role, name: &str) -> Option<WorkspaceGuard> {
		let key = (role, name.to_string());
		let mut held = match self.held.lock() {
			Ok(held) => held,
			Err(poisoned) => poisoned.into_inner(),
		};
		if held.insert(key.clone()) {
			Some(WorkspaceGuard { registry: Arc::clone(self), key })
		} else {
			None
		}
	}
}

pub struct WorkspaceGuard {
	registry: Arc<WorkspaceRegistry>,
	key: (Role, String),
}

impl Drop for WorkspaceGuard {
	fn drop(&mut self) {
		let mut held = match self.registry.held.lock() {
			Ok(held) => held,
			Err(poisoned) => poisoned.into_inner(),
		};
		held.remove(&self.key);
	}
}

/// Everything a bound session needs, torn down together
struct BoundWorkspace {
	ws: WorkspaceConfig,
	_guard: WorkspaceGuard,
	ignore: Arc<RuleSet>,
	protect: RuleSet,
	extractor: ExtractorPool,
	pending_file_acks: Vec<(u64, i32)>,
}

pub struct Lounge {
	conn: Connection,
	config: Arc<Config>,
	registry: Arc<WorkspaceRegistry>,
}

impl Lounge {
	pub fn new(conn: Connection, config: Arc<Config>, registry: Arc<WorkspaceRegistry>) -> Self {
		Lounge { conn, config, registry }
	}

	/// Run the session to completion; never panics the accept loop
	pub async fn run(mut self) {
		let peer = self.conn.peer().to_string();

		if let Err(e) = self.conn.hello_server().await {
			warn!("Hello with {} failed: {}", peer, e);
			self.conn.close().await;
			return;
		}

		let mut bound = match self.authenticate().await {
			Ok(bound) => bound,
			Err(e) => {
				warn!("Auth with {} failed: {}", peer, e);
				self.conn.close().await;
				return;
			}
		};
		info!("{} bound to workspace '{}'", peer, bound.ws.name);

		match self.dispatch(&mut bound).await {
			Ok(()) => info!("{} finished cleanly", peer),
			Err(JanusError::Disconnected) => info!("{} disconnected", peer),
			Err(e) => error!("Session with {} aborted: {}", peer, e),
		}
		self.conn.close().await;
		// Dropping `bound` releases the workspace mutex
	}

	/// Server side of the challenge-response handshake plus admission
	///
	/// Auth goes through all its motions even for an unknown workspace so
	/// that a probing client cannot enumerate names by timing.
	async fn authenticate(&mut self) -> Result<BoundWorkspace, JanusError> {
		let name_bytes = match self.conn.recv_expect(MessageType::Auth).await? {
			Message::Auth { payload } => payload,
			_ => unreachable!(),
		};
		let name = String::from_utf8_lossy(&name_bytes).into_owned();
		let workspace = self.config.find_workspace(&name).cloned();

		let challenge = crypto::random_challenge();
		self.conn.send(&Message::Auth { payload: challenge.clone() }).await?;

		let response = match self.conn.recv_expect(MessageType::Auth).await? {
			Message::Auth { payload } => payload,
			_ => unreachable!(),
		};

		let ws = match workspace {
			Some(ws) => ws,
			None => {
				self.conn.send(&Message::fail(1, "authentication failed")).await?;
				return Err(AuthError::UnknownWorkspace { name }.into());
			}
		};

		let verified = match &ws.aes_key {
			Some(secret) => {
				let key = crypto::derive_key(secret);
				crypto::decrypt_challenge(&key, &response)
					.map(|p| p == challenge)
					.unwrap_or(false)
			}
			None => response == challenge,
		};
		if !verified {
			self.conn.send(&Message::fail(1, "authentication failed")).await?;
			return Err(AuthError::ChallengeMismatch.into());
		}

		let guard = match self.registry.try_lock(ws.role, &ws.name) {
			Some(guard) => guard,
			None => {
				self.conn
					.send(&Message::fail(2, "workspace is locked by another client"))
					.await?;
				return Err(JanusError::WorkspaceBusy { workspace: ws.name });
			}
		};

		self.conn.send(&Message::ok()).await?;

		let ignore = Arc::new(RuleSet::parse(&ws.ignore_patterns)?);
		let protect = RuleSet::parse(&ws.protect_patterns)?;
		let extractor = ExtractorPool::new(&ws.path);
		Ok(BoundWorkspace {
			ws,
			_guard: guard,
			ignore,
			protect,
			extractor,
			pending_file_acks: Vec::new(),
		})
	}

	async fn dispatch(&mut self, bound: &mut BoundWorkspace) -> Result<(), JanusError> {
		loop {
			let msg = self.conn.recv().await?;
			trace!("Handling {}", msg.message_type().name());
			match msg {
				Message::FetchFileTree => self.handle_fetch_tree(bound).await?,
				Message::GetSystemTimeMillis => {
					let data = (now_millis() as u64).to_be_bytes().to_vec();
					self.conn.send(&Message::ok_with_data(data)).await?;
				}
				Message::CommitSyncPlan { subtrees } => {
					self.handle_commit(bound, subtrees).await?
				}
				Message::UploadFile { nonce, perm, size, path } => {
					self.handle_upload_file(bound, nonce, perm, size, &path).await?
				}
				Message::UploadArchive { seq_id, archive_size } => {
					self.handle_upload_archive(bound, seq_id, archive_size).await?
				}
				Message::ConfirmArchives { no_block } => {
					let pairs = bound.extractor.check_extracted(!no_block).await;
					self.conn.send(&Message::ok_with_data(encode_ack_pairs(&pairs))).await?;
				}
				Message::ConfirmFiles => {
					let pairs = std::mem::take(&mut bound.pending_file_acks);
					self.conn.send(&Message::ok_with_data(encode_ack_pairs(&pairs))).await?;
				}
				Message::Bye => {
					self.conn.send(&Message::Bye).await?;
					return Ok(());
				}
				other => {
					return Err(ProtocolError::UnexpectedMessage {
						expected: "a request",
						got: other.message_type().name(),
					}
					.into())
				}
			}
		}
	}

	async fn handle_fetch_tree(&mut self, bound: &mut BoundWorkspace) -> Result<(), JanusError> {
		let tree = glob_files_relative(&bound.ws.path, &bound.ignore).await?;
		let data = match &tree {
			Some(tree) => encode_tree(tree),
			None => Vec::new(),
		};
		self.conn.send(&Message::ok_with_data(data)).await
	}

	async fn handle_commit(
		&mut self,
		bound: &mut BoundWorkspace,
		subtrees: Vec<Vec<u8>>,
	) -> Result<(), JanusError> {
		let mut deleted = 0usize;
		let mut created = 0usize;
		for bytes in &subtrees {
			let plan = decode_plan(bytes)?;
			apply_plan(&bound.ws.path, &plan, &bound.protect, &mut deleted, &mut created)?;
		}
		debug!("Plan committed: {} deleted, {} directories ensured", deleted, created);
		self.conn.send(&Message::ok()).await
	}

	async fn handle_upload_file(
		&mut self,
		bound: &mut BoundWorkspace,
		nonce: u64,
		perm: u32,
		size: u64,
		path: &str,
	) -> Result<(), JanusError> {
		// A traversal attempt on the single-file path aborts the connection
		let target = safe_join(&bound.ws.path, path)?;
		if let Some(parent) = target.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let tmp = tmp_path(&target);
		let mut mapped = match MemoryMappedFile::create_rw(&tmp, size, Some(perm)) {
			Ok(mapped) => Some(mapped),
			Err(e) => {
				warn!("Cannot create {}: {}", tmp.display(), e);
				None
			}
		};
		let mut failed = mapped.is_none();

		// The byte budget must be consumed even when the disk side failed
		self.conn
			.recv_data_blocks(size, |payload| {
				if failed {
					return Ok(());
				}
				if let Some(mapped) = mapped.as_mut() {
					if let Err(e) = mapped.write(&payload) {
						warn!("Write to {} failed: {}", tmp.display(), e);
						failed = true;
					}
				}
				Ok(())
			})
			.await?;

		if let Some(mut mapped) = mapped {
			if !failed {
				if let Err(e) = mapped.force() {
					warn!("Flush of {} failed: {}", tmp.display(), e);
					failed = true;
				}
			}
			mapped.close();
		}

		if failed {
			let _ = tokio::fs::remove_file(&tmp).await;
		} else if let Err(e) = move_into_place(&tmp, &target).await {
			warn!("Move into {} failed: {}", target.display(), e);
			failed = true;
		}

		bound.pending_file_acks.push((nonce, i32::from(failed)));
		Ok(())
	}

	async fn handle_upload_archive(
		&mut self,
		bound: &mut BoundWorkspace,
		seq_id: u64,
		archive_size: u64,
	) -> Result<(), JanusError> {
		let tx = bound.extractor.begin(seq_id, archive_size);

		let mut remaining = archive_size;
		let mut sink_gone = false;
		while remaining > 0 {
			let payload = match self.conn.recv_expect(MessageType::DataBlock).await? {
				Message::DataBlock { payload } => payload,
				_ => unreachable!(),
			};
			if payload.len() as u64 > remaining {
				return Err(ProtocolError::InvalidField { what: "DataBlock overrun" }.into());
			}
			remaining -= payload.len() as u64;
			if !sink_gone && tx.send(payload).await.is_err() {
				// Extractor task died; keep consuming so the stream stays
				// framed, the status drain will report the failure
				sink_gone = true;
			}
		}
		drop(tx);

		self.conn.send(&Message::ok()).await
	}
}

/// Apply one plan subtree under the workspace root
///
/// DELETE_REMOTE honours the protect rules down to individual entries:
/// a protected file keeps its ancestor directories alive. UPLOAD nodes
/// only touch directories here; file payloads arrive separately.
fn apply_plan(
	root: &Path,
	node: &PlanNode,
	protect: &RuleSet,
	deleted: &mut usize,
	created: &mut usize,
) -> Result<(), JanusError> {
	let rel = node.path.to_string_lossy();
	let abs = if rel.is_empty() { root.to_path_buf() } else { safe_join(root, &rel)? };

	match node.action {
		Action::DeleteRemote => {
			if delete_with_protect(&abs, &node.path, protect)? {
				*deleted += 1;
			}
			// Nothing lives below a deletion
			return Ok(());
		}
		Action::Upload => match node.node_type {
			NodeType::Directory => {
				std::fs::create_dir_all(&abs)?;
				*created += 1;
			}
			NodeType::File => {
				if let Some(parent) = abs.parent() {
					std::fs::create_dir_all(parent)?;
					*created += 1;
				}
			}
			_ => {}
		},
		Action::None => {}
	}

	for child in &node.children {
		apply_plan(root, child, protect, deleted, created)?;
	}
	Ok(())
}

/// Delete a file or directory tree, sparing protected entries
///
/// Returns whether the entry was fully removed; a directory survives when
/// any descendant is protected.
fn delete_with_protect(abs: &Path, rel: &Path, protect: &RuleSet) -> Result<bool, JanusError> {
	let meta = match std::fs::symlink_metadata(abs) {
		Ok(meta) => meta,
		// Already gone is as good as deleted
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
		Err(e) => return Err(e.into()),
	};
	let is_dir = meta.is_dir();

	if protect.matches(rel, is_dir) {
		info!("Protected, not deleting: {}", rel.display());
		return Ok(false);
	}

	if is_dir {
		let mut all_removed = true;
		for entry in std::fs::read_dir(abs)? {
			let entry = entry?;
			let child_abs = entry.path();
			let child_rel = rel.join(entry.file_name());
			if !delete_with_protect(&child_abs, &child_rel, protect)? {
				all_removed = false;
			}
		}
		if all_removed {
			std::fs::remove_dir(abs)?;
		}
		Ok(all_removed)
	} else {
		std::fs::remove_file(abs)?;
		Ok(true)
	}
}


// vim: ts=4
