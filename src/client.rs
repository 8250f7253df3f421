//! Client driver: one full push of a workspace to the server
//!
//! Phases: connect and handshake, then clock probe + remote tree fetch
//! overlapped with the local walk, plan build and commit, the transfer
//! walk (archives for small files, UploadFile for large ones), the ACK
//! drains, and Bye with a throughput report.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::archive::{SmallFilesHolder, SMALL_FILE_MAX};
use crate::config::WorkspaceConfig;
use crate::connection::{pathlike, Connection};
use crate::error::{JanusError, ProtocolError};
use crate::filter::RuleSet;
use crate::logging::*;
use crate::mmap::MemoryMappedFile;
use crate::plan::{build_plan, Action, PlanNode};
use crate::socket::JanusSocket;
use crate::tls;
use crate::tree::{glob_files_relative, NodeType};

/// Outstanding per-file ACKs above this trigger an opportunistic drain
const PENDING_ACK_DRAIN_THRESHOLD: usize = 256;

/// What a completed run did
#[derive(Debug, Default)]
pub struct SyncReport {
	pub plan_actions: usize,
	pub files_uploaded: usize,
	pub archives_uploaded: usize,
	pub bytes_sent: u64,
	pub elapsed_millis: u64,
}

impl SyncReport {
	pub fn throughput_mib_s(&self) -> f64 {
		if self.elapsed_millis == 0 {
			return 0.0;
		}
		(self.bytes_sent as f64 / (1024.0 * 1024.0)) / (self.elapsed_millis as f64 / 1000.0)
	}
}

/// Push the workspace to its server and return the transfer report
pub async fn run_client(ws: &WorkspaceConfig) -> Result<SyncReport, JanusError> {
	let started = Instant::now();

	let host = ws.host.as_deref().unwrap_or("127.0.0.1");
	let port = ws.port.unwrap_or(crate::config::DEFAULT_PORT);
	let stream = TcpStream::connect((host, port)).await?;
	let socket = match &ws.tls {
		Some(material) => {
			let config = tls::client_config(&material.cert)?;
			JanusSocket::connect_tls(stream, config).await?
		}
		None => {
			warn!("Transport is cleartext; configure TLS for untrusted networks");
			JanusSocket::plain(stream)
		}
	};
	let mut conn = Connection::new(socket);

	conn.hello_client().await?;
	match conn.auth_client(&ws.remote_name, ws.aes_key.as_deref()).await {
		Err(JanusError::Protocol(ProtocolError::ResponseCode { code: 2, .. })) => {
			return Err(JanusError::WorkspaceBusy { workspace: ws.remote_name.clone() })
		}
		other => other?,
	}
	info!("Authenticated against workspace '{}' on {}:{}", ws.remote_name, host, port);

	// The local walk proceeds while the two remote round-trips run
	let rules = Arc::new(RuleSet::parse(&ws.ignore_patterns)?);
	let walk_path = ws.path.clone();
	let walk_rules = Arc::clone(&rules);
	let walker: JoinHandle<Result<_, JanusError>> =
		tokio::spawn(async move { glob_files_relative(&walk_path, &walk_rules).await });

	let skew = conn.probe_clock().await?;
	let remote_tree = conn.fetch_file_tree().await?;
	let local_tree = walker.await??;

	let forest = build_plan(local_tree.as_ref(), remote_tree.as_ref(), skew);
	let plan_actions: usize = forest.iter().map(count_actions).sum();
	info!("Plan has {} actions (skew {} ms)", plan_actions, skew);

	conn.commit_plan(&forest).await?;

	let mut report = SyncReport { plan_actions, ..SyncReport::default() };
	transfer(&mut conn, ws, &forest, &mut report).await?;

	conn.bye().await?;
	conn.close().await;

	report.elapsed_millis = started.elapsed().as_millis() as u64;
	info!(
		"Synced {} files + {} archives, {} bytes in {} ms ({:.1} MiB/s)",
		report.files_uploaded,
		report.archives_uploaded,
		report.bytes_sent,
		report.elapsed_millis,
		report.throughput_mib_s()
	);
	Ok(report)
}

fn count_actions(node: &PlanNode) -> usize {
	let own = usize::from(node.action != Action::None);
	own + node.children.iter().map(count_actions).sum::<usize>()
}

/// Breadth-first list of files the plan wants uploaded
fn collect_upload_files(forest: &[PlanNode]) -> Vec<PathBuf> {
	let mut files = Vec::new();
	let mut queue: VecDeque<&PlanNode> = forest.iter().collect();
	while let Some(node) = queue.pop_front() {
		if node.action == Action::Upload && node.node_type == NodeType::File {
			files.push(node.path.clone());
		}
		for child in &node.children {
			queue.push_back(child);
		}
	}
	files
}

async fn transfer(
	conn: &mut Connection,
	ws: &WorkspaceConfig,
	forest: &[PlanNode],
	report: &mut SyncReport,
) -> Result<(), JanusError> {
	let files = collect_upload_files(forest);

	let mut holder = SmallFilesHolder::new(&ws.path);
	let mut packing: Option<JoinHandle<Result<Vec<u8>, JanusError>>> = None;
	let mut next_seq: u64 = 0;
	let mut in_flight_archives: HashSet<u64> = HashSet::new();
	let mut pending_nonces: HashSet<u64> = HashSet::new();
	let mut failures = 0usize;

	for rel in files {
		let abs = ws.path.join(&rel);
		let meta = match tokio::fs::metadata(&abs).await {
			Ok(meta) => meta,
			Err(e) => {
				// File vanished between walk and transfer
				warn!("Skipping {}: {}", abs.display(), e);
				continue;
			}
		};
		let size = meta.len();
		let perm = file_perm(&meta);
		let rel_str = pathlike(&rel.to_string_lossy());

		if size <= SMALL_FILE_MAX {
			holder.add(rel_str, perm, size);
			if holder.is_nearly_full() {
				// Ship the previously packed archive, then freeze this one
				// into a background packing task
				flush_packed(conn, &mut packing, &mut next_seq, &mut in_flight_archives, report)
					.await?;
				let mut frozen =
					std::mem::replace(&mut holder, SmallFilesHolder::new(&ws.path));
				packing = Some(tokio::task::spawn_blocking(move || frozen.to_bytes()));
			}
		} else {
			let mut mapped = MemoryMappedFile::open_read(&abs)?;
			let nonce: u64 = rand::random();
			conn.upload_file(nonce, perm, &rel_str, &mut mapped).await?;
			mapped.close();
			pending_nonces.insert(nonce);
			report.files_uploaded += 1;
			report.bytes_sent += size;

			if pending_nonces.len() > PENDING_ACK_DRAIN_THRESHOLD {
				failures += drain_file_acks(conn, &mut pending_nonces).await?;
			}
		}
	}

	// Flush the packing pipeline and whatever remains in the holder
	flush_packed(conn, &mut packing, &mut next_seq, &mut in_flight_archives, report).await?;
	if !holder.is_empty() {
		let bytes = holder.to_bytes()?;
		send_archive(conn, bytes, &mut next_seq, &mut in_flight_archives, report).await?;
	}

	// Drain all archive statuses
	while !in_flight_archives.is_empty() {
		for (seq_id, status) in conn.confirm_archives(false).await? {
			if !in_flight_archives.remove(&seq_id) {
				warn!("Unknown archive seq {} in drain", seq_id);
			}
			if status != 0 {
				error!("Archive {} failed on the server", seq_id);
				failures += 1;
			}
		}
	}

	// Final per-file drain; FIFO ordering guarantees all ACKs are in
	if !pending_nonces.is_empty() {
		failures += drain_file_acks(conn, &mut pending_nonces).await?;
	}
	if !pending_nonces.is_empty() {
		return Err(JanusError::Other {
			message: format!("{} file ACKs never arrived", pending_nonces.len()),
		});
	}
	if failures > 0 {
		return Err(JanusError::Other {
			message: format!("{} transfers failed on the server", failures),
		});
	}
	Ok(())
}

async fn flush_packed(
	conn: &mut Connection,
	packing: &mut Option<JoinHandle<Result<Vec<u8>, JanusError>>>,
	next_seq: &mut u64,
	in_flight: &mut HashSet<u64>,
	report: &mut SyncReport,
) -> Result<(), JanusError> {
	if let Some(handle) = packing.take() {
		let bytes = handle.await??;
		send_archive(conn, bytes, next_seq, in_flight, report).await?;
	}
	Ok(())
}

async fn send_archive(
	conn: &mut Connection,
	bytes: Vec<u8>,
	next_seq: &mut u64,
	in_flight: &mut HashSet<u64>,
	report: &mut SyncReport,
) -> Result<(), JanusError> {
	if bytes.is_empty() {
		return Ok(());
	}
	let seq_id = *next_seq;
	*next_seq += 1;
	conn.upload_archive(seq_id, &bytes).await?;
	in_flight.insert(seq_id);
	report.archives_uploaded += 1;
	report.bytes_sent += bytes.len() as u64;
	Ok(())
}

async fn drain_file_acks(
	conn: &mut Connection,
	pending: &mut HashSet<u64>,
) -> Result<usize, JanusError> {
	let mut failures = 0usize;
	for (nonce, code) in conn.confirm_files().await? {
		if !pending.remove(&nonce) {
			warn!("Unknown nonce {} in ACK drain", nonce);
		}
		if code != 0 {
			error!("File with nonce {} failed on the server", nonce);
			failures += 1;
		}
	}
	Ok(failures)
}

#[cfg(unix)]
fn file_perm(meta: &std::fs::Metadata) -> u32 {
	use std::os::unix::fs::PermissionsExt;
	meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_perm(meta: &std::fs::Metadata) -> u32 {
	if meta.permissions().readonly() {
		0o444
	} else {
		0o644
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn upload_file_node(path: &str) -> PlanNode {
		PlanNode {
			name: path.rsplit('/').next().unwrap().to_string(),
			node_type: NodeType::File,
			path: PathBuf::from(path),
			action: Action::Upload,
			children: vec![],
		}
	}

	#[test]
	fn collect_walks_breadth_first() {
		let forest = vec![PlanNode {
			name: String::new(),
			node_type: NodeType::Directory,
			path: PathBuf::new(),
			action: Action::None,
			children: vec![
				upload_file_node("top.txt"),
				PlanNode {
					name: "sub".to_string(),
					node_type: NodeType::Directory,
					path: PathBuf::from("sub"),
					action: Action::Upload,
					children: vec![upload_file_node("sub/deep.txt")],
				},
			],
		}];
		let files = collect_upload_files(&forest);
		assert_eq!(files, vec![PathBuf::from("top.txt"), PathBuf::from("sub/deep.txt")]);
	}

	#[test]
	fn deletes_are_not_uploads() {
		let forest = vec![PlanNode {
			name: "gone.txt".to_string(),
			node_type: NodeType::File,
			path: PathBuf::from("gone.txt"),
			action: Action::DeleteRemote,
			children: vec![],
		}];
		assert!(collect_upload_files(&forest).is_empty());
	}

	#[test]
	fn throughput_math() {
		let report = SyncReport {
			bytes_sent: 10 * 1024 * 1024,
			elapsed_millis: 2000,
			..SyncReport::default()
		};
		assert!((report.throughput_mib_s() - 5.0).abs() < 0.001);
	}
}

// vim: ts=4
