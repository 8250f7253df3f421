//! Concurrent archive extraction on the receiving side
//!
//! Each uploaded archive is parsed by its own task, fed through a bounded
//! byte-block channel so a slow disk stalls the network receiver instead
//! of buffering without limit. Entries are written to a temp file through
//! a memory mapping and renamed over the target; entries whose path would
//! escape the workspace root are consumed and discarded with a warning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::archive::{EntryHeader, ENTRY_FIXED_LEN};
use crate::error::JanusError;
use crate::logging::*;
use crate::mmap::MemoryMappedFile;
use crate::tree::safe_join;

/// Backpressure bound of the per-archive byte channel, in blocks
pub const CHANNEL_BLOCKS: usize = 192;

/// Suffix of in-progress files next to their target
pub const TMP_SUFFIX: &str = ".janus-sync-tmp";

/// Write granularity when draining entry payloads
const COPY_CHUNK: usize = 256 * 1024;

/// `target.janus-sync-tmp` next to the target
pub fn tmp_path(target: &Path) -> PathBuf {
	let mut name = target
		.file_name()
		.map(|n| n.to_os_string())
		.unwrap_or_default();
	name.push(TMP_SUFFIX);
	let mut tmp = target.to_path_buf();
	tmp.set_file_name(name);
	tmp
}

/// Replace `target` with the fully written `tmp` file
///
/// Rename is atomic on POSIX; when it fails (e.g. the target is on a
/// different mount semantics than expected) the target is removed first
/// and the rename retried, deleting the temp file if that fails too.
pub async fn move_into_place(tmp: &Path, target: &Path) -> Result<(), JanusError> {
	match tokio::fs::rename(tmp, target).await {
		Ok(()) => Ok(()),
		Err(first) => {
			let _ = tokio::fs::remove_file(target).await;
			match tokio::fs::rename(tmp, target).await {
				Ok(()) => Ok(()),
				Err(_) => {
					let _ = tokio::fs::remove_file(tmp).await;
					Err(first.into())
				}
			}
		}
	}
}

/// Pulls byte blocks off the channel and serves bounded reads
struct BlockReader {
	rx: mpsc::Receiver<Vec<u8>>,
	current: Vec<u8>,
	pos: usize,
	consumed: u64,
	limit: u64,
}

impl BlockReader {
	fn new(rx: mpsc::Receiver<Vec<u8>>, limit: u64) -> Self {
		BlockReader { rx, current: Vec::new(), pos: 0, consumed: 0, limit }
	}

	fn remaining(&self) -> u64 {
		self.limit - self.consumed
	}

	async fn fill(&mut self) -> Result<(), JanusError> {
		while self.pos >= self.current.len() {
			match self.rx.recv().await {
				Some(block) => {
					self.current = block;
					self.pos = 0;
				}
				None => return Err(JanusError::Disconnected),
			}
		}
		Ok(())
	}

	async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), JanusError> {
		if buf.len() as u64 > self.remaining() {
			return Err(JanusError::Protocol(crate::error::ProtocolError::Truncated {
				what: "archive stream",
			}));
		}
		let mut filled = 0usize;
		while filled < buf.len() {
			self.fill().await?;
			let n = (buf.len() - filled).min(self.current.len() - self.pos);
			buf[filled..filled + n].copy_from_slice(&self.current[self.pos..self.pos + n]);
			self.pos += n;
			filled += n;
		}
		self.consumed += buf.len() as u64;
		Ok(())
	}

	async fn skip(&mut self, mut n: u64) -> Result<(), JanusError> {
		let mut scratch = vec![0u8; COPY_CHUNK];
		while n > 0 {
			let step = n.min(COPY_CHUNK as u64) as usize;
			self.read_exact(&mut scratch[..step]).await?;
			n -= step as u64;
		}
		Ok(())
	}
}

struct ExtractTask {
	seq_id: u64,
	handle: JoinHandle<i32>,
}

/// One extractor pool per lounge; tasks run concurrently with the receive
/// loop and report per-archive status through `check_extracted`
pub struct ExtractorPool {
	root: Arc<PathBuf>,
	tasks: Vec<ExtractTask>,
}

impl ExtractorPool {
	pub fn new(root: &Path) -> Self {
		ExtractorPool { root: Arc::new(root.to_path_buf()), tasks: Vec::new() }
	}

	pub fn in_flight(&self) -> usize {
		self.tasks.len()
	}

	/// Start extraction of one archive; feed the returned sender with the
	/// incoming DataBlock payloads
	pub fn begin(&mut self, seq_id: u64, archive_size: u64) -> mpsc::Sender<Vec<u8>> {
		let (tx, rx) = mpsc::channel(CHANNEL_BLOCKS);
		let root = Arc::clone(&self.root);
		let handle = tokio::spawn(async move {
			match extract_archive(&root, rx, archive_size).await {
				Ok(()) => 0,
				Err(e) => {
					error!("Archive {} extraction failed: {}", seq_id, e);
					1
				}
			}
		});
		self.tasks.push(ExtractTask { seq_id, handle });
		tx
	}

	/// Collect completed archives as `(seq_id, status)` pairs
	///
	/// With `block_until_some` set and nothing ready, awaits the first
	/// in-flight task instead of returning empty.
	pub async fn check_extracted(&mut self, block_until_some: bool) -> Vec<(u64, i32)> {
		let mut done = Vec::new();

		let mut i = 0;
		while i < self.tasks.len() {
			if self.tasks[i].handle.is_finished() {
				let task = self.tasks.swap_remove(i);
				let status = task.handle.await.unwrap_or(1);
				done.push((task.seq_id, status));
			} else {
				i += 1;
			}
		}

		if done.is_empty() && block_until_some && !self.tasks.is_empty() {
			let (result, idx, _) =
				futures::future::select_all(self.tasks.iter_mut().map(|t| &mut t.handle)).await;
			let task = self.tasks.swap_remove(idx);
			done.push((task.seq_id, result.unwrap_or(1)));
		}

		done
	}
}

impl Drop for ExtractorPool {
	fn drop(&mut self) {
		for task in &self.tasks {
			task.handle.abort();
		}
	}
}

async fn extract_archive(
	root: &Path,
	rx: mpsc::Receiver<Vec<u8>>,
	archive_size: u64,
) -> Result<(), JanusError> {
	let mut reader = BlockReader::new(rx, archive_size);
	let mut failed = false;

	while reader.remaining() > 0 {
		let mut fixed = [0u8; ENTRY_FIXED_LEN];
		reader.read_exact(&mut fixed).await?;
		let header = EntryHeader::decode(&fixed)?;

		let mut path_bytes = vec![0u8; header.path_len as usize];
		reader.read_exact(&mut path_bytes).await?;
		let rel = match String::from_utf8(path_bytes) {
			Ok(rel) => rel,
			Err(_) => {
				warn!("Archive entry with non-UTF-8 path skipped");
				reader.skip(header.data_len).await?;
				failed = true;
				continue;
			}
		};

		let target = match safe_join(root, &rel) {
			Ok(target) => target,
			Err(_) => {
				warn!("Archive entry escapes workspace root, skipped: {}", rel);
				reader.skip(header.data_len).await?;
				continue;
			}
		};

		if let Err(e) = write_entry(&mut reader, &target, &header).await {
			warn!("Failed to extract {}: {}", rel, e);
			failed = true;
		}
	}

	if failed {
		Err(JanusError::Other { message: "One or more archive entries failed".to_string() })
	} else {
		Ok(())
	}
}

async fn write_entry(
	reader: &mut BlockReader,
	target: &Path,
	header: &EntryHeader,
) -> Result<(), JanusError> {
	if let Some(parent) = target.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}

	let tmp = tmp_path(target);
	let mut mapped = match MemoryMappedFile::create_rw(&tmp, header.data_len, Some(header.perm)) {
		Ok(mapped) => mapped,
		Err(e) => {
			// The stream must stay consistent even when the entry is lost
			reader.skip(header.data_len).await?;
			return Err(e);
		}
	};

	let mut remaining = header.data_len;
	let mut chunk = vec![0u8; COPY_CHUNK.min(header.data_len as usize).max(1)];
	while remaining > 0 {
		let step = remaining.min(chunk.len() as u64) as usize;
		if let Err(e) = reader.read_exact(&mut chunk[..step]).await {
			mapped.close();
			let _ = tokio::fs::remove_file(&tmp).await;
			return Err(e);
		}
		if let Err(e) = mapped.write(&chunk[..step]) {
			mapped.close();
			let _ = tokio::fs::remove_file(&tmp).await;
			reader.skip(remaining - step as u64).await?;
			return Err(e);
		}
		remaining -= step as u64;
	}

	mapped.force()?;
	mapped.close();
	move_into_place(&tmp, target).await
}


// vim: ts=4
