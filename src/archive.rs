//! Small-file archive packing
//!
//! Files at or below `SMALL_FILE_MAX` are shipped batched inside a single
//! archive stream to amortise per-file protocol overhead. An archive is a
//! plain concatenation of entries, each `path_len:u32 ‖ perm:u32 ‖
//! data_len:u64 ‖ path ‖ data`, repeated until the declared archive size
//! is consumed.

use std::path::{Path, PathBuf};

use crate::error::{JanusError, ProtocolError};
use crate::logging::*;
use crate::mmap::MemoryMappedFile;

/// Inclusive upper bound for the archive path; larger files go one-per-message
pub const SMALL_FILE_MAX: u64 = 256 * 1024;

/// An archive at or past this size rolls over on the next add
pub const ARCHIVE_SIZE_LIMIT: u64 = 128 * 1024 * 1024;

/// An archive with this many entries rolls over on the next add
pub const ARCHIVE_ENTRY_LIMIT: usize = 1024;

/// Fixed part of an entry header
pub const ENTRY_FIXED_LEN: usize = 16;

/// A file queued into the current archive
#[derive(Debug, Clone)]
pub struct PendingEntry {
	/// Workspace-relative path with `/` separators
	pub rel_path: String,
	pub abs_path: PathBuf,
	pub perm: u32,
	pub size: u64,
}

impl PendingEntry {
	fn wire_len(&self) -> u64 {
		ENTRY_FIXED_LEN as u64 + self.rel_path.len() as u64 + self.size
	}
}

/// Decoded fixed header of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
	pub path_len: u32,
	pub perm: u32,
	pub data_len: u64,
}

impl EntryHeader {
	pub fn decode(bytes: &[u8; ENTRY_FIXED_LEN]) -> Result<Self, ProtocolError> {
		let path_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
		let perm = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
		let data_len = u64::from_be_bytes([
			bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
		]);
		if path_len == 0 || path_len > 4096 {
			return Err(ProtocolError::InvalidField { what: "archive entry path length" });
		}
		Ok(EntryHeader { path_len, perm, data_len })
	}

	pub fn encode(&self, path: &str, buf: &mut Vec<u8>) {
		buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
		buf.extend_from_slice(&self.perm.to_be_bytes());
		buf.extend_from_slice(&self.data_len.to_be_bytes());
		buf.extend_from_slice(path.as_bytes());
	}
}

/// Accumulator for the archive currently being filled on the client
///
/// `add` queues a file and grows the anticipated on-wire size;
/// `is_nearly_full` turns true once either rollover bound is reached, so
/// the caller freezes the holder and starts a new one. `to_bytes` reads
/// every payload through a memory mapping, concatenates the entries and
/// resets the holder.
pub struct SmallFilesHolder {
	root: PathBuf,
	entries: Vec<PendingEntry>,
	anticipated_size: u64,
}

impl SmallFilesHolder {
	pub fn new(root: &Path) -> Self {
		SmallFilesHolder {
			root: root.to_path_buf(),
			entries: Vec::new(),
			anticipated_size: 0,
		}
	}

	/// Queue a workspace-relative file
	pub fn add(&mut self, rel_path: String, perm: u32, size: u64) {
		let abs_path = self.root.join(&rel_path);
		let entry = PendingEntry { rel_path, abs_path, perm, size };
		self.anticipated_size += entry.wire_len();
		self.entries.push(entry);
	}

	pub fn is_nearly_full(&self) -> bool {
		self.anticipated_size >= ARCHIVE_SIZE_LIMIT || self.entries.len() >= ARCHIVE_ENTRY_LIMIT
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn anticipated_size(&self) -> u64 {
		self.anticipated_size
	}

	/// Serialise all queued entries into one linear buffer and reset
	///
	/// Files that vanished or shrank since the walk are skipped with a
	/// warning; the archive stays consistent because each entry declares
	/// its own length.
	pub fn to_bytes(&mut self) -> Result<Vec<u8>, JanusError> {
		let mut buf = Vec::with_capacity(self.anticipated_size as usize);
		for entry in self.entries.drain(..) {
			let mapped = match MemoryMappedFile::open_read(&entry.abs_path) {
				Ok(mapped) => mapped,
				Err(e) => {
					warn!("Skipping {}: {}", entry.abs_path.display(), e);
					continue;
				}
			};
			let data_len = mapped.len();
			let header = EntryHeader {
				path_len: entry.rel_path.len() as u32,
				perm: entry.perm,
				data_len,
			};
			header.encode(&entry.rel_path, &mut buf);

			let start = buf.len();
			buf.resize(start + data_len as usize, 0);
			if let Err(e) = mapped.read_at(&mut buf[start..], 0) {
				warn!("Skipping {}: {}", entry.abs_path.display(), e);
				buf.truncate(start - ENTRY_FIXED_LEN - entry.rel_path.len());
			}
		}
		self.anticipated_size = 0;
		Ok(buf)
	}
}


// vim: ts=4
