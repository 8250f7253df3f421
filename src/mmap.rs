//! Memory-mapped file I/O
//!
//! Files are mapped whole, either read-only (upload source) or read-write
//! after create+truncate (receive target). Mappings larger than
//! `SEGMENT_SIZE` are split into consecutive segments so that platforms
//! capping a single mapping at 31-bit sizes still work; reads and writes
//! copy across segment boundaries transparently.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::JanusError;
use crate::logging::*;

/// Upper bound of a single mapping segment
pub const SEGMENT_SIZE: u64 = 1 << 30;

enum Mapping {
	ReadOnly(Vec<Mmap>),
	ReadWrite(Vec<MmapMut>),
}

/// A whole-file memory mapping with bounded positional reads and writes
///
/// `read`/`write` advance internal positions; `read_at`/`write_at` take an
/// explicit offset. Any access past the file size fails with `OutOfRange`.
/// `close` is idempotent and also runs on drop.
pub struct MemoryMappedFile {
	path: PathBuf,
	file: Option<File>,
	mapping: Option<Mapping>,
	len: u64,
	read_pos: u64,
	write_pos: u64,
}

impl MemoryMappedFile {
	/// Map an existing file read-only
	pub fn open_read(path: &Path) -> Result<Self, JanusError> {
		let file = File::open(path)?;
		let len = file.metadata()?.len();
		let mut segments = Vec::new();
		let mut offset = 0u64;
		while offset < len {
			let seg_len = (len - offset).min(SEGMENT_SIZE);
			let mmap = unsafe {
				MmapOptions::new().offset(offset).len(seg_len as usize).map(&file)?
			};
			segments.push(mmap);
			offset += seg_len;
		}
		Ok(MemoryMappedFile {
			path: path.to_path_buf(),
			file: Some(file),
			mapping: Some(Mapping::ReadOnly(segments)),
			len,
			read_pos: 0,
			write_pos: 0,
		})
	}

	/// Create (or truncate) a file of `size` bytes and map it read-write
	///
	/// Permission bits are applied at creation when supplied; on non-POSIX
	/// file systems only the owner-write bit is honoured, best effort.
	pub fn create_rw(path: &Path, size: u64, perm: Option<u32>) -> Result<Self, JanusError> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path)?;
		file.set_len(size)?;

		if let Some(bits) = perm {
			apply_permissions(path, bits);
		}

		let mut segments = Vec::new();
		let mut offset = 0u64;
		while offset < size {
			let seg_len = (size - offset).min(SEGMENT_SIZE);
			let mmap = unsafe {
				MmapOptions::new().offset(offset).len(seg_len as usize).map_mut(&file)?
			};
			segments.push(mmap);
			offset += seg_len;
		}
		Ok(MemoryMappedFile {
			path: path.to_path_buf(),
			file: Some(file),
			mapping: Some(Mapping::ReadWrite(segments)),
			len: size,
			read_pos: 0,
			write_pos: 0,
		})
	}

	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn check_bounds(&self, offset: u64, len: usize) -> Result<(), JanusError> {
		let end = offset.checked_add(len as u64).ok_or(JanusError::OutOfRange {
			offset,
			len: len as u64,
			size: self.len,
		})?;
		if end > self.len {
			return Err(JanusError::OutOfRange { offset, len: len as u64, size: self.len });
		}
		Ok(())
	}

	/// Fill `buf` from the mapping starting at `offset`
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), JanusError> {
		self.check_bounds(offset, buf.len())?;
		let segments = match &self.mapping {
			Some(Mapping::ReadOnly(segments)) => SegmentsRef::Ro(segments),
			Some(Mapping::ReadWrite(segments)) => SegmentsRef::Rw(segments),
			None => return Err(closed_error()),
		};

		let mut copied = 0usize;
		let mut pos = offset;
		while copied < buf.len() {
			let seg_idx = (pos / SEGMENT_SIZE) as usize;
			let seg_off = (pos % SEGMENT_SIZE) as usize;
			let seg = segments.slice(seg_idx);
			let n = (buf.len() - copied).min(seg.len() - seg_off);
			buf[copied..copied + n].copy_from_slice(&seg[seg_off..seg_off + n]);
			copied += n;
			pos += n as u64;
		}
		Ok(())
	}

	/// Sequential read advancing the internal read position
	pub fn read(&mut self, buf: &mut [u8]) -> Result<(), JanusError> {
		self.read_at(buf, self.read_pos)?;
		self.read_pos += buf.len() as u64;
		Ok(())
	}

	/// Copy `data` into the mapping at `offset`
	pub fn write_at(&mut self, data: &[u8], offset: u64) -> Result<(), JanusError> {
		self.check_bounds(offset, data.len())?;
		let segments = match &mut self.mapping {
			Some(Mapping::ReadWrite(segments)) => segments,
			Some(Mapping::ReadOnly(_)) => {
				return Err(JanusError::Io(io::Error::new(
					io::ErrorKind::PermissionDenied,
					"file is mapped read-only",
				)))
			}
			None => return Err(closed_error()),
		};

		let mut copied = 0usize;
		let mut pos = offset;
		while copied < data.len() {
			let seg_idx = (pos / SEGMENT_SIZE) as usize;
			let seg_off = (pos % SEGMENT_SIZE) as usize;
			let seg = &mut segments[seg_idx];
			let n = (data.len() - copied).min(seg.len() - seg_off);
			seg[seg_off..seg_off + n].copy_from_slice(&data[copied..copied + n]);
			copied += n;
			pos += n as u64;
		}
		Ok(())
	}

	/// Sequential write advancing the internal write position
	pub fn write(&mut self, data: &[u8]) -> Result<(), JanusError> {
		self.write_at(data, self.write_pos)?;
		self.write_pos += data.len() as u64;
		Ok(())
	}

	pub fn write_pos(&self) -> u64 {
		self.write_pos
	}

	/// Flush dirty pages to disk
	pub fn force(&self) -> Result<(), JanusError> {
		if let Some(Mapping::ReadWrite(segments)) = &self.mapping {
			for seg in segments {
				seg.flush()?;
			}
		}
		Ok(())
	}

	/// Flush, unmap and close; safe to call more than once
	pub fn close(&mut self) {
		if self.mapping.is_none() && self.file.is_none() {
			return;
		}
		if let Err(e) = self.force() {
			warn!("Failed to flush {}: {}", self.path.display(), e);
		}
		self.mapping = None;
		self.file = None;
	}
}

impl Drop for MemoryMappedFile {
	fn drop(&mut self) {
		self.close();
	}
}

enum SegmentsRef<'a> {
	Ro(&'a [Mmap]),
	Rw(&'a [MmapMut]),
}

impl<'a> SegmentsRef<'a> {
	fn slice(&self, idx: usize) -> &'a [u8] {
		match self {
			SegmentsRef::Ro(segs) => &segs[idx],
			SegmentsRef::Rw(segs) => &segs[idx],
		}
	}
}

fn closed_error() -> JanusError {
	JanusError::Io(io::Error::new(io::ErrorKind::Other, "file already closed"))
}

#[cfg(unix)]
fn apply_permissions(path: &Path, bits: u32) {
	use std::os::unix::fs::PermissionsExt;
	let perm = std::fs::Permissions::from_mode(bits & 0o7777);
	if let Err(e) = std::fs::set_permissions(path, perm) {
		warn!("Failed to set permissions on {}: {}", path.display(), e);
	}
}

#[cfg(not(unix))]
fn apply_permissions(path: &Path, bits: u32) {
	// Only the owner-write bit translates; everything else is dropped
	if bits & 0o200 == 0 {
		if let Ok(meta) = std::fs::metadata(path) {
			let mut perm = meta.permissions();
			perm.set_readonly(true);
			let _ = std::fs::set_permissions(path, perm);
		}
	}
}


// vim: ts=4
