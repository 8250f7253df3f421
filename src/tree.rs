//! File trees: the walker and the wire representation
//!
//! A tree describes one workspace as nested nodes with type, size, mtime
//! and permission bits, paths kept relative to the workspace root. The
//! wire codec never carries paths; they are reconstructed from the nesting
//! during decode, which is also where the two §3 invariants are enforced:
//! sibling names are unique, and no reconstructed path escapes the root.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use futures::Future;

use crate::error::{JanusError, ProtocolError};
use crate::filter::RuleSet;
use crate::logging::*;

/// Directories narrower than this are walked sequentially
const PARALLEL_WALK_THRESHOLD: usize = 16;

/// Nesting ceiling for decoded trees
const MAX_TREE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
	File,
	Directory,
	Symlink,
	Other,
}

impl NodeType {
	pub fn code(self) -> u8 {
		match self {
			NodeType::File => 0,
			NodeType::Directory => 1,
			NodeType::Symlink => 2,
			NodeType::Other => 3,
		}
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			0 => Some(NodeType::File),
			1 => Some(NodeType::Directory),
			2 => Some(NodeType::Symlink),
			3 => Some(NodeType::Other),
			_ => None,
		}
	}

	/// Only files and directories participate in synchronisation
	pub fn syncable(self) -> bool {
		matches!(self, NodeType::File | NodeType::Directory)
	}
}

/// One node of a file tree, with children for directories
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
	pub node_type: NodeType,
	pub name: String,
	pub size: u64,
	pub mtime_millis: i64,
	pub perm_bits: u32,
	pub path: PathBuf,
	pub children: Vec<TreeNode>,
}

impl TreeNode {
	pub fn find_child(&self, name: &str) -> Option<&TreeNode> {
		self.children.iter().find(|c| c.name == name)
	}

	/// Total number of nodes in this subtree
	pub fn node_count(&self) -> usize {
		1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
	}
}

/// Milliseconds since the epoch for a metadata mtime, clamped to 0 for
/// pre-epoch timestamps
pub fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Current wall time in UTC milliseconds
pub fn now_millis() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

#[cfg(unix)]
fn perm_bits(meta: &std::fs::Metadata) -> u32 {
	use std::os::unix::fs::PermissionsExt;
	meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn perm_bits(meta: &std::fs::Metadata) -> u32 {
	if meta.permissions().readonly() {
		0o444
	} else {
		0o644
	}
}

/// Verify that a single path component is safe to re-root
fn component_ok(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& !name.contains('\\')
		&& !name.contains('\0')
}

/// Join a `/`-separated relative path onto `root`, refusing anything that
/// would resolve outside of it
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, JanusError> {
	let mut out = root.to_path_buf();
	let candidate = Path::new(rel);
	for comp in candidate.components() {
		match comp {
			Component::Normal(part) => {
				let part_str = part.to_string_lossy();
				if !component_ok(&part_str) {
					return Err(JanusError::PathEscape { path: rel.to_string() });
				}
				out.push(part);
			}
			Component::CurDir => {}
			_ => return Err(JanusError::PathEscape { path: rel.to_string() }),
		}
	}
	Ok(out)
}

///////////////
// Walking   //
///////////////

/// Describe the directory at `root` as a tree with workspace-relative paths
///
/// Attribute reading happens once per node; nodes whose attributes cannot
/// be read are dropped with a warning. Ignore rules are evaluated on the
/// relative path before descending, pruning whole subtrees. Directories
/// with `PARALLEL_WALK_THRESHOLD` or more entries fan out into one task
/// per child.
pub async fn glob_files_relative(
	root: &Path,
	rules: &Arc<RuleSet>,
) -> Result<Option<TreeNode>, JanusError> {
	let meta = match tokio::fs::symlink_metadata(root).await {
		Ok(meta) => meta,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e.into()),
	};
	if !meta.is_dir() {
		return Err(JanusError::Config {
			message: format!("Workspace path {} is not a directory", root.display()),
		});
	}

	let node = walk(Arc::new(root.to_path_buf()), PathBuf::new(), Arc::clone(rules)).await;
	Ok(node)
}

fn walk(
	root: Arc<PathBuf>,
	rel: PathBuf,
	rules: Arc<RuleSet>,
) -> Pin<Box<dyn Future<Output = Option<TreeNode>> + Send>> {
	Box::pin(async move {
		let abs = root.join(&rel);
		let meta = match tokio::fs::symlink_metadata(&abs).await {
			Ok(meta) => meta,
			Err(e) => {
				warn!("Skipping {}: cannot read attributes: {}", abs.display(), e);
				return None;
			}
		};

		let node_type = if meta.is_dir() {
			NodeType::Directory
		} else if meta.is_file() {
			NodeType::File
		} else if meta.file_type().is_symlink() {
			NodeType::Symlink
		} else {
			NodeType::Other
		};

		let name = rel
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();

		let mut node = TreeNode {
			node_type,
			name,
			size: if node_type == NodeType::File { meta.len() } else { 0 },
			mtime_millis: mtime_millis(&meta),
			perm_bits: perm_bits(&meta),
			path: rel.clone(),
			children: Vec::new(),
		};

		if node_type != NodeType::Directory {
			return Some(node);
		}

		let mut entries = Vec::new();
		let mut read_dir = match tokio::fs::read_dir(&abs).await {
			Ok(rd) => rd,
			Err(e) => {
				warn!("Skipping {}: cannot list directory: {}", abs.display(), e);
				return None;
			}
		};
		loop {
			match read_dir.next_entry().await {
				Ok(Some(entry)) => {
					// In-progress transfer leftovers never enter a tree
					if entry
						.file_name()
						.to_string_lossy()
						.ends_with(crate::extract::TMP_SUFFIX)
					{
						continue;
					}
					let child_rel = rel.join(entry.file_name());
					let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
					if rules.matches(&child_rel, is_dir) {
						trace!("Ignoring {}", child_rel.display());
						continue;
					}
					entries.push(child_rel);
				}
				Ok(None) => break,
				Err(e) => {
					warn!("Error listing {}: {}", abs.display(), e);
					break;
				}
			}
		}

		if entries.len() < PARALLEL_WALK_THRESHOLD {
			for child_rel in entries {
				if let Some(child) = walk(Arc::clone(&root), child_rel, Arc::clone(&rules)).await
				{
					node.children.push(child);
				}
			}
		} else {
			let tasks: Vec<_> = entries
				.into_iter()
				.map(|child_rel| {
					let root = Arc::clone(&root);
					let rules = Arc::clone(&rules);
					tokio::spawn(walk(root, child_rel, rules))
				})
				.collect();
			for joined in join_all(tasks).await {
				match joined {
					Ok(Some(child)) => node.children.push(child),
					Ok(None) => {}
					Err(e) => warn!("Walk task failed: {}", e),
				}
			}
		}

		Some(node)
	})
}

///////////////////
// Wire encoding //
///////////////////

// Per node: type:u8, name_len:u16, name, size:u64, mtime:i64, perm:u32,
// child_count:u32, children. Paths are implicit in the nesting.

fn encode_node(node: &TreeNode, buf: &mut Vec<u8>) {
	buf.push(node.node_type.code());
	let name = node.name.as_bytes();
	buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
	buf.extend_from_slice(name);
	buf.extend_from_slice(&node.size.to_be_bytes());
	buf.extend_from_slice(&node.mtime_millis.to_be_bytes());
	buf.extend_from_slice(&node.perm_bits.to_be_bytes());
	buf.extend_from_slice(&(node.children.len() as u32).to_be_bytes());
	for child in &node.children {
		encode_node(child, buf);
	}
}

/// Serialise a tree for the wire
pub fn encode_tree(node: &TreeNode) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_node(node, &mut buf);
	buf
}

fn decode_node(
	cur: &mut crate::protocol::message::Cursor<'_>,
	parent_path: &Path,
	depth: usize,
	is_root: bool,
) -> Result<TreeNode, JanusError> {
	if depth > MAX_TREE_DEPTH {
		return Err(ProtocolError::InvalidField { what: "tree depth" }.into());
	}

	let type_code = cur.get_u8("tree node type")?;
	let node_type = NodeType::from_code(type_code)
		.ok_or(ProtocolError::InvalidField { what: "tree node type" })?;
	let name_len = cur.get_u16("tree node name length")? as usize;
	let name_bytes = cur.get_bytes(name_len, "tree node name")?;
	let name = String::from_utf8(name_bytes.to_vec())
		.map_err(|_| ProtocolError::InvalidField { what: "tree node name" })?;

	// The root node may be anonymous; everything below it must be a single
	// safe path component, which is what keeps every reconstructed path
	// inside the workspace root.
	if !is_root && !component_ok(&name) {
		return Err(JanusError::PathEscape { path: name });
	}
	if is_root && !name.is_empty() && !component_ok(&name) {
		return Err(JanusError::PathEscape { path: name });
	}

	let size = cur.get_u64("tree node size")?;
	let mtime_millis = cur.get_i64("tree node mtime")?;
	let perm_bits = cur.get_u32("tree node perm")?;
	let child_count = cur.get_u32("tree node child count")? as usize;

	let path = if is_root { PathBuf::new() } else { parent_path.join(&name) };

	let mut children = Vec::with_capacity(child_count.min(4096));
	let mut seen = HashSet::new();
	for _ in 0..child_count {
		let child = decode_node(cur, &path, depth + 1, false)?;
		if !seen.insert(child.name.clone()) {
			return Err(ProtocolError::InvalidField { what: "duplicate sibling name" }.into());
		}
		children.push(child);
	}

	Ok(TreeNode { node_type, name, size, mtime_millis, perm_bits, path, children })
}

/// Deserialise and validate a tree received from the wire
pub fn decode_tree(bytes: &[u8]) -> Result<TreeNode, JanusError> {
	let mut cur = crate::protocol::message::Cursor::new(bytes);
	let node = decode_node(&mut cur, Path::new(""), 0, true)?;
	if cur.remaining() > 0 {
		return Err(ProtocolError::InvalidField { what: "trailing tree bytes" }.into());
	}
	Ok(node)
}


// vim: ts=4
