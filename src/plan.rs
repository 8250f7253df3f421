//! Sync plans: diffing two file trees into a forest of actions
//!
//! The builder compares the client tree against the server tree and emits
//! UPLOAD / DELETE_REMOTE / NONE nodes. UPLOAD on a directory means
//! "ensure it exists"; DELETE_REMOTE on a directory deletes recursively.
//! A NONE node only survives while some descendant carries a real action.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{JanusError, ProtocolError};
use crate::tree::{NodeType, TreeNode};

const MAX_PLAN_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	None,
	Upload,
	DeleteRemote,
}

impl Action {
	pub fn code(self) -> u8 {
		match self {
			Action::None => 0,
			Action::Upload => 1,
			Action::DeleteRemote => 2,
		}
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			0 => Some(Action::None),
			1 => Some(Action::Upload),
			2 => Some(Action::DeleteRemote),
			_ => None,
		}
	}
}

/// One node of a sync plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
	pub name: String,
	pub node_type: NodeType,
	pub path: PathBuf,
	pub action: Action,
	pub children: Vec<PlanNode>,
}

impl PlanNode {
	/// Number of UPLOAD file actions in this subtree
	pub fn upload_file_count(&self) -> usize {
		let own = usize::from(self.action == Action::Upload && self.node_type == NodeType::File);
		own + self.children.iter().map(|c| c.upload_file_count()).sum::<usize>()
	}

	pub fn is_empty(&self) -> bool {
		self.action == Action::None && self.children.is_empty()
	}
}

/// Build the action forest for a local/remote tree pair
///
/// `skew_millis` is the bias-corrected remote-minus-local clock skew; it is
/// added to local mtimes before comparing. A local mtime equal to the
/// remote one counts as not newer.
pub fn build_plan(
	local: Option<&TreeNode>,
	remote: Option<&TreeNode>,
	skew_millis: i64,
) -> Vec<PlanNode> {
	// Nodes that do not participate in sync are invisible to the diff
	let local = local.filter(|n| n.node_type.syncable());
	let remote = remote.filter(|n| n.node_type.syncable());

	match (local, remote) {
		(None, None) => Vec::new(),
		(None, Some(r)) => vec![delete_node(r)],
		(Some(l), None) => vec![upload_subtree(l)],
		(Some(l), Some(r)) => {
			if l.node_type != r.node_type {
				// Type changed underneath the same name: replace wholesale
				return vec![delete_node(r), upload_subtree(l)];
			}
			match l.node_type {
				NodeType::File => {
					if l.mtime_millis.saturating_add(skew_millis) <= r.mtime_millis {
						Vec::new()
					} else {
						vec![upload_leaf(l)]
					}
				}
				NodeType::Directory => {
					let mut pairs: BTreeMap<&str, (Option<&TreeNode>, Option<&TreeNode>)> =
						BTreeMap::new();
					for child in &l.children {
						pairs.entry(child.name.as_str()).or_default().0 = Some(child);
					}
					for child in &r.children {
						pairs.entry(child.name.as_str()).or_default().1 = Some(child);
					}

					let mut children = Vec::new();
					for (_, (lc, rc)) in pairs {
						children.extend(build_plan(lc, rc, skew_millis));
					}

					if children.is_empty() {
						Vec::new()
					} else {
						vec![PlanNode {
							name: l.name.clone(),
							node_type: NodeType::Directory,
							path: l.path.clone(),
							action: Action::None,
							children,
						}]
					}
				}
				_ => Vec::new(),
			}
		}
	}
}

fn delete_node(remote: &TreeNode) -> PlanNode {
	PlanNode {
		name: remote.name.clone(),
		node_type: remote.node_type,
		path: remote.path.clone(),
		action: Action::DeleteRemote,
		children: Vec::new(),
	}
}

fn upload_leaf(local: &TreeNode) -> PlanNode {
	PlanNode {
		name: local.name.clone(),
		node_type: local.node_type,
		path: local.path.clone(),
		action: Action::Upload,
		children: Vec::new(),
	}
}

fn upload_subtree(local: &TreeNode) -> PlanNode {
	let children = if local.node_type == NodeType::Directory {
		local
			.children
			.iter()
			.filter(|c| c.node_type.syncable())
			.map(upload_subtree)
			.collect()
	} else {
		Vec::new()
	};
	PlanNode {
		name: local.name.clone(),
		node_type: local.node_type,
		path: local.path.clone(),
		action: Action::Upload,
		children,
	}
}

///////////////////
// Wire encoding //
///////////////////

// Per node: action:u8, type:u8, name_len:u16, name, child_count:u32,
// children. Paths are rebuilt from the nesting on decode.

fn encode_node(node: &PlanNode, buf: &mut Vec<u8>) {
	buf.push(node.action.code());
	buf.push(node.node_type.code());
	let name = node.name.as_bytes();
	buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
	buf.extend_from_slice(name);
	buf.extend_from_slice(&(node.children.len() as u32).to_be_bytes());
	for child in &node.children {
		encode_node(child, buf);
	}
}

pub fn encode_plan(node: &PlanNode) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_node(node, &mut buf);
	buf
}

fn component_ok(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& !name.contains('\\')
		&& !name.contains('\0')
}

fn decode_node(
	cur: &mut crate::protocol::message::Cursor<'_>,
	parent_path: &Path,
	depth: usize,
	is_root: bool,
) -> Result<PlanNode, JanusError> {
	if depth > MAX_PLAN_DEPTH {
		return Err(ProtocolError::InvalidField { what: "plan depth" }.into());
	}

	let action = Action::from_code(cur.get_u8("plan action")?)
		.ok_or(ProtocolError::InvalidField { what: "plan action" })?;
	let node_type = NodeType::from_code(cur.get_u8("plan node type")?)
		.ok_or(ProtocolError::InvalidField { what: "plan node type" })?;
	let name_len = cur.get_u16("plan name length")? as usize;
	let name_bytes = cur.get_bytes(name_len, "plan name")?;
	let name = String::from_utf8(name_bytes.to_vec())
		.map_err(|_| ProtocolError::InvalidField { what: "plan name" })?;

	if !component_ok(&name) && !(is_root && name.is_empty()) {
		return Err(JanusError::PathEscape { path: name });
	}

	let path = if is_root && name.is_empty() {
		PathBuf::new()
	} else {
		parent_path.join(&name)
	};

	let child_count = cur.get_u32("plan child count")? as usize;
	let mut children = Vec::with_capacity(child_count.min(4096));
	let mut seen = HashSet::new();
	for _ in 0..child_count {
		let child = decode_node(cur, &path, depth + 1, false)?;
		if !seen.insert(child.name.clone()) {
			return Err(ProtocolError::InvalidField { what: "duplicate plan sibling" }.into());
		}
		children.push(child);
	}

	Ok(PlanNode { name, node_type, path, action, children })
}

pub fn decode_plan(bytes: &[u8]) -> Result<PlanNode, JanusError> {
	let mut cur = crate::protocol::message::Cursor::new(bytes);
	let node = decode_node(&mut cur, Path::new(""), 0, true)?;
	if cur.remaining() > 0 {
		return Err(ProtocolError::InvalidField { what: "trailing plan bytes" }.into());
	}
	Ok(node)
}


// vim: ts=4
