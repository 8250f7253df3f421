//! Configuration: JSON5 file + command-line overrides
//!
//! The optional config file tolerates comments and trailing commas. CLI
//! flags win over file values. Validation happens here; the sync core
//! assumes a resolved, valid `WorkspaceConfig`.

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::JanusError;

/// Default TCP port when neither config nor CLI names one
pub const DEFAULT_PORT: u16 = 10024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Server,
	Client,
}

/// What to do with entries that exist remotely but not locally; kept for
/// CLI compatibility, deletion semantics are fixed to "protect wins"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DanglingPolicy {
	#[default]
	Remove,
	Keep,
	Panic,
}

#[derive(Debug, Clone)]
pub struct TlsMaterial {
	pub cert: PathBuf,
	pub key: Option<PathBuf>,
}

/// Resolved per-workspace settings, immutable after start-up
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
	/// Name on this side
	pub name: String,

	/// Name the peer knows the workspace by
	pub remote_name: String,

	pub role: Role,

	/// Workspace root directory
	pub path: PathBuf,

	pub host: Option<String>,
	pub port: Option<u16>,

	/// Shared secret the AES challenge key is derived from; authentication
	/// degrades to a plain echo without it
	pub aes_key: Option<Vec<u8>>,

	pub ignore_patterns: Vec<String>,
	pub protect_patterns: Vec<String>,

	pub tls: Option<TlsMaterial>,
}

/// Whole-process configuration
#[derive(Debug, Clone)]
pub struct Config {
	pub role: Role,
	pub host: String,
	pub port: u16,
	pub tls: Option<TlsMaterial>,
	pub dangling: DanglingPolicy,
	pub workspaces: Vec<WorkspaceConfig>,
}

impl Config {
	/// Look a workspace up by the name a client presents during auth
	pub fn find_workspace(&self, remote_visible_name: &str) -> Option<&WorkspaceConfig> {
		self.workspaces.iter().find(|w| w.name == remote_visible_name)
	}
}

//////////////////////
// Raw file model   //
//////////////////////

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
	pub mode: Option<Role>,
	pub port: Option<u16>,
	pub host: Option<String>,
	pub ssl: Option<RawSsl>,
	pub secret: Option<RawSecret>,
	pub filter: Option<RawFilter>,
	pub workspaces: Vec<RawWorkspace>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawSsl {
	pub cert: Option<PathBuf>,
	pub key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct RawSecret {
	#[serde(rename = "type")]
	pub secret_type: String,
	pub value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawFilter {
	#[serde(rename = "override")]
	pub override_lists: bool,
	pub ignore: Vec<String>,
	pub protect: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWorkspace {
	pub name: String,
	pub remote_name: Option<String>,
	pub role: Option<Role>,
	pub path: PathBuf,
	pub host: Option<String>,
	pub port: Option<u16>,
	pub secret: Option<RawSecret>,
	pub ssl: Option<RawSsl>,
	pub filter: Option<RawFilter>,
}

/// Command-line values that override the file
#[derive(Debug, Default)]
pub struct CliOptions {
	pub mode: Option<Role>,
	pub host: Option<String>,
	pub port: Option<u16>,
	pub workspace: Option<String>,
	pub path: Option<PathBuf>,
	pub secret: Option<String>,
	pub ssl_cert: Option<PathBuf>,
	pub ssl_key: Option<PathBuf>,
	pub dangling: Option<DanglingPolicy>,
}

/// Parse a JSON5 config file
pub fn load_file(path: &std::path::Path) -> Result<RawConfig, JanusError> {
	let text = std::fs::read_to_string(path).map_err(|e| JanusError::Config {
		message: format!("Cannot read config {}: {}", path.display(), e),
	})?;
	json5::from_str(&text).map_err(|e| JanusError::Config {
		message: format!("Cannot parse config {}: {}", path.display(), e),
	})
}

/// Decode secret material per its declared representation
pub fn decode_secret(raw: &RawSecret) -> Result<Vec<u8>, JanusError> {
	match raw.secret_type.as_str() {
		"string" => Ok(raw.value.as_bytes().to_vec()),
		"base64" => general_purpose::STANDARD.decode(&raw.value).map_err(|e| {
			JanusError::Config { message: format!("Bad base64 secret: {}", e) }
		}),
		"file-string" => {
			let text = std::fs::read_to_string(&raw.value).map_err(|e| JanusError::Config {
				message: format!("Cannot read secret file {}: {}", raw.value, e),
			})?;
			Ok(text.trim_end_matches('\n').as_bytes().to_vec())
		}
		"file-base64" => {
			let text = std::fs::read_to_string(&raw.value).map_err(|e| JanusError::Config {
				message: format!("Cannot read secret file {}: {}", raw.value, e),
			})?;
			general_purpose::STANDARD.decode(text.trim()).map_err(|e| {
				JanusError::Config { message: format!("Bad base64 secret file: {}", e) }
			})
		}
		other => Err(JanusError::Config {
			message: format!("Unknown secret type '{}'", other),
		}),
	}
}

fn merge_filter(global: Option<&RawFilter>, local: Option<&RawFilter>) -> (Vec<String>, Vec<String>) {
	let mut ignore = Vec::new();
	let mut protect = Vec::new();

	let override_lists = local.map(|f| f.override_lists).unwrap_or(false);
	if !override_lists {
		if let Some(g) = global {
			ignore.extend(g.ignore.iter().cloned());
			protect.extend(g.protect.iter().cloned());
		}
	}
	if let Some(l) = local {
		ignore.extend(l.ignore.iter().cloned());
		protect.extend(l.protect.iter().cloned());
	}
	(ignore, protect)
}

fn resolve_ssl(raw: Option<&RawSsl>, cli: &CliOptions) -> Option<TlsMaterial> {
	let cert = cli.ssl_cert.clone().or_else(|| raw.and_then(|s| s.cert.clone()))?;
	let key = cli.ssl_key.clone().or_else(|| raw.and_then(|s| s.key.clone()));
	Some(TlsMaterial { cert, key })
}

/// Combine an optional config file with CLI flags into the final config
pub fn resolve(file: Option<RawConfig>, cli: CliOptions) -> Result<Config, JanusError> {
	let file = file.unwrap_or_default();

	let role = cli
		.mode
		.or(file.mode)
		.ok_or_else(|| JanusError::Config {
			message: "Mode not set: pass --server or --client".to_string(),
		})?;
	let host = cli.host.clone().or_else(|| file.host.clone()).unwrap_or_else(|| {
		match role {
			Role::Server => "0.0.0.0".to_string(),
			Role::Client => "127.0.0.1".to_string(),
		}
	});
	let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);
	let tls = resolve_ssl(file.ssl.as_ref(), &cli);
	let dangling = cli.dangling.unwrap_or_default();

	let global_secret = match &file.secret {
		Some(raw) => Some(decode_secret(raw)?),
		None => None,
	};
	let cli_secret = cli.secret.as_ref().map(|s| s.as_bytes().to_vec());

	let mut workspaces = Vec::new();
	for raw_ws in &file.workspaces {
		let ws_secret = match &raw_ws.secret {
			Some(raw) => Some(decode_secret(raw)?),
			None => None,
		};
		let (ignore, protect) = merge_filter(file.filter.as_ref(), raw_ws.filter.as_ref());
		let ws_tls = raw_ws
			.ssl
			.as_ref()
			.and_then(|s| {
				s.cert.clone().map(|cert| TlsMaterial { cert, key: s.key.clone() })
			})
			.or_else(|| tls.clone());

		workspaces.push(WorkspaceConfig {
			name: raw_ws.name.clone(),
			remote_name: raw_ws.remote_name.clone().unwrap_or_else(|| raw_ws.name.clone()),
			role: raw_ws.role.unwrap_or(role),
			path: raw_ws.path.clone(),
			host: raw_ws.host.clone().or_else(|| Some(host.clone())),
			port: raw_ws.port.or(Some(port)),
			aes_key: cli_secret.clone().or(ws_secret).or_else(|| global_secret.clone()),
			ignore_patterns: ignore,
			protect_patterns: protect,
			tls: ws_tls,
		});
	}

	// A workspace assembled purely from flags
	if let (Some(name), Some(path)) = (&cli.workspace, &cli.path) {
		if !workspaces.iter().any(|w| &w.name == name) {
			let (ignore, protect) = merge_filter(file.filter.as_ref(), None);
			workspaces.push(WorkspaceConfig {
				name: name.clone(),
				remote_name: name.clone(),
				role,
				path: path.clone(),
				host: Some(host.clone()),
				port: Some(port),
				aes_key: cli_secret.clone().or_else(|| global_secret.clone()),
				ignore_patterns: ignore,
				protect_patterns: protect,
				tls: tls.clone(),
			});
		}
	}

	if workspaces.is_empty() {
		return Err(JanusError::Config {
			message: "No workspace configured: pass --workspace and --path or a config file"
				.to_string(),
		});
	}

	for ws in &workspaces {
		if ws.name.is_empty() {
			return Err(JanusError::Config { message: "Workspace name is empty".to_string() });
		}
	}

	Ok(Config { role, host, port, tls, dangling, workspaces })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn json5_tolerates_comments_and_commas() {
		let text = r#"{
			// server side
			mode: "server",
			port: 9999,
			filter: { ignore: ["*.tmp",], },
			workspaces: [
				{ name: "docs", path: "/srv/docs", },
			],
		}"#;
		let raw: RawConfig = json5::from_str(text).unwrap();
		let config = resolve(Some(raw), CliOptions::default()).unwrap();
		assert_eq!(config.role, Role::Server);
		assert_eq!(config.port, 9999);
		assert_eq!(config.workspaces[0].ignore_patterns, vec!["*.tmp".to_string()]);
	}

	#[test]
	fn cli_flags_override_file() {
		let raw: RawConfig = json5::from_str(r#"{ mode: "server", port: 1111 }"#).unwrap();
		let cli = CliOptions {
			mode: Some(Role::Client),
			port: Some(2222),
			workspace: Some("w".to_string()),
			path: Some(PathBuf::from("/tmp/w")),
			..Default::default()
		};
		let config = resolve(Some(raw), cli).unwrap();
		assert_eq!(config.role, Role::Client);
		assert_eq!(config.port, 2222);
	}

	#[test]
	fn filter_merge_and_override() {
		let merged = merge_filter(
			Some(&RawFilter {
				override_lists: false,
				ignore: vec!["*.a".to_string()],
				protect: vec!["*.p".to_string()],
			}),
			Some(&RawFilter {
				override_lists: false,
				ignore: vec!["*.b".to_string()],
				protect: vec![],
			}),
		);
		assert_eq!(merged.0, vec!["*.a".to_string(), "*.b".to_string()]);
		assert_eq!(merged.1, vec!["*.p".to_string()]);

		let replaced = merge_filter(
			Some(&RawFilter {
				override_lists: false,
				ignore: vec!["*.a".to_string()],
				protect: vec![],
			}),
			Some(&RawFilter {
				override_lists: true,
				ignore: vec!["*.b".to_string()],
				protect: vec![],
			}),
		);
		assert_eq!(replaced.0, vec!["*.b".to_string()]);
	}

	#[test]
	fn secret_types_decode() {
		let s = RawSecret { secret_type: "string".to_string(), value: "hunter2".to_string() };
		assert_eq!(decode_secret(&s).unwrap(), b"hunter2");

		let b = RawSecret {
			secret_type: "base64".to_string(),
			value: general_purpose::STANDARD.encode(b"hunter2"),
		};
		assert_eq!(decode_secret(&b).unwrap(), b"hunter2");

		let bad = RawSecret { secret_type: "rot13".to_string(), value: "x".to_string() };
		assert!(decode_secret(&bad).is_err());
	}

	#[test]
	fn missing_mode_is_an_error() {
		let cli = CliOptions {
			workspace: Some("w".to_string()),
			path: Some(PathBuf::from("/tmp/w")),
			..Default::default()
		};
		assert!(resolve(None, cli).is_err());
	}

	#[test]
	fn missing_workspace_is_an_error() {
		let cli = CliOptions { mode: Some(Role::Server), ..Default::default() };
		assert!(resolve(None, cli).is_err());
	}
}

// vim: ts=4
