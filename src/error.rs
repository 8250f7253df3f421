//! Error types for Janus operations

use std::error::Error;
use std::fmt;
use std::io;

/// Wire-level and state-machine protocol errors
///
/// Every variant here is fatal for the connection it occurred on: the
/// dispatcher logs it and tears the connection down. The accept loop and the
/// other connections are unaffected.
#[derive(Debug)]
pub enum ProtocolError {
	/// Frame header did not start with the `jANu` magic
	BadMagic { got: [u8; 4] },

	/// Declared body length exceeds the 1 GiB ceiling
	OversizeBody { len: u64 },

	/// Type code not present in the message registry
	UnknownType { code: u32 },

	/// Body bytes ran out while decoding a field
	Truncated { what: &'static str },

	/// Body decoded but a field held an invalid value
	InvalidField { what: &'static str },

	/// A message arrived that the current connection state cannot accept
	UnexpectedMessage { expected: &'static str, got: &'static str },

	/// Hello negotiation failed: no common protocol version
	VersionMismatch { offered: Vec<u64> },

	/// Server answered with a non-zero response code
	ResponseCode { code: i32, message: String },
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::BadMagic { got } => {
				write!(f, "Bad frame magic: {:02x?}", got)
			}
			ProtocolError::OversizeBody { len } => {
				write!(f, "Declared body length {} exceeds the 1 GiB ceiling", len)
			}
			ProtocolError::UnknownType { code } => {
				write!(f, "Unknown message type code {:#06x}", code)
			}
			ProtocolError::Truncated { what } => {
				write!(f, "Message body truncated while reading {}", what)
			}
			ProtocolError::InvalidField { what } => {
				write!(f, "Invalid value in message field {}", what)
			}
			ProtocolError::UnexpectedMessage { expected, got } => {
				write!(f, "Expected {} but received {}", expected, got)
			}
			ProtocolError::VersionMismatch { offered } => {
				write!(f, "No common protocol version (peer offered {:?})", offered)
			}
			ProtocolError::ResponseCode { code, message } => {
				write!(f, "Server responded with code {}: {}", code, message)
			}
		}
	}
}

impl Error for ProtocolError {}

/// Authentication errors
///
/// Reported to the peer via `CommonResponse { code: 1 }` before the
/// connection is closed.
#[derive(Debug)]
pub enum AuthError {
	/// The named workspace is not configured on this side
	UnknownWorkspace { name: String },

	/// Decrypted challenge did not match the issued one
	ChallengeMismatch,

	/// A key is required for this workspace but none is configured
	MissingKey,

	/// The encrypted challenge could not be decrypted at all
	BadCiphertext,
}

impl fmt::Display for AuthError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AuthError::UnknownWorkspace { name } => {
				write!(f, "Unknown workspace: {}", name)
			}
			AuthError::ChallengeMismatch => write!(f, "Challenge response mismatch"),
			AuthError::MissingKey => write!(f, "No key configured for workspace"),
			AuthError::BadCiphertext => write!(f, "Challenge response could not be decrypted"),
		}
	}
}

impl Error for AuthError {}

/// Unified error type for Janus operations
///
/// Handlers return this and propagate with `?`; the lounge dispatcher and
/// the client driver are the only places that catch it.
#[derive(Debug)]
pub enum JanusError {
	/// I/O error
	Io(io::Error),

	/// Wire protocol error (nested)
	Protocol(ProtocolError),

	/// Authentication error (nested)
	Auth(AuthError),

	/// TLS setup or handshake failure
	Tls { message: String },

	/// Invalid configuration
	Config { message: String },

	/// A relative path resolved outside the workspace root
	PathEscape { path: String },

	/// Another connection already holds the workspace
	WorkspaceBusy { workspace: String },

	/// Offset/length beyond the mapped file size
	OutOfRange { offset: u64, len: u64, size: u64 },

	/// Peer closed the connection unexpectedly
	Disconnected,

	/// Generic error message
	Other { message: String },
}

impl JanusError {
	/// Process exit code for the CLI front end
	pub fn exit_code(&self) -> i32 {
		match self {
			JanusError::WorkspaceBusy { .. } => 2,
			_ => 1,
		}
	}
}

impl fmt::Display for JanusError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			JanusError::Io(e) => write!(f, "I/O error: {}", e),
			JanusError::Protocol(e) => write!(f, "Protocol error: {}", e),
			JanusError::Auth(e) => write!(f, "Authentication error: {}", e),
			JanusError::Tls { message } => write!(f, "TLS error: {}", message),
			JanusError::Config { message } => write!(f, "Invalid configuration: {}", message),
			JanusError::PathEscape { path } => {
				write!(f, "Path escapes the workspace root: {}", path)
			}
			JanusError::WorkspaceBusy { workspace } => {
				write!(f, "Workspace {} is locked by another connection", workspace)
			}
			JanusError::OutOfRange { offset, len, size } => {
				write!(f, "Access at offset {} length {} beyond file size {}", offset, len, size)
			}
			JanusError::Disconnected => write!(f, "Connection closed by peer"),
			JanusError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for JanusError {}

impl From<io::Error> for JanusError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			JanusError::Disconnected
		} else {
			JanusError::Io(e)
		}
	}
}

impl From<ProtocolError> for JanusError {
	fn from(e: ProtocolError) -> Self {
		JanusError::Protocol(e)
	}
}

impl From<AuthError> for JanusError {
	fn from(e: AuthError) -> Self {
		JanusError::Auth(e)
	}
}

impl From<String> for JanusError {
	fn from(message: String) -> Self {
		JanusError::Other { message }
	}
}

impl From<rustls::Error> for JanusError {
	fn from(e: rustls::Error) -> Self {
		JanusError::Tls { message: e.to_string() }
	}
}

impl From<tokio::task::JoinError> for JanusError {
	fn from(e: tokio::task::JoinError) -> Self {
		JanusError::Other { message: format!("Task failed: {}", e) }
	}
}


// vim: ts=4
