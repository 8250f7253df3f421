//! # Janus - High-Throughput One-Way Directory Synchroniser
//!
//! Janus pushes the state of a local workspace to a server over a framed
//! binary protocol so that the server's workspace becomes a byte- and
//! permission-identical copy, skipping files whose remote version is
//! already up to date. It is built for two regimes: trees where almost
//! nothing changed (the diff costs next to nothing) and full initial
//! syncs (large files stream straight from memory mappings, small files
//! travel batched in archives extracted concurrently on the server).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), janus::JanusError> {
//!     let config = janus::config::resolve(None, my_cli_options())?;
//!     match config.role {
//!         janus::config::Role::Server => janus::server::run_server(Arc::new(config)).await,
//!         janus::config::Role::Client => {
//!             janus::client::run_client(&config.workspaces[0]).await.map(|_| ())
//!         }
//!     }
//! }
//! ```

pub mod archive;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod extract;
pub mod filter;
pub mod keygen;
pub mod logging;
pub mod lounge;
pub mod mmap;
pub mod plan;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod tls;
pub mod tree;

// Re-export commonly used types and functions
pub use client::{run_client, SyncReport};
pub use config::{Config, Role, WorkspaceConfig};
pub use error::{AuthError, JanusError, ProtocolError};
pub use filter::RuleSet;
pub use plan::{build_plan, Action, PlanNode};
pub use protocol::{Message, MessageType, PROTOCOL_VERSION};
pub use server::run_server;
pub use tree::{glob_files_relative, NodeType, TreeNode};

// vim: ts=4
