//! Server main loop: accept connections, one lounge task each

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::JanusError;
use crate::logging::*;
use crate::lounge::{Lounge, WorkspaceRegistry};
use crate::socket::JanusSocket;
use crate::tls;

/// Bind and serve until the process is terminated
pub async fn run_server(config: Arc<Config>) -> Result<(), JanusError> {
	let bind_addr = format!("{}:{}", config.host, config.port);
	let listener = TcpListener::bind(&bind_addr).await?;
	info!("Listening on {}", bind_addr);
	serve_on(listener, config).await
}

/// Serve connections from an already bound listener
pub async fn serve_on(listener: TcpListener, config: Arc<Config>) -> Result<(), JanusError> {
	let tls_config = match &config.tls {
		Some(material) => {
			let key = material.key.as_ref().ok_or_else(|| JanusError::Config {
				message: "Server TLS needs both --ssl-cert and --ssl-key".to_string(),
			})?;
			Some(tls::server_config(&material.cert, key)?)
		}
		None => {
			warn!("Serving cleartext; configure TLS for untrusted networks");
			None
		}
	};

	let registry = WorkspaceRegistry::new();
	loop {
		let (stream, addr) = listener.accept().await?;
		debug!("Accepted {}", addr);

		let config = Arc::clone(&config);
		let registry = Arc::clone(&registry);
		let tls_config = tls_config.clone();
		tokio::spawn(async move {
			let socket = match tls_config {
				Some(tls_config) => match JanusSocket::accept_tls(stream, tls_config).await {
					Ok(socket) => socket,
					Err(e) => {
						warn!("TLS handshake with {} failed: {}", addr, e);
						return;
					}
				},
				None => JanusSocket::plain(stream),
			};
			Lounge::new(Connection::new(socket), config, registry).run().await;
		});
	}
}

// vim: ts=4
