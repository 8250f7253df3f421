//! Sync over a TLS-wrapped transport with generated certificates

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

use janus::client::run_client;
use janus::config::{Config, DanglingPolicy, Role, TlsMaterial, WorkspaceConfig};
use janus::keygen;
use janus::server::serve_on;

#[tokio::test(flavor = "multi_thread")]
async fn sync_over_tls() {
	let keys = TempDir::new().unwrap();
	let cert = keys.path().join("cert.pem");
	let key = keys.path().join("key.pem");
	keygen::generate_to(Some(&cert), Some(&key)).unwrap();

	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(cli.path().join("secure.txt"), b"over tls").unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let server_ws = WorkspaceConfig {
		name: "ws".to_string(),
		remote_name: "ws".to_string(),
		role: Role::Server,
		path: srv.path().to_path_buf(),
		host: None,
		port: None,
		aes_key: Some(b"hunter2".to_vec()),
		ignore_patterns: vec![],
		protect_patterns: vec![],
		tls: None,
	};
	let config = Config {
		role: Role::Server,
		host: addr.ip().to_string(),
		port: addr.port(),
		tls: Some(TlsMaterial { cert: cert.clone(), key: Some(key.clone()) }),
		dangling: DanglingPolicy::default(),
		workspaces: vec![server_ws],
	};
	tokio::spawn(async move {
		let _ = serve_on(listener, Arc::new(config)).await;
	});

	let client_ws = WorkspaceConfig {
		name: "ws".to_string(),
		remote_name: "ws".to_string(),
		role: Role::Client,
		path: cli.path().to_path_buf(),
		host: Some(addr.ip().to_string()),
		port: Some(addr.port()),
		aes_key: Some(b"hunter2".to_vec()),
		ignore_patterns: vec![],
		protect_patterns: vec![],
		tls: Some(TlsMaterial { cert: cert.clone(), key: None }),
	};
	let report = run_client(&client_ws).await.unwrap();
	assert_eq!(report.archives_uploaded, 1);
	assert_eq!(std::fs::read(srv.path().join("secure.txt")).unwrap(), b"over tls");
}

#[tokio::test(flavor = "multi_thread")]
async fn client_rejects_unpinned_certificate() {
	let keys = TempDir::new().unwrap();
	let server_cert = keys.path().join("server-cert.pem");
	let server_key = keys.path().join("server-key.pem");
	keygen::generate_to(Some(&server_cert), Some(&server_key)).unwrap();

	// A different certificate pair the client pins instead
	let other_cert = keys.path().join("other-cert.pem");
	let other_key = keys.path().join("other-key.pem");
	keygen::generate_to(Some(&other_cert), Some(&other_key)).unwrap();

	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let config = Config {
		role: Role::Server,
		host: addr.ip().to_string(),
		port: addr.port(),
		tls: Some(TlsMaterial { cert: server_cert, key: Some(server_key) }),
		dangling: DanglingPolicy::default(),
		workspaces: vec![workspace_stub(Role::Server, srv.path())],
	};
	tokio::spawn(async move {
		let _ = serve_on(listener, Arc::new(config)).await;
	});

	let mut client_ws = workspace_stub(Role::Client, cli.path());
	client_ws.host = Some(addr.ip().to_string());
	client_ws.port = Some(addr.port());
	client_ws.tls = Some(TlsMaterial { cert: other_cert, key: None });

	assert!(run_client(&client_ws).await.is_err());
}

fn workspace_stub(role: Role, path: &Path) -> WorkspaceConfig {
	WorkspaceConfig {
		name: "ws".to_string(),
		remote_name: "ws".to_string(),
		role,
		path: path.to_path_buf(),
		host: None,
		port: None,
		aes_key: None,
		ignore_patterns: vec![],
		protect_patterns: vec![],
		tls: None,
	}
}

// vim: ts=4
