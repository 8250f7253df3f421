//! Full client-against-server sync scenarios over localhost

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

use janus::client::run_client;
use janus::config::{Config, DanglingPolicy, Role, WorkspaceConfig};
use janus::server::serve_on;
use janus::JanusError;

const SECRET: &[u8] = b"hunter2";

fn server_workspace(name: &str, path: &Path, protect: Vec<String>) -> WorkspaceConfig {
	WorkspaceConfig {
		name: name.to_string(),
		remote_name: name.to_string(),
		role: Role::Server,
		path: path.to_path_buf(),
		host: None,
		port: None,
		aes_key: Some(SECRET.to_vec()),
		ignore_patterns: vec![],
		protect_patterns: protect,
		tls: None,
	}
}

fn client_workspace(name: &str, path: &Path, addr: SocketAddr) -> WorkspaceConfig {
	WorkspaceConfig {
		name: name.to_string(),
		remote_name: name.to_string(),
		role: Role::Client,
		path: path.to_path_buf(),
		host: Some(addr.ip().to_string()),
		port: Some(addr.port()),
		aes_key: Some(SECRET.to_vec()),
		ignore_patterns: vec![],
		protect_patterns: vec![],
		tls: None,
	}
}

async fn start_server(ws: WorkspaceConfig) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let config = Config {
		role: Role::Server,
		host: addr.ip().to_string(),
		port: addr.port(),
		tls: None,
		dangling: DanglingPolicy::default(),
		workspaces: vec![ws],
	};
	tokio::spawn(async move {
		let _ = serve_on(listener, Arc::new(config)).await;
	});
	addr
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_sync_completes() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;

	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();
	assert_eq!(report.plan_actions, 0);
	assert_eq!(report.bytes_sent, 0);
	assert_eq!(report.files_uploaded, 0);
	assert_eq!(report.archives_uploaded, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_small_file_travels_in_archive() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(cli.path().join("hello.txt"), b"hi\n").unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();

	assert_eq!(report.archives_uploaded, 1);
	assert_eq!(report.files_uploaded, 0);
	assert_eq!(std::fs::read(srv.path().join("hello.txt")).unwrap(), b"hi\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_large_file_streams_directly() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	let payload = vec![0u8; 2 * 1024 * 1024];
	std::fs::write(cli.path().join("big.bin"), &payload).unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();

	assert_eq!(report.files_uploaded, 1);
	assert_eq!(report.archives_uploaded, 0);
	let written = std::fs::read(srv.path().join("big.bin")).unwrap();
	assert_eq!(written.len(), payload.len());
	assert_eq!(written, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_only_file_is_deleted() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(srv.path().join("stale.txt"), b"old").unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();

	assert_eq!(report.plan_actions, 1);
	assert!(!srv.path().join("stale.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn protect_rule_blocks_deletion() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(srv.path().join("keep.log"), b"precious").unwrap();

	let addr =
		start_server(server_workspace("ws", srv.path(), vec!["*.log".to_string()])).await;
	run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();

	assert!(srv.path().join("keep.log").exists());
	assert_eq!(std::fs::read(srv.path().join("keep.log")).unwrap(), b"precious");
}

#[tokio::test(flavor = "multi_thread")]
async fn mtime_decides_upload() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(srv.path().join("a.txt"), b"server copy").unwrap();
	std::fs::write(cli.path().join("a.txt"), b"client copy").unwrap();

	// Make the local copy clearly older first: no transfer happens
	let old = filetime::FileTime::from_unix_time(1_000_000, 0);
	filetime::set_file_mtime(cli.path().join("a.txt"), old).unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();
	assert_eq!(report.files_uploaded + report.archives_uploaded, 0);
	assert_eq!(std::fs::read(srv.path().join("a.txt")).unwrap(), b"server copy");

	// Now make it clearly newer: the server copy is replaced
	let future = filetime::FileTime::from_unix_time(
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap()
			.as_secs() as i64 + 3600,
		0,
	);
	filetime::set_file_mtime(cli.path().join("a.txt"), future).unwrap();

	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();
	assert_eq!(report.archives_uploaded, 1);
	assert_eq!(std::fs::read(srv.path().join("a.txt")).unwrap(), b"client copy");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_sync_is_idempotent() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(cli.path().join("one.txt"), b"1").unwrap();
	std::fs::create_dir(cli.path().join("nest")).unwrap();
	std::fs::write(cli.path().join("nest/two.txt"), b"22").unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let ws = client_workspace("ws", cli.path(), addr);

	let first = run_client(&ws).await.unwrap();
	assert!(first.plan_actions > 0);

	let second = run_client(&ws).await.unwrap();
	assert_eq!(second.plan_actions, 0);
	assert_eq!(second.bytes_sent, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_secret_is_rejected() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;

	let mut ws = client_workspace("ws", cli.path(), addr);
	ws.aes_key = Some(b"wrong-password".to_vec());
	let result = run_client(&ws).await;
	assert!(matches!(
		result,
		Err(JanusError::Protocol(janus::ProtocolError::ResponseCode { code: 1, .. }))
	));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_workspace_is_rejected() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;

	let ws = client_workspace("nope", cli.path(), addr);
	assert!(run_client(&ws).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_workspace_turns_second_client_away() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;

	// First connection binds the workspace by hand and stays connected
	use janus::connection::Connection;
	use janus::socket::JanusSocket;
	let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
	let mut held = Connection::new(JanusSocket::plain(stream));
	held.hello_client().await.unwrap();
	held.auth_client("ws", Some(SECRET)).await.unwrap();

	// The second client must be bounced with the busy error
	let result = run_client(&client_workspace("ws", cli.path(), addr)).await;
	match result {
		Err(e @ JanusError::WorkspaceBusy { .. }) => assert_eq!(e.exit_code(), 2),
		other => panic!("expected WorkspaceBusy, got {:?}", other.map(|_| ())),
	}

	held.bye().await.unwrap();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn permissions_are_mirrored() {
	use std::os::unix::fs::PermissionsExt;

	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(cli.path().join("script.sh"), b"#!/bin/sh\n").unwrap();
	std::fs::set_permissions(
		cli.path().join("script.sh"),
		std::fs::Permissions::from_mode(0o755),
	)
	.unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();

	let mode = std::fs::metadata(srv.path().join("script.sh")).unwrap().permissions().mode();
	assert_eq!(mode & 0o777, 0o755);
}

#[tokio::test(flavor = "multi_thread")]
async fn ignore_rules_prune_the_walk() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::write(cli.path().join("code.rs"), b"fn main() {}").unwrap();
	std::fs::write(cli.path().join("junk.tmp"), b"x").unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let mut ws = client_workspace("ws", cli.path(), addr);
	ws.ignore_patterns = vec!["*.tmp".to_string()];
	run_client(&ws).await.unwrap();

	assert!(srv.path().join("code.rs").exists());
	assert!(!srv.path().join("junk.tmp").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn type_change_replaces_remote_directory() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	std::fs::create_dir(srv.path().join("thing")).unwrap();
	std::fs::write(srv.path().join("thing/inner.txt"), b"x").unwrap();
	std::fs::write(cli.path().join("thing"), b"now a file").unwrap();

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();

	assert!(srv.path().join("thing").is_file());
	assert_eq!(std::fs::read(srv.path().join("thing")).unwrap(), b"now a file");
}

#[tokio::test(flavor = "multi_thread")]
async fn many_small_files_arrive_intact() {
	let srv = TempDir::new().unwrap();
	let cli = TempDir::new().unwrap();
	for i in 0..120 {
		let dir = cli.path().join(format!("d{}", i % 7));
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(dir.join(format!("f{}.dat", i)), format!("payload-{}", i)).unwrap();
	}

	let addr = start_server(server_workspace("ws", srv.path(), vec![])).await;
	let report = run_client(&client_workspace("ws", cli.path(), addr)).await.unwrap();
	assert_eq!(report.archives_uploaded, 1);

	for i in 0..120 {
		let path = srv.path().join(format!("d{}/f{}.dat", i % 7, i));
		assert_eq!(
			std::fs::read(&path).unwrap(),
			format!("payload-{}", i).into_bytes(),
			"mismatch at {}",
			path.display()
		);
	}
}

// vim: ts=4
