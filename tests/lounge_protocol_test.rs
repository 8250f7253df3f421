//! Driving the server lounge with a raw protocol connection

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

use janus::config::{Config, DanglingPolicy, Role, WorkspaceConfig};
use janus::connection::{decode_ack_pairs, Connection};
use janus::server::serve_on;
use janus::socket::JanusSocket;
use janus::{JanusError, Message};

async fn start_server(path: &Path) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let ws = WorkspaceConfig {
		name: "ws".to_string(),
		remote_name: "ws".to_string(),
		role: Role::Server,
		path: path.to_path_buf(),
		host: None,
		port: None,
		aes_key: None,
		ignore_patterns: vec![],
		protect_patterns: vec![],
		tls: None,
	};
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

async fn authed_connection(addr: SocketAddr) -> Connection {
	let stream = TcpStream::connect(addr).await.unwrap();
	let mut conn = Connection::new(JanusSocket::plain(stream));
	conn.hello_client().await.unwrap();
	conn.auth_client("ws", None).await.unwrap();
	conn
}

#[tokio::test(flavor = "multi_thread")]
async fn bye_is_echoed() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;
	conn.bye().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn clock_probe_returns_plausible_time() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;

	// Same machine, so the skew is the rtt error at most
	let skew = conn.probe_clock().await.unwrap();
	assert!(skew.abs() < 5_000, "skew {} ms is not plausible for localhost", skew);
	conn.bye().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_state_message_closes_connection() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;

	// DataBlock outside any upload operation is protocol misuse
	let mut conn = authed_connection(addr).await;
	conn.send_data_block(b"stray bytes").await.unwrap();

	// The server tears the connection down without a response
	let mut buf = [0u8; 16];
	let eof = conn.read_some(&mut buf, Some(std::time::Duration::from_secs(5))).await;
	assert_eq!(eof.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_before_hello_is_fatal() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;

	let stream = TcpStream::connect(addr).await.unwrap();
	let mut conn = Connection::new(JanusSocket::plain(stream));
	conn.send(&Message::Auth { payload: b"ws".to_vec() }).await.unwrap();

	// Hello never happened, so the session dies instead of answering
	let mut buf = [0u8; 16];
	let eof = conn.read_some(&mut buf, Some(std::time::Duration::from_secs(5))).await;
	assert_eq!(eof.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn nonblocking_confirm_returns_immediately() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;

	// Nothing in flight: an empty drain either way
	let pairs = conn.confirm_archives(true).await.unwrap();
	assert!(pairs.is_empty());
	let pairs = conn.confirm_files().await.unwrap();
	assert!(pairs.is_empty());
	conn.bye().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_file_acks_are_drained_once() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;

	// Pipeline two uploads without waiting in between
	conn.send(&Message::UploadFile {
		nonce: 11,
		perm: 0o644,
		size: 4,
		path: "a.bin".to_string(),
	})
	.await
	.unwrap();
	conn.send_data_block(b"aaaa").await.unwrap();
	conn.send(&Message::UploadFile {
		nonce: 22,
		perm: 0o644,
		size: 2,
		path: "b.bin".to_string(),
	})
	.await
	.unwrap();
	conn.send_data_block(b"bb").await.unwrap();

	let mut pairs = conn.confirm_files().await.unwrap();
	pairs.sort();
	assert_eq!(pairs, vec![(11, 0), (22, 0)]);
	assert_eq!(std::fs::read(srv.path().join("a.bin")).unwrap(), b"aaaa");
	assert_eq!(std::fs::read(srv.path().join("b.bin")).unwrap(), b"bb");

	// A second drain has nothing left
	assert!(conn.confirm_files().await.unwrap().is_empty());
	conn.bye().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_upload_path_kills_the_session() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;

	conn.send(&Message::UploadFile {
		nonce: 1,
		perm: 0o644,
		size: 4,
		path: "../escape.bin".to_string(),
	})
	.await
	.unwrap();

	let mut buf = [0u8; 16];
	let eof = conn.read_some(&mut buf, Some(std::time::Duration::from_secs(5))).await;
	assert_eq!(eof.unwrap(), 0);
	assert!(!srv.path().parent().unwrap().join("escape.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_statuses_come_back_by_seq_id() {
	let srv = TempDir::new().unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;

	// Hand-rolled single-entry archive
	let mut archive = Vec::new();
	archive.extend_from_slice(&5u32.to_be_bytes());
	archive.extend_from_slice(&0o644u32.to_be_bytes());
	archive.extend_from_slice(&3u64.to_be_bytes());
	archive.extend_from_slice(b"x.txt");
	archive.extend_from_slice(b"abc");

	conn.upload_archive(42, &archive).await.unwrap();

	let mut done = Vec::new();
	while done.is_empty() {
		done = conn.confirm_archives(false).await.unwrap();
	}
	assert_eq!(done, vec![(42, 0)]);
	assert_eq!(std::fs::read(srv.path().join("x.txt")).unwrap(), b"abc");
	conn.bye().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_tree_reports_remote_state() {
	let srv = TempDir::new().unwrap();
	std::fs::write(srv.path().join("present.txt"), b"here").unwrap();
	let addr = start_server(srv.path()).await;
	let mut conn = authed_connection(addr).await;

	let tree = conn.fetch_file_tree().await.unwrap().unwrap();
	assert_eq!(tree.children.len(), 1);
	assert_eq!(tree.children[0].name, "present.txt");
	assert_eq!(tree.children[0].size, 4);
	conn.bye().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ack_pair_encoding_is_stable() {
	// The drain payload format is part of the wire contract
	let bytes = janus::connection::encode_ack_pairs(&[(9, 1)]);
	assert_eq!(bytes.len(), 12);
	assert_eq!(decode_ack_pairs(&bytes).unwrap(), vec![(9, 1)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn error_exit_codes_match_contract() {
	assert_eq!(JanusError::WorkspaceBusy { workspace: "w".into() }.exit_code(), 2);
	assert_eq!(
		JanusError::Config { message: "bad".into() }.exit_code(),
		1
	);
}

// vim: ts=4
