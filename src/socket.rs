//! Socket abstraction over plain TCP and TLS streams
//!
//! One reader, one writer, strictly serialised frames on top. `read_some`
//! accepts an optional deadline; the protocol layer itself never imposes
//! timeouts.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::JanusError;
use crate::logging::*;
use crate::tls::TLS_SERVER_NAME;

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// An established connection stream, possibly TLS-wrapped
pub struct JanusSocket {
	stream: Box<dyn Transport>,
	peer: String,
}

impl JanusSocket {
	/// Wrap an accepted or connected TCP stream without TLS
	pub fn plain(stream: TcpStream) -> Self {
		let peer = stream
			.peer_addr()
			.map(|a| a.to_string())
			.unwrap_or_else(|_| "unknown".to_string());
		JanusSocket { stream: Box::new(stream), peer }
	}

	/// Client side: run the TLS handshake over a fresh TCP stream
	pub async fn connect_tls(
		stream: TcpStream,
		config: std::sync::Arc<rustls::ClientConfig>,
	) -> Result<Self, JanusError> {
		let peer = stream
			.peer_addr()
			.map(|a| a.to_string())
			.unwrap_or_else(|_| "unknown".to_string());
		let connector = TlsConnector::from(config);
		let name = rustls::pki_types::ServerName::try_from(TLS_SERVER_NAME)
			.map_err(|e| JanusError::Tls { message: e.to_string() })?;
		let tls = connector
			.connect(name, stream)
			.await
			.map_err(|e| JanusError::Tls { message: format!("Handshake failed: {}", e) })?;
		Ok(JanusSocket { stream: Box::new(tls), peer })
	}

	/// Server side: run the TLS handshake on an accepted stream
	pub async fn accept_tls(
		stream: TcpStream,
		config: std::sync::Arc<rustls::ServerConfig>,
	) -> Result<Self, JanusError> {
		let peer = stream
			.peer_addr()
			.map(|a| a.to_string())
			.unwrap_or_else(|_| "unknown".to_string());
		let acceptor = TlsAcceptor::from(config);
		let tls = acceptor
			.accept(stream)
			.await
			.map_err(|e| JanusError::Tls { message: format!("Handshake failed: {}", e) })?;
		Ok(JanusSocket { stream: Box::new(tls), peer })
	}

	pub fn peer(&self) -> &str {
		&self.peer
	}

	/// Read whatever is available, up to `buf.len()` bytes; 0 means EOF
	pub async fn read_some(
		&mut self,
		buf: &mut [u8],
		deadline: Option<Duration>,
	) -> Result<usize, JanusError> {
		match deadline {
			None => Ok(self.stream.read(buf).await?),
			Some(limit) => match tokio::time::timeout(limit, self.stream.read(buf)).await {
				Ok(result) => Ok(result?),
				Err(_) => Err(JanusError::Io(io::Error::new(
					io::ErrorKind::TimedOut,
					"read deadline exceeded",
				))),
			},
		}
	}

	/// Fill `buf` completely or fail with `Disconnected`
	pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), JanusError> {
		self.stream.read_exact(buf).await?;
		Ok(())
	}

	pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), JanusError> {
		self.stream.write_all(buf).await?;
		Ok(())
	}

	pub async fn flush(&mut self) -> Result<(), JanusError> {
		self.stream.flush().await?;
		Ok(())
	}

	/// Graceful close; errors are logged, not propagated
	pub async fn close(&mut self) {
		if let Err(e) = self.stream.shutdown().await {
			debug!("Shutdown of {} returned: {}", self.peer, e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn plain_round_trip() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut sock = JanusSocket::plain(stream);
			let mut buf = [0u8; 5];
			sock.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"ping!");
			sock.write_all(b"pong!").await.unwrap();
			sock.close().await;
		});

		let stream = TcpStream::connect(addr).await.unwrap();
		let mut sock = JanusSocket::plain(stream);
		sock.write_all(b"ping!").await.unwrap();
		let mut buf = [0u8; 5];
		sock.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong!");

		server.await.unwrap();
	}

	#[tokio::test]
	async fn read_some_deadline_fires() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let _held = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			// Hold the connection open without writing
			tokio::time::sleep(Duration::from_secs(5)).await;
			drop(stream);
		});

		let stream = TcpStream::connect(addr).await.unwrap();
		let mut sock = JanusSocket::plain(stream);
		let mut buf = [0u8; 8];
		let result = sock.read_some(&mut buf, Some(Duration::from_millis(50))).await;
		match result {
			Err(JanusError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
			other => panic!("expected timeout, got {:?}", other.map(|_| ())),
		}
	}

	#[tokio::test]
	async fn eof_reads_zero() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			drop(stream);
		});

		let stream = TcpStream::connect(addr).await.unwrap();
		let mut sock = JanusSocket::plain(stream);
		let mut buf = [0u8; 8];
		assert_eq!(sock.read_some(&mut buf, None).await.unwrap(), 0);
	}
}

// vim: ts=4
