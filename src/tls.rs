//! TLS transport setup
//!
//! The server loads a certificate chain and private key; the client loads
//! the same certificate as its only trust anchor. Trust is by certificate
//! pinning: the presented end-entity certificate must be byte-identical to
//! a pinned one, and hostname verification is disabled.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::JanusError;

/// SNI name sent by the client; never verified against the certificate
pub const TLS_SERVER_NAME: &str = "janussync";

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, JanusError> {
	let file = File::open(path).map_err(|e| JanusError::Tls {
		message: format!("Cannot open certificate {}: {}", path.display(), e),
	})?;
	let mut reader = BufReader::new(file);
	let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
	let certs = certs.map_err(|e| JanusError::Tls {
		message: format!("Cannot parse certificate {}: {}", path.display(), e),
	})?;
	if certs.is_empty() {
		return Err(JanusError::Tls {
			message: format!("No certificates found in {}", path.display()),
		});
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, JanusError> {
	let file = File::open(path).map_err(|e| JanusError::Tls {
		message: format!("Cannot open key {}: {}", path.display(), e),
	})?;
	let mut reader = BufReader::new(file);
	rustls_pemfile::private_key(&mut reader)
		.map_err(|e| JanusError::Tls {
			message: format!("Cannot parse key {}: {}", path.display(), e),
		})?
		.ok_or_else(|| JanusError::Tls {
			message: format!("No private key found in {}", path.display()),
		})
}

/// Build the server-side TLS acceptor configuration
pub fn server_config(
	cert_path: &Path,
	key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, JanusError> {
	let certs = load_certs(cert_path)?;
	let key = load_key(key_path)?;
	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	Ok(Arc::new(config))
}

/// Build the client-side TLS connector configuration, pinned to the
/// certificates in `cert_path`
pub fn client_config(cert_path: &Path) -> Result<Arc<rustls::ClientConfig>, JanusError> {
	let pinned = load_certs(cert_path)?;
	let verifier = PinnedCertVerifier {
		pinned,
		provider: rustls::crypto::ring::default_provider(),
	};
	let config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(verifier))
		.with_no_client_auth();
	Ok(Arc::new(config))
}

/// Accepts exactly the pinned certificates; everything else is rejected.
/// Signatures are still verified so a pinned certificate cannot be
/// replayed by a peer without its key.
#[derive(Debug)]
struct PinnedCertVerifier {
	pinned: Vec<CertificateDer<'static>>,
	provider: CryptoProvider,
}

impl ServerCertVerifier for PinnedCertVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		if self.pinned.iter().any(|c| c.as_ref() == end_entity.as_ref()) {
			Ok(ServerCertVerified::assertion())
		} else {
			Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
		}
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider.signature_verification_algorithms.supported_schemes()
	}
}

// vim: ts=4
