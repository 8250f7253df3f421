//! Self-signed certificate generation for `--generate-ssl-keys`
//!
//! Produces an Ed25519 CA plus a leaf certificate signed by it, subject
//! CN=JanusSync, valid for a thousand years. Pinning makes the long
//! validity acceptable for the deployments this tool targets.

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, PKCS_ED25519,
};
use std::path::Path;

use crate::error::JanusError;
use crate::logging::*;

const COMMON_NAME: &str = "JanusSync";

fn params(common_name: &str) -> Result<CertificateParams, JanusError> {
	let mut params = CertificateParams::default();
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, common_name);
	params.distinguished_name = dn;
	params.not_before = rcgen::date_time_ymd(2024, 1, 1);
	params.not_after = rcgen::date_time_ymd(3024, 1, 1);
	Ok(params)
}

fn keygen_error(e: rcgen::Error) -> JanusError {
	JanusError::Tls { message: format!("Certificate generation failed: {}", e) }
}

/// Generated PEM material: certificate chain (leaf first) and leaf key
pub struct GeneratedKeys {
	pub cert_pem: String,
	pub key_pem: String,
}

/// Generate the CA + leaf pair
pub fn generate() -> Result<GeneratedKeys, JanusError> {
	let ca_key = KeyPair::generate_for(&PKCS_ED25519).map_err(keygen_error)?;
	let mut ca_params = params(COMMON_NAME)?;
	ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	let ca_cert = ca_params.self_signed(&ca_key).map_err(keygen_error)?;

	let leaf_key = KeyPair::generate_for(&PKCS_ED25519).map_err(keygen_error)?;
	let leaf_params = params(COMMON_NAME)?;
	let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).map_err(keygen_error)?;

	let cert_pem = format!("{}{}", leaf_cert.pem(), ca_cert.pem());
	let key_pem = leaf_key.serialize_pem();
	Ok(GeneratedKeys { cert_pem, key_pem })
}

/// Generate and either write to the given paths or print PEM to stdout
pub fn generate_to(
	cert_path: Option<&Path>,
	key_path: Option<&Path>,
) -> Result<(), JanusError> {
	let keys = generate()?;
	match (cert_path, key_path) {
		(Some(cert_path), Some(key_path)) => {
			std::fs::write(cert_path, keys.cert_pem)?;
			std::fs::write(key_path, keys.key_pem)?;
			restrict_key_file(key_path);
			info!(
				"Wrote certificate to {} and key to {}",
				cert_path.display(),
				key_path.display()
			);
		}
		_ => {
			println!("{}", keys.cert_pem);
			println!("{}", keys.key_pem);
		}
	}
	Ok(())
}

#[cfg(unix)]
fn restrict_key_file(path: &Path) {
	use std::os::unix::fs::PermissionsExt;
	if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
		warn!("Could not restrict key permissions: {}", e);
	}
}

#[cfg(not(unix))]
fn restrict_key_file(_path: &Path) {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_pem_pair() {
		let keys = generate().unwrap();
		assert!(keys.cert_pem.contains("BEGIN CERTIFICATE"));
		// Leaf plus CA
		assert_eq!(keys.cert_pem.matches("BEGIN CERTIFICATE").count(), 2);
		assert!(keys.key_pem.contains("PRIVATE KEY"));
	}

	#[test]
	fn generated_certs_load_as_tls_material() {
		let tmp = tempfile::TempDir::new().unwrap();
		let cert = tmp.path().join("cert.pem");
		let key = tmp.path().join("key.pem");
		generate_to(Some(&cert), Some(&key)).unwrap();

		assert!(crate::tls::server_config(&cert, &key).is_ok());
		assert!(crate::tls::client_config(&cert).is_ok());
	}
}

// vim: ts=4
