//! Challenge encryption for the mutual auth handshake
//!
//! AES-CBC with PKCS#7 padding; the random IV is prepended to the
//! ciphertext. Key lengths 16, 24 and 32 bytes select AES-128/192/256.
//! When no key is configured the challenge travels verbatim, which only
//! makes sense on a TLS-protected transport.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AuthError, JanusError};

const IV_LEN: usize = 16;

/// Length of a freshly issued challenge
pub const CHALLENGE_LEN: usize = 32;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Derive the AES-256 key for a workspace secret
///
/// Secrets are passphrases of arbitrary length; both sides hash them the
/// same way, so the derived key always matches.
pub fn derive_key(secret: &[u8]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(secret);
	hasher.finalize().into()
}

/// A random challenge for the server side of the handshake
pub fn random_challenge() -> Vec<u8> {
	let mut challenge = vec![0u8; CHALLENGE_LEN];
	rand::thread_rng().fill_bytes(&mut challenge);
	challenge
}

/// Encrypt a challenge under the workspace key, prepending the IV
pub fn encrypt_challenge(key: &[u8], plain: &[u8]) -> Result<Vec<u8>, JanusError> {
	let mut iv = [0u8; IV_LEN];
	rand::thread_rng().fill_bytes(&mut iv);

	let ciphertext = match key.len() {
		16 => Aes128CbcEnc::new_from_slices(key, &iv)
			.map_err(|_| bad_key(key.len()))?
			.encrypt_padded_vec_mut::<Pkcs7>(plain),
		24 => Aes192CbcEnc::new_from_slices(key, &iv)
			.map_err(|_| bad_key(key.len()))?
			.encrypt_padded_vec_mut::<Pkcs7>(plain),
		32 => Aes256CbcEnc::new_from_slices(key, &iv)
			.map_err(|_| bad_key(key.len()))?
			.encrypt_padded_vec_mut::<Pkcs7>(plain),
		n => return Err(bad_key(n)),
	};

	let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
	out.extend_from_slice(&iv);
	out.extend_from_slice(&ciphertext);
	Ok(out)
}

/// Decrypt an IV-prefixed challenge response
pub fn decrypt_challenge(key: &[u8], data: &[u8]) -> Result<Vec<u8>, JanusError> {
	if data.len() < IV_LEN {
		return Err(AuthError::BadCiphertext.into());
	}
	let (iv, ciphertext) = data.split_at(IV_LEN);

	let plain = match key.len() {
		16 => Aes128CbcDec::new_from_slices(key, iv)
			.map_err(|_| bad_key(key.len()))?
			.decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
		24 => Aes192CbcDec::new_from_slices(key, iv)
			.map_err(|_| bad_key(key.len()))?
			.decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
		32 => Aes256CbcDec::new_from_slices(key, iv)
			.map_err(|_| bad_key(key.len()))?
			.decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
		n => return Err(bad_key(n)),
	};

	plain.map_err(|_| AuthError::BadCiphertext.into())
}

fn bad_key(len: usize) -> JanusError {
	JanusError::Config {
		message: format!("AES key must be 16, 24 or 32 bytes, got {}", len),
	}
}


// vim: ts=4
