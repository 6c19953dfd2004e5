// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process AES-256-GCM and PBKDF2 primitives.
//!
//! Shared by the password-derived provider and the software HSM.

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng},
	Aes256Gcm, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha384;
use zeroize::Zeroizing;

use crate::error::{EncryptionError, ProviderError, Result};

/// Size of encryption keys in bytes (256 bits for AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the random salt stored with password-derived key canaries.
pub const SALT_SIZE: usize = 48;

/// Ciphertext and the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
	pub ciphertext: Vec<u8>,
	pub nonce: Vec<u8>,
}

/// Generate a random encryption key.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
	let mut key = Zeroizing::new([0u8; KEY_SIZE]);
	OsRng.fill_bytes(key.as_mut());
	key
}

/// Generate a random nonce.
///
/// 96-bit random nonces are safe up to roughly 2^32 encryptions under one
/// key. Rotation moves data to a fresh key long before that.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);
	nonce
}

pub fn generate_salt() -> Vec<u8> {
	let mut salt = vec![0u8; SALT_SIZE];
	OsRng.fill_bytes(&mut salt);
	salt
}

/// Derive a key from a password with PBKDF2-HMAC-SHA384.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_SIZE]> {
	let mut key = Zeroizing::new([0u8; KEY_SIZE]);
	pbkdf2_hmac::<Sha384>(password, salt, iterations.max(1), key.as_mut());
	key
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<EncryptedData> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

	let nonce_bytes = generate_nonce();
	let nonce = Nonce::from_slice(&nonce_bytes);

	let ciphertext = cipher
		.encrypt(nonce, plaintext)
		.map_err(|e| EncryptionError::Encryption(format!("AES-GCM encryption failed: {e}")))?;

	Ok(EncryptedData {
		ciphertext,
		nonce: nonce_bytes.to_vec(),
	})
}

/// Decrypt a value sealed by [`seal`].
///
/// An authentication failure means the ciphertext was not sealed under
/// `key` and is reported as [`ProviderError::KeyMismatch`].
pub fn open(key: &[u8; KEY_SIZE], ciphertext: &[u8], nonce: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
	if nonce.len() != NONCE_SIZE {
		return Err(EncryptionError::Decryption(format!(
			"nonce must be {NONCE_SIZE} bytes, got {}",
			nonce.len()
		)));
	}

	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	let plaintext = cipher
		.decrypt(Nonce::from_slice(nonce), ciphertext)
		.map_err(|_| ProviderError::KeyMismatch)?;

	Ok(Zeroizing::new(plaintext))
}
