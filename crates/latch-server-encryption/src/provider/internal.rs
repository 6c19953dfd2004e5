// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Password-derived keys.

use async_trait::async_trait;
use latch_server_config::{KeyConfig, KeyProviderKind};
use zeroize::Zeroizing;

use super::{wrong_material, KeyMaterial, KeyProvider, ResolvedKey};
use crate::cipher::{self, EncryptedData};
use crate::error::{EncryptionError, Result};

/// AES-256-GCM with keys derived by PBKDF2-HMAC-SHA384 from a password and
/// the salt stored in the key's canary.
#[derive(Debug, Clone)]
pub struct InternalKeyProvider {
	iterations: u32,
}

impl InternalKeyProvider {
	pub fn new(iterations: u32) -> Self {
		Self { iterations }
	}
}

#[async_trait]
impl KeyProvider for InternalKeyProvider {
	fn kind(&self) -> KeyProviderKind {
		KeyProviderKind::Internal
	}

	fn derives_from_salt(&self) -> bool {
		true
	}

	#[tracing::instrument(skip(self, config, salt), fields(fresh_salt = salt.is_none()))]
	async fn resolve_key(&self, config: &KeyConfig, salt: Option<&[u8]>) -> Result<ResolvedKey> {
		let password = config.password.as_ref().ok_or_else(|| {
			EncryptionError::InvalidKeyConfig("internal key has no password".to_string())
		})?;

		let salt = match salt {
			Some(salt) => salt.to_vec(),
			None => cipher::generate_salt(),
		};

		let password = Zeroizing::new(password.expose().as_bytes().to_vec());
		let iterations = self.iterations;
		let derive_salt = salt.clone();
		// PBKDF2 at production iteration counts takes long enough to stall a runtime worker.
		let key = tokio::task::spawn_blocking(move || {
			cipher::derive_key(&password, &derive_salt, iterations)
		})
		.await
		.map_err(|e| EncryptionError::Encryption(format!("key derivation task failed: {e}")))?;

		Ok(ResolvedKey {
			material: KeyMaterial::Local(key),
			salt: Some(salt),
		})
	}

	async fn encrypt(&self, key: &KeyMaterial, plaintext: &[u8]) -> Result<EncryptedData> {
		match key {
			KeyMaterial::Local(key) => cipher::seal(key, plaintext),
			other => Err(wrong_material(self.kind(), other)),
		}
	}

	async fn decrypt(
		&self,
		key: &KeyMaterial,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> Result<Zeroizing<Vec<u8>>> {
		match key {
			KeyMaterial::Local(key) => cipher::open(key, ciphertext, nonce),
			other => Err(wrong_material(self.kind(), other)),
		}
	}

	async fn reconnect(&self) -> Result<()> {
		Ok(())
	}
}
