// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::sync::Arc;

use latch_server_config::KeyProviderKind;
use latch_server_db::EncryptedValue;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::Result;
use crate::provider::{KeyMaterial, KeyProvider};

/// A usable key: resolved material bound to the uuid of its canary.
#[derive(Clone)]
pub struct EncryptionKey {
	uuid: Uuid,
	provider: Arc<dyn KeyProvider>,
	material: KeyMaterial,
}

impl EncryptionKey {
	pub fn new(uuid: Uuid, provider: Arc<dyn KeyProvider>, material: KeyMaterial) -> Self {
		Self {
			uuid,
			provider,
			material,
		}
	}

	pub fn uuid(&self) -> Uuid {
		self.uuid
	}

	pub fn provider_kind(&self) -> KeyProviderKind {
		self.provider.kind()
	}

	pub fn material(&self) -> &KeyMaterial {
		&self.material
	}

	pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedValue> {
		let sealed = self.provider.encrypt(&self.material, plaintext).await?;
		Ok(EncryptedValue {
			ciphertext: sealed.ciphertext,
			nonce: sealed.nonce,
			key_uuid: self.uuid,
		})
	}

	pub async fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
		self.provider.decrypt(&self.material, ciphertext, nonce).await
	}

	/// Reconnect the provider this key lives in.
	pub async fn reconnect(&self) -> Result<()> {
		self.provider.reconnect().await
	}
}

impl fmt::Debug for EncryptionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EncryptionKey")
			.field("uuid", &self.uuid)
			.field("provider", &self.provider.kind())
			.field("material", &self.material)
			.finish()
	}
}
