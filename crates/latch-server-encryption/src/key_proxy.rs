// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! One configured key and the provider that serves it.

use std::fmt;
use std::sync::Arc;

use latch_server_config::KeyConfig;
use latch_server_db::EncryptionKeyCanary;
use tokio::sync::OnceCell;

use crate::canary::is_canary_value;
use crate::error::{EncryptionError, ProviderError, Result};
use crate::key::EncryptionKey;
use crate::provider::{KeyMaterial, KeyProvider, ResolvedKey};

/// Tests whether a configured key is the key behind a persisted canary.
///
/// Salted keys are derived again for every canary from the canary's own
/// salt. Unsalted keys are resolved once and reused.
pub struct KeyProxy {
	config: KeyConfig,
	provider: Arc<dyn KeyProvider>,
	unsalted: OnceCell<KeyMaterial>,
}

impl KeyProxy {
	pub fn new(config: KeyConfig, provider: Arc<dyn KeyProvider>) -> Self {
		Self {
			config,
			provider,
			unsalted: OnceCell::new(),
		}
	}

	pub fn config(&self) -> &KeyConfig {
		&self.config
	}

	pub fn provider(&self) -> Arc<dyn KeyProvider> {
		self.provider.clone()
	}

	async fn unsalted_material(&self) -> Result<KeyMaterial> {
		self.unsalted
			.get_or_try_init(|| async {
				self.provider
					.resolve_key(&self.config, None)
					.await
					.map(|resolved| resolved.material)
			})
			.await
			.cloned()
	}

	/// Material for writing a brand new canary, with the salt to store
	/// alongside it.
	pub async fn key_for_new_canary(&self) -> Result<ResolvedKey> {
		if self.provider.derives_from_salt() {
			return self.provider.resolve_key(&self.config, None).await;
		}
		Ok(ResolvedKey {
			material: self.unsalted_material().await?,
			salt: None,
		})
	}

	async fn key_for_canary(&self, canary: &EncryptionKeyCanary) -> Result<Option<KeyMaterial>> {
		if !self.provider.derives_from_salt() {
			return self.unsalted_material().await.map(Some);
		}
		// A canary without a salt was not written by a password-derived key.
		let Some(salt) = canary.salt.as_deref() else {
			return Ok(None);
		};
		let resolved = self.provider.resolve_key(&self.config, Some(salt)).await?;
		Ok(Some(resolved.material))
	}

	/// The key behind `canary` if it is this one.
	///
	/// A provider-reported mismatch means "not this key". Any other failure
	/// is [`EncryptionError::IncorrectKey`]: it might hide a provider
	/// outage, and guessing could map a uuid to the wrong key.
	pub async fn matching_key(&self, canary: &EncryptionKeyCanary) -> Result<Option<EncryptionKey>> {
		let Some(material) = self.key_for_canary(canary).await? else {
			return Ok(None);
		};

		let decrypted = self
			.provider
			.decrypt(&material, &canary.encrypted_canary_value, &canary.nonce)
			.await;

		match decrypted {
			Ok(plaintext) if is_canary_value(&plaintext) => Ok(Some(EncryptionKey::new(
				canary.uuid,
				self.provider.clone(),
				material,
			))),
			Ok(_) => Ok(None),
			Err(EncryptionError::Provider(ProviderError::KeyMismatch)) => Ok(None),
			Err(e) => Err(EncryptionError::IncorrectKey(format!(
				"{} against canary {}: {e}",
				self.config.label(),
				canary.uuid
			))),
		}
	}

	pub async fn matches_canary(&self, canary: &EncryptionKeyCanary) -> Result<bool> {
		Ok(self.matching_key(canary).await?.is_some())
	}
}

impl fmt::Debug for KeyProxy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyProxy")
			.field("key", &self.config.label())
			.field("active", &self.config.active)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	use async_trait::async_trait;
	use latch_server_config::KeyProviderKind;
	use uuid::Uuid;
	use zeroize::Zeroizing;

	use crate::canary::{CANARY_VALUE, DEPRECATED_CANARY_VALUE};
	use crate::cipher::EncryptedData;
	use crate::provider::{HsmKeyProvider, InternalKeyProvider, SoftHsmClient};
	use crate::timed_retry::TimedRetry;

	const PASSWORD: &str = "a-password-of-at-least-twenty-chars";
	const OTHER_PASSWORD: &str = "another-password-of-twenty-chars";

	fn internal(password: &str) -> KeyProxy {
		KeyProxy::new(
			KeyConfig::internal(password, true),
			Arc::new(InternalKeyProvider::new(10)),
		)
	}

	async fn canary_for(proxy: &KeyProxy, plaintext: &[u8]) -> EncryptionKeyCanary {
		let resolved = proxy.key_for_new_canary().await.unwrap();
		let sealed = proxy
			.provider()
			.encrypt(&resolved.material, plaintext)
			.await
			.unwrap();
		EncryptionKeyCanary {
			uuid: Uuid::new_v4(),
			encrypted_canary_value: sealed.ciphertext,
			nonce: sealed.nonce,
			salt: resolved.salt,
		}
	}

	#[tokio::test]
	async fn password_key_matches_its_own_canary_only() {
		let ours = internal(PASSWORD);
		let theirs = internal(OTHER_PASSWORD);
		let canary = canary_for(&ours, &CANARY_VALUE).await;

		assert!(ours.matches_canary(&canary).await.unwrap());
		assert!(!theirs.matches_canary(&canary).await.unwrap());
	}

	#[tokio::test]
	async fn deprecated_canary_value_still_matches() {
		let proxy = internal(PASSWORD);
		let canary = canary_for(&proxy, &DEPRECATED_CANARY_VALUE).await;
		assert!(proxy.matches_canary(&canary).await.unwrap());
	}

	#[tokio::test]
	async fn unexpected_plaintext_does_not_match() {
		let proxy = internal(PASSWORD);
		let canary = canary_for(&proxy, b"not a canary").await;
		assert!(!proxy.matches_canary(&canary).await.unwrap());
	}

	#[tokio::test]
	async fn password_key_skips_unsalted_canary() {
		let hsm = KeyProxy::new(
			KeyConfig::hsm("latch-1", true),
			Arc::new(HsmKeyProvider::new(
				Arc::new(SoftHsmClient::new()),
				true,
				TimedRetry::new(Duration::from_millis(10), Duration::from_millis(50)),
			)),
		);
		let canary = canary_for(&hsm, &CANARY_VALUE).await;
		assert!(canary.salt.is_none());

		assert!(!internal(PASSWORD).matches_canary(&canary).await.unwrap());
		assert!(hsm.matches_canary(&canary).await.unwrap());
	}

	#[tokio::test]
	async fn matching_key_carries_canary_uuid() {
		let proxy = internal(PASSWORD);
		let canary = canary_for(&proxy, &CANARY_VALUE).await;
		let key = proxy.matching_key(&canary).await.unwrap().unwrap();
		assert_eq!(key.uuid(), canary.uuid);
	}

	struct BrokenProvider;

	#[async_trait]
	impl KeyProvider for BrokenProvider {
		fn kind(&self) -> KeyProviderKind {
			KeyProviderKind::External
		}

		async fn resolve_key(&self, _: &KeyConfig, _: Option<&[u8]>) -> Result<ResolvedKey> {
			Ok(ResolvedKey {
				material: KeyMaterial::Remote {
					key_id: "broken".to_string(),
				},
				salt: None,
			})
		}

		async fn encrypt(&self, _: &KeyMaterial, _: &[u8]) -> Result<EncryptedData> {
			Err(ProviderError::Other("library fault".to_string()).into())
		}

		async fn decrypt(&self, _: &KeyMaterial, _: &[u8], _: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
			Err(ProviderError::Other("library fault".to_string()).into())
		}

		async fn reconnect(&self) -> Result<()> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn unrecognized_provider_failure_is_fatal() {
		let proxy = KeyProxy::new(KeyConfig::external("broken", true), Arc::new(BrokenProvider));
		let canary = EncryptionKeyCanary {
			uuid: Uuid::new_v4(),
			encrypted_canary_value: vec![1, 2, 3],
			nonce: vec![0; 12],
			salt: None,
		};

		let result = proxy.matches_canary(&canary).await;
		assert!(matches!(result, Err(EncryptionError::IncorrectKey(_))));
	}
}
