// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key provider backends.
//!
//! A [`KeyProvider`] turns one configured key into usable [`KeyMaterial`]
//! and performs raw encrypt/decrypt with it. Three backends exist:
//!
//! - [`InternalKeyProvider`]: AES-256-GCM in-process, key derived from a password
//! - [`HsmKeyProvider`]: key generated inside an HSM and addressed by alias
//! - [`ExternalKeyProvider`]: key held by a remote key management service

pub mod external;
pub mod hsm;
pub mod internal;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use latch_server_config::{EncryptionConfig, KeyConfig, KeyProviderKind};
use zeroize::Zeroizing;

use crate::cipher::{EncryptedData, KEY_SIZE};
use crate::error::{EncryptionError, Result};
use crate::timed_retry::TimedRetry;

pub use external::{ExternalKeyProvider, HttpKmsClient, KmsClient, KmsClientError};
pub use hsm::{HsmClient, HsmError, HsmKeyHandle, HsmKeyProvider, HsmReturnCode, SoftHsmClient};
pub use internal::InternalKeyProvider;

/// Resolved key material. Never serialized and never logged.
#[derive(Clone)]
pub enum KeyMaterial {
	/// Raw AES-256 key held in process memory.
	Local(Zeroizing<[u8; KEY_SIZE]>),
	/// Key that lives inside an HSM.
	Hsm(HsmKeyHandle),
	/// Key that lives in an external key management service.
	Remote { key_id: String },
}

impl fmt::Debug for KeyMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeyMaterial::Local(_) => f.write_str("KeyMaterial::Local([REDACTED])"),
			KeyMaterial::Hsm(handle) => f.debug_tuple("KeyMaterial::Hsm").field(handle).finish(),
			KeyMaterial::Remote { key_id } => f
				.debug_struct("KeyMaterial::Remote")
				.field("key_id", key_id)
				.finish(),
		}
	}
}

/// Key material plus the salt it was derived with, if any.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
	pub material: KeyMaterial,
	pub salt: Option<Vec<u8>>,
}

#[async_trait]
pub trait KeyProvider: Send + Sync {
	fn kind(&self) -> KeyProviderKind;

	/// Whether key material depends on a per-canary salt.
	fn derives_from_salt(&self) -> bool {
		false
	}

	/// Resolve the material for one configured key.
	///
	/// Salted providers derive from `salt`, or generate a fresh salt and
	/// return it when `salt` is `None`. Other providers ignore `salt`.
	async fn resolve_key(&self, config: &KeyConfig, salt: Option<&[u8]>) -> Result<ResolvedKey>;

	async fn encrypt(&self, key: &KeyMaterial, plaintext: &[u8]) -> Result<EncryptedData>;

	async fn decrypt(
		&self,
		key: &KeyMaterial,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> Result<Zeroizing<Vec<u8>>>;

	/// Re-establish the provider session after a transient failure.
	async fn reconnect(&self) -> Result<()>;
}

fn wrong_material(kind: KeyProviderKind, key: &KeyMaterial) -> EncryptionError {
	EncryptionError::InvalidKeyConfig(format!("{kind} provider cannot use {key:?}"))
}

/// One provider per backend kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
	providers: HashMap<KeyProviderKind, Arc<dyn KeyProvider>>,
}

impl ProviderRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Build the providers the configured keys need.
	///
	/// HSM keys are only usable when the caller supplies an [`HsmClient`];
	/// the vendor library is not linked into this crate.
	pub fn from_config(
		config: &EncryptionConfig,
		hsm_client: Option<Arc<dyn HsmClient>>,
	) -> Result<Self> {
		let mut registry = Self::new();
		registry.register(Arc::new(InternalKeyProvider::new(config.kdf_iterations)));

		let needs = |kind: KeyProviderKind| config.keys.iter().any(|k| k.provider == kind);

		if let Some(client) = hsm_client {
			registry.register(Arc::new(HsmKeyProvider::new(
				client,
				config.key_creation_enabled,
				TimedRetry::new(config.canary_poll_interval(), config.hsm_key_wait_timeout()),
			)));
		} else if needs(KeyProviderKind::Hsm) {
			return Err(EncryptionError::InvalidKeyConfig(
				"hsm keys are configured but no HSM client is available".to_string(),
			));
		}

		if let Some(external) = &config.external {
			let client = HttpKmsClient::new(external).map_err(|e| {
				EncryptionError::InvalidKeyConfig(format!("external KMS client: {e}"))
			})?;
			registry.register(Arc::new(ExternalKeyProvider::new(Arc::new(client))));
		} else if needs(KeyProviderKind::External) {
			return Err(EncryptionError::InvalidKeyConfig(
				"external keys are configured but no [encryption.external] endpoint is set"
					.to_string(),
			));
		}

		Ok(registry)
	}

	/// Register `provider`, replacing any provider of the same kind.
	pub fn register(&mut self, provider: Arc<dyn KeyProvider>) {
		self.providers.insert(provider.kind(), provider);
	}

	pub fn with_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
		self.register(provider);
		self
	}

	pub fn get(&self, kind: KeyProviderKind) -> Result<Arc<dyn KeyProvider>> {
		self.providers.get(&kind).cloned().ok_or_else(|| {
			EncryptionError::InvalidKeyConfig(format!("no {kind} key provider is registered"))
		})
	}
}

impl fmt::Debug for ProviderRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProviderRegistry")
			.field("kinds", &self.providers.keys().collect::<Vec<_>>())
			.finish()
	}
}
