// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::canary_mapper::EncryptionKeyCanaryMapper;
use crate::error::{EncryptionError, Result};
use crate::key::EncryptionKey;

struct KeySetState {
	keys: HashMap<Uuid, EncryptionKey>,
	active_uuid: Uuid,
}

/// Every key this process can use, and the one new values are encrypted
/// with.
///
/// `reload` rebuilds the whole set from configuration and canaries and
/// swaps it in atomically; readers see either the old set or the new one.
pub struct EncryptionKeySet {
	mapper: Arc<EncryptionKeyCanaryMapper>,
	state: RwLock<Arc<KeySetState>>,
}

impl EncryptionKeySet {
	/// Map canaries to keys and build the initial set.
	pub async fn load(mapper: Arc<EncryptionKeyCanaryMapper>) -> Result<Self> {
		let state = Self::build(&mapper).await?;
		Ok(Self {
			mapper,
			state: RwLock::new(Arc::new(state)),
		})
	}

	async fn build(mapper: &EncryptionKeyCanaryMapper) -> Result<KeySetState> {
		let (keys, active_uuid) = mapper.map_uuids_to_keys().await?.into_keys();
		Ok(KeySetState { keys, active_uuid })
	}

	pub fn mapper(&self) -> &Arc<EncryptionKeyCanaryMapper> {
		&self.mapper
	}

	async fn snapshot(&self) -> Arc<KeySetState> {
		self.state.read().await.clone()
	}

	pub async fn get(&self, uuid: Uuid) -> Option<EncryptionKey> {
		self.snapshot().await.keys.get(&uuid).cloned()
	}

	pub async fn get_active(&self) -> Result<EncryptionKey> {
		let state = self.snapshot().await;
		state
			.keys
			.get(&state.active_uuid)
			.cloned()
			.ok_or(EncryptionError::KeyNotFound(state.active_uuid))
	}

	pub async fn active_uuid(&self) -> Uuid {
		self.snapshot().await.active_uuid
	}

	/// Uuids of every registered key except the active one.
	pub async fn get_inactive_uuids(&self) -> HashSet<Uuid> {
		let state = self.snapshot().await;
		state
			.keys
			.keys()
			.copied()
			.filter(|uuid| *uuid != state.active_uuid)
			.collect()
	}

	pub async fn len(&self) -> usize {
		self.snapshot().await.keys.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Register a key that is not part of the current configuration. It
	/// stays until the next `reload`.
	pub async fn add(&self, key: EncryptionKey) {
		let mut guard = self.state.write().await;
		let mut keys = guard.keys.clone();
		keys.insert(key.uuid(), key);
		let active_uuid = guard.active_uuid;
		*guard = Arc::new(KeySetState { keys, active_uuid });
	}

	pub async fn set_active(&self, uuid: Uuid) -> Result<()> {
		let mut guard = self.state.write().await;
		if !guard.keys.contains_key(&uuid) {
			return Err(EncryptionError::KeyNotFound(uuid));
		}
		let keys = guard.keys.clone();
		*guard = Arc::new(KeySetState {
			keys,
			active_uuid: uuid,
		});
		info!(active_key_uuid = %uuid, "active encryption key changed");
		Ok(())
	}

	/// Re-run canary mapping and replace the whole set.
	///
	/// Mapping runs without holding the lock. If it fails the current set
	/// stays in place.
	pub async fn reload(&self) -> Result<()> {
		let state = Self::build(&self.mapper).await?;
		let active_uuid = state.active_uuid;
		let count = state.keys.len();
		*self.state.write().await = Arc::new(state);
		info!(active_key_uuid = %active_uuid, keys = count, "encryption key set reloaded");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use latch_server_config::{EncryptionConfig, KeyConfig};
	use latch_server_db::testing::create_encryption_test_pool;
	use latch_server_db::CanaryRepository;

	use crate::provider::{InternalKeyProvider, KeyMaterial, ProviderRegistry};

	const PASSWORD_A: &str = "password-a-is-at-least-twenty-chars";
	const PASSWORD_B: &str = "password-b-is-at-least-twenty-chars";

	async fn key_set(keys: Vec<KeyConfig>) -> EncryptionKeySet {
		let config = EncryptionConfig {
			keys,
			kdf_iterations: 10,
			..Default::default()
		};
		let providers = ProviderRegistry::from_config(&config, None).unwrap();
		let store = Arc::new(CanaryRepository::new(create_encryption_test_pool().await));
		let mapper = Arc::new(EncryptionKeyCanaryMapper::new(config, providers, store));
		EncryptionKeySet::load(mapper).await.unwrap()
	}

	fn legacy_key() -> EncryptionKey {
		EncryptionKey::new(
			Uuid::new_v4(),
			Arc::new(InternalKeyProvider::new(10)),
			KeyMaterial::Local(crate::cipher::generate_key()),
		)
	}

	#[tokio::test]
	async fn active_key_is_registered() {
		let set = key_set(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
		let active = set.get_active().await.unwrap();
		assert_eq!(active.uuid(), set.active_uuid().await);
		assert!(set.get(active.uuid()).await.is_some());
		assert!(set.get_inactive_uuids().await.is_empty());
	}

	#[tokio::test]
	async fn added_key_is_inactive() {
		let set = key_set(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
		let legacy = legacy_key();
		set.add(legacy.clone()).await;

		assert_eq!(set.len().await, 2);
		assert_eq!(
			set.get_inactive_uuids().await,
			HashSet::from([legacy.uuid()])
		);
	}

	#[tokio::test]
	async fn set_active_requires_registered_key() {
		let set = key_set(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
		let stranger = Uuid::new_v4();
		assert!(matches!(
			set.set_active(stranger).await,
			Err(EncryptionError::KeyNotFound(u)) if u == stranger
		));

		let legacy = legacy_key();
		set.add(legacy.clone()).await;
		set.set_active(legacy.uuid()).await.unwrap();
		assert_eq!(set.active_uuid().await, legacy.uuid());
	}

	#[tokio::test]
	async fn reload_drops_added_keys_and_keeps_active_uuid() {
		let set = key_set(vec![
			KeyConfig::internal(PASSWORD_A, false),
			KeyConfig::internal(PASSWORD_B, true),
		])
		.await;
		let active = set.active_uuid().await;
		set.add(legacy_key()).await;

		set.reload().await.unwrap();

		assert_eq!(set.active_uuid().await, active);
		assert_eq!(set.len().await, 1);
	}

	#[tokio::test]
	async fn encrypt_with_active_key_decrypts() {
		let set = key_set(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
		let active = set.get_active().await.unwrap();

		let value = active.encrypt(b"hunter2").await.unwrap();
		assert_eq!(value.key_uuid, active.uuid());

		let key = set.get(value.key_uuid).await.unwrap();
		let plaintext = key.decrypt(&value.ciphertext, &value.nonce).await.unwrap();
		assert_eq!(plaintext.as_slice(), b"hunter2");
	}
}
