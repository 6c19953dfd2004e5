// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciles configured keys with persisted canaries.
//!
//! Key material is never stored. Instead each key that has ever been
//! active owns a canary row: a known constant encrypted under that key.
//! At startup every canary is tried against every configured key, and the
//! canary's uuid becomes the identifier of whichever key decrypts it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use latch_server_config::EncryptionConfig;
use latch_server_db::{CanaryStore, EncryptionKeyCanary};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canary::CANARY_VALUE;
use crate::error::{EncryptionError, Result};
use crate::key::EncryptionKey;
use crate::key_proxy::KeyProxy;
use crate::provider::ProviderRegistry;
use crate::timed_retry::TimedRetry;

/// Result of one reconciliation: every key a canary resolved to, and which
/// of them is active.
#[derive(Debug, Clone)]
pub struct KeyMapping {
	keys: HashMap<Uuid, EncryptionKey>,
	active_uuid: Uuid,
	unknown_canaries: Vec<Uuid>,
}

impl KeyMapping {
	pub fn key_for_uuid(&self, uuid: Uuid) -> Option<&EncryptionKey> {
		self.keys.get(&uuid)
	}

	pub fn active_uuid(&self) -> Uuid {
		self.active_uuid
	}

	pub fn active_key(&self) -> Result<&EncryptionKey> {
		self.keys
			.get(&self.active_uuid)
			.ok_or(EncryptionError::KeyNotFound(self.active_uuid))
	}

	/// Uuids of canaries matched by a configured key that is not active.
	pub fn uuids_with_known_inactive_keys(&self) -> HashSet<Uuid> {
		self.keys
			.keys()
			.copied()
			.filter(|uuid| *uuid != self.active_uuid)
			.collect()
	}

	/// Canaries no configured key could decrypt.
	pub fn unknown_canaries(&self) -> &[Uuid] {
		&self.unknown_canaries
	}

	pub fn into_keys(self) -> (HashMap<Uuid, EncryptionKey>, Uuid) {
		(self.keys, self.active_uuid)
	}
}

pub struct EncryptionKeyCanaryMapper {
	config: EncryptionConfig,
	providers: ProviderRegistry,
	canaries: Arc<dyn CanaryStore>,
	canary_wait: TimedRetry,
}

impl EncryptionKeyCanaryMapper {
	pub fn new(
		config: EncryptionConfig,
		providers: ProviderRegistry,
		canaries: Arc<dyn CanaryStore>,
	) -> Self {
		let canary_wait = TimedRetry::new(config.canary_poll_interval(), config.canary_wait_timeout());
		Self {
			config,
			providers,
			canaries,
			canary_wait,
		}
	}

	pub fn config(&self) -> &EncryptionConfig {
		&self.config
	}

	fn active_key_index(&self) -> Result<usize> {
		let active: Vec<usize> = self
			.config
			.keys
			.iter()
			.enumerate()
			.filter(|(_, key)| key.active)
			.map(|(index, _)| index)
			.collect();

		match active.as_slice() {
			[] => Err(EncryptionError::NoActiveKey),
			[index] => Ok(*index),
			many => Err(EncryptionError::MultipleActiveKeys(many.len())),
		}
	}

	fn build_proxies(&self) -> Result<Vec<KeyProxy>> {
		self.config
			.keys
			.iter()
			.map(|key| Ok(KeyProxy::new(key.clone(), self.providers.get(key.provider)?)))
			.collect()
	}

	/// Match every persisted canary to a configured key and make sure the
	/// active key has a canary.
	#[tracing::instrument(skip(self), fields(keys = self.config.keys.len()))]
	pub async fn map_uuids_to_keys(&self) -> Result<KeyMapping> {
		let active_index = self.active_key_index()?;
		let proxies = self.build_proxies()?;
		let canaries = self.canaries.find_all().await?;

		let mut keys = HashMap::new();
		let mut active_uuid = None;
		let mut unknown_canaries = Vec::new();

		for canary in &canaries {
			match find_owner(&proxies, canary).await? {
				Some((index, key)) => {
					debug!(canary_uuid = %canary.uuid, key = %proxies[index].config().label(), "canary matched");
					if index == active_index && active_uuid.is_none() {
						active_uuid = Some(canary.uuid);
					}
					keys.insert(canary.uuid, key);
				}
				None => {
					warn!(canary_uuid = %canary.uuid, "canary matches no configured key");
					unknown_canaries.push(canary.uuid);
				}
			}
		}

		let active_uuid = match active_uuid {
			Some(uuid) => uuid,
			None => {
				let key = self.create_or_await_active_canary(&proxies[active_index]).await?;
				let uuid = key.uuid();
				keys.insert(uuid, key);
				uuid
			}
		};

		info!(
			active_key_uuid = %active_uuid,
			known_keys = keys.len(),
			unknown_canaries = unknown_canaries.len(),
			"encryption keys mapped"
		);

		Ok(KeyMapping {
			keys,
			active_uuid,
			unknown_canaries,
		})
	}

	async fn create_or_await_active_canary(&self, proxy: &KeyProxy) -> Result<EncryptionKey> {
		if self.config.key_creation_enabled {
			return self.create_canary(proxy).await;
		}

		info!(
			timeout_secs = self.canary_wait.timeout.as_secs(),
			"no canary for the active key and key creation is disabled; waiting for another instance to create it"
		);

		let found = self
			.canary_wait
			.poll(|| async move { self.find_active_canary(proxy).await })
			.await?;

		found.ok_or(EncryptionError::CanaryWaitTimeout {
			waited_secs: self.canary_wait.timeout.as_secs(),
		})
	}

	async fn find_active_canary(&self, proxy: &KeyProxy) -> Result<Option<EncryptionKey>> {
		for canary in self.canaries.find_all().await? {
			if let Some(key) = proxy.matching_key(&canary).await? {
				info!(canary_uuid = %canary.uuid, "adopted canary created by another instance");
				return Ok(Some(key));
			}
		}
		Ok(None)
	}

	async fn create_canary(&self, proxy: &KeyProxy) -> Result<EncryptionKey> {
		let resolved = proxy.key_for_new_canary().await?;
		let provider = proxy.provider();
		let sealed = provider.encrypt(&resolved.material, &CANARY_VALUE).await?;

		let canary = self
			.canaries
			.save(&EncryptionKeyCanary {
				uuid: Uuid::new_v4(),
				encrypted_canary_value: sealed.ciphertext,
				nonce: sealed.nonce,
				salt: resolved.salt,
			})
			.await?;

		info!(
			canary_uuid = %canary.uuid,
			key = %proxy.config().label(),
			"created canary for active key"
		);
		Ok(EncryptionKey::new(canary.uuid, provider, resolved.material))
	}

	/// Remove canaries. Only call once no stored value references them.
	pub async fn delete(&self, uuids: &[Uuid]) -> Result<u64> {
		Ok(self.canaries.delete(uuids).await?)
	}
}

async fn find_owner(
	proxies: &[KeyProxy],
	canary: &EncryptionKeyCanary,
) -> Result<Option<(usize, EncryptionKey)>> {
	for (index, proxy) in proxies.iter().enumerate() {
		if let Some(key) = proxy.matching_key(canary).await? {
			return Ok(Some((index, key)));
		}
	}
	Ok(None)
}
