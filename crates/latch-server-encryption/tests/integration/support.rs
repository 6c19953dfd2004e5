// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use latch_server_config::{EncryptionConfig, KeyConfig};
use latch_server_db::testing::create_encryption_test_pool;
use latch_server_db::{
	CanaryRepository, DbError, EncryptedValue, EncryptedValueRepository, EncryptedValueRow,
	EncryptedValueStore, ValueCursor,
};
use tokio::sync::Barrier;
use latch_server_encryption::{
	EncryptionKeyCanaryMapper, EncryptionKeyRotator, EncryptionKeySet, ProviderRegistry,
	RetryingEncryptionService,
};
use uuid::Uuid;

pub const PASSWORD_A: &str = "password-a-is-at-least-twenty-chars";
pub const PASSWORD_B: &str = "password-b-is-at-least-twenty-chars";

pub fn encryption_config(keys: Vec<KeyConfig>) -> EncryptionConfig {
	EncryptionConfig {
		keys,
		kdf_iterations: 10,
		canary_poll_interval_ms: 10,
		canary_wait_timeout_secs: 1,
		hsm_key_wait_timeout_secs: 1,
		..Default::default()
	}
}

/// One database shared by every simulated instance started against it.
pub struct TestDatabase {
	pub canaries: Arc<CanaryRepository>,
	pub values: Arc<EncryptedValueRepository>,
}

impl TestDatabase {
	pub async fn new() -> Self {
		let pool = create_encryption_test_pool().await;
		Self {
			canaries: Arc::new(CanaryRepository::new(pool.clone())),
			values: Arc::new(EncryptedValueRepository::new(pool)),
		}
	}

	/// Start an instance with password-derived providers only.
	pub async fn start(&self, keys: Vec<KeyConfig>) -> Arc<RetryingEncryptionService> {
		let config = encryption_config(keys);
		let providers = ProviderRegistry::from_config(&config, None).unwrap();
		self.start_with(config, providers).await
	}

	pub async fn start_with(
		&self,
		config: EncryptionConfig,
		providers: ProviderRegistry,
	) -> Arc<RetryingEncryptionService> {
		let mapper = Arc::new(EncryptionKeyCanaryMapper::new(
			config,
			providers,
			self.canaries.clone(),
		));
		let keys = Arc::new(EncryptionKeySet::load(mapper).await.unwrap());
		Arc::new(RetryingEncryptionService::new(keys))
	}

	pub fn rotator(
		&self,
		encryption: &Arc<RetryingEncryptionService>,
		page_size: u32,
	) -> EncryptionKeyRotator {
		EncryptionKeyRotator::new(encryption.clone(), self.values.clone(), page_size)
	}

	/// Encrypt `plaintext` with the active key and store it.
	pub async fn store(&self, encryption: &RetryingEncryptionService, plaintext: &str) -> Uuid {
		let value = encryption.encrypt(plaintext).await.unwrap();
		self.values.insert(&value).await.unwrap()
	}

	/// Read a stored value back: its plaintext and the key it is under.
	pub async fn read(&self, encryption: &RetryingEncryptionService, uuid: Uuid) -> (String, Uuid) {
		let row = self.values.get(uuid).await.unwrap().unwrap();
		let plaintext = encryption.decrypt_value(&row.value).await.unwrap();
		(plaintext, row.value.key_uuid)
	}

	pub async fn canary_uuids(&self) -> HashSet<Uuid> {
		self.canaries
			.find_all()
			.await
			.unwrap()
			.into_iter()
			.map(|canary| canary.uuid)
			.collect()
	}
}

/// Value store that stops a rotation before it fetches a chosen page, so a
/// test can act while the run is half done.
pub struct PausingValues {
	inner: Arc<EncryptedValueRepository>,
	pause_before_page: u64,
	pages: AtomicU64,
	paused: Barrier,
	resumed: Barrier,
}

impl PausingValues {
	pub fn new(inner: Arc<EncryptedValueRepository>, pause_before_page: u64) -> Self {
		Self {
			inner,
			pause_before_page,
			pages: AtomicU64::new(0),
			paused: Barrier::new(2),
			resumed: Barrier::new(2),
		}
	}

	pub async fn wait_until_paused(&self) {
		self.paused.wait().await;
	}

	pub async fn resume(&self) {
		self.resumed.wait().await;
	}
}

#[async_trait]
impl EncryptedValueStore for PausingValues {
	async fn insert(&self, value: &EncryptedValue) -> Result<Uuid, DbError> {
		self.inner.insert(value).await
	}

	async fn get(&self, uuid: Uuid) -> Result<Option<EncryptedValueRow>, DbError> {
		self.inner.get(uuid).await
	}

	async fn find_by_key_uuids(
		&self,
		key_uuids: &HashSet<Uuid>,
		after: Option<ValueCursor>,
		limit: u32,
	) -> Result<Vec<EncryptedValueRow>, DbError> {
		let page = self.pages.fetch_add(1, Ordering::SeqCst) + 1;
		if page == self.pause_before_page {
			self.paused.wait().await;
			self.resumed.wait().await;
		}
		self.inner.find_by_key_uuids(key_uuids, after, limit).await
	}

	async fn update_if_key(
		&self,
		uuid: Uuid,
		expected_key_uuid: Uuid,
		value: &EncryptedValue,
	) -> Result<bool, DbError> {
		self.inner.update_if_key(uuid, expected_key_uuid, value).await
	}

	async fn count_by_key_uuid(&self) -> Result<HashMap<Uuid, u64>, DbError> {
		self.inner.count_by_key_uuid().await
	}

	async fn count_by_key_uuids(&self, key_uuids: &HashSet<Uuid>) -> Result<u64, DbError> {
		self.inner.count_by_key_uuids(key_uuids).await
	}
}
