// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wires configuration, database and encryption core together.

use std::collections::BTreeSet;
use std::sync::Arc;

use latch_server_config::{EncryptionConfig, ServerConfig};
use latch_server_db::{
	create_pool, run_migrations, CanaryRepository, DbError, EncryptedValueRepository,
};
use latch_server_encryption::{
	EncryptionError, EncryptionKeyCanaryMapper, EncryptionKeyRotator, EncryptionKeySet, HsmClient,
	KeyUsage, ProviderRegistry, RetryingEncryptionService, RotationReport,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
	#[error(transparent)]
	Database(#[from] DbError),

	#[error(transparent)]
	Encryption(#[from] EncryptionError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// How the configured keys line up with the canaries in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCheck {
	pub active_key_uuid: Uuid,
	pub inactive_key_uuids: BTreeSet<Uuid>,
	/// Canaries none of the configured keys can decrypt.
	pub unknown_canary_uuids: BTreeSet<Uuid>,
}

/// A started encryption core: key set loaded, ready to encrypt, decrypt and
/// rotate.
pub struct EncryptionRuntime {
	encryption: Arc<RetryingEncryptionService>,
	rotator: EncryptionKeyRotator,
}

impl EncryptionRuntime {
	/// Open the configured database, migrate it and load the key set.
	#[tracing::instrument(skip_all, fields(keys = config.encryption.keys.len()))]
	pub async fn start(config: &ServerConfig) -> Result<Self> {
		let pool = create_pool(&config.database.url).await?;
		run_migrations(&pool).await?;
		Self::with_pool(pool, &config.encryption, None).await
	}

	/// Load the key set against an already migrated pool.
	///
	/// HSM keys need `hsm_client`; nothing in this crate links a vendor
	/// library.
	pub async fn with_pool(
		pool: SqlitePool,
		config: &EncryptionConfig,
		hsm_client: Option<Arc<dyn HsmClient>>,
	) -> Result<Self> {
		let providers = ProviderRegistry::from_config(config, hsm_client)?;
		Self::with_providers(pool, config, providers).await
	}

	pub async fn with_providers(
		pool: SqlitePool,
		config: &EncryptionConfig,
		providers: ProviderRegistry,
	) -> Result<Self> {
		let canaries = Arc::new(CanaryRepository::new(pool.clone()));
		let values = Arc::new(EncryptedValueRepository::new(pool));

		let mapper = Arc::new(EncryptionKeyCanaryMapper::new(
			config.clone(),
			providers,
			canaries,
		));
		let keys = Arc::new(EncryptionKeySet::load(mapper).await?);
		let encryption = Arc::new(RetryingEncryptionService::new(keys));
		let rotator =
			EncryptionKeyRotator::new(encryption.clone(), values, config.rotation_page_size);

		info!(
			active_key_uuid = %encryption.key_set().active_uuid().await,
			keys = encryption.key_set().len().await,
			"encryption runtime started"
		);

		Ok(Self {
			encryption,
			rotator,
		})
	}

	pub fn encryption(&self) -> &Arc<RetryingEncryptionService> {
		&self.encryption
	}

	pub async fn rotate_keys(&self) -> Result<RotationReport> {
		Ok(self.rotator.rotate().await?)
	}

	pub async fn key_usage(&self) -> Result<KeyUsage> {
		Ok(self.rotator.key_usage().await?)
	}

	/// Re-run canary mapping and report which canaries resolve to which
	/// configured key.
	pub async fn check_keys(&self) -> Result<KeyCheck> {
		let mapping = self
			.encryption
			.key_set()
			.mapper()
			.map_uuids_to_keys()
			.await?;
		Ok(KeyCheck {
			active_key_uuid: mapping.active_uuid(),
			inactive_key_uuids: mapping.uuids_with_known_inactive_keys().into_iter().collect(),
			unknown_canary_uuids: mapping.unknown_canaries().iter().copied().collect(),
		})
	}
}
