// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use latch_server_config::KeyConfig;
use latch_server_encryption::{ProviderRegistry, RetryingEncryptionService, SoftHsmClient};

use super::support::{encryption_config, TestDatabase};

async fn start_hsm(
	db: &TestDatabase,
	client: Arc<SoftHsmClient>,
	key_creation_enabled: bool,
) -> Arc<RetryingEncryptionService> {
	let mut config = encryption_config(vec![KeyConfig::hsm("latch-1", true)]);
	config.key_creation_enabled = key_creation_enabled;
	let providers = ProviderRegistry::from_config(&config, Some(client)).unwrap();
	db.start_with(config, providers).await
}

#[tokio::test]
async fn lost_session_is_recovered_by_reconnect() {
	let db = TestDatabase::new().await;
	let client = Arc::new(SoftHsmClient::new());
	let encryption = start_hsm(&db, client.clone(), true).await;
	let value = encryption.encrypt("hunter2").await.unwrap();

	client.drop_session().await;

	assert_eq!(encryption.decrypt_value(&value).await.unwrap(), "hunter2");
	assert_eq!(client.reconnect_count(), 1);
	assert_eq!(encryption.reconnect_count(), 1);
}

#[tokio::test]
async fn message_only_session_errors_are_recovered() {
	let db = TestDatabase::new().await;
	let client = Arc::new(SoftHsmClient::with_message_only_errors());
	let encryption = start_hsm(&db, client.clone(), true).await;

	client.drop_session().await;

	let value = encryption.encrypt("hunter2").await.unwrap();
	assert_eq!(client.reconnect_count(), 1);
	assert_eq!(encryption.decrypt_value(&value).await.unwrap(), "hunter2");
}

#[tokio::test]
async fn instance_without_key_creation_uses_key_made_by_sibling() {
	let db = TestDatabase::new().await;
	let client = Arc::new(SoftHsmClient::new());

	let creator = start_hsm(&db, client.clone(), true).await;
	let value = creator.encrypt("shared").await.unwrap();

	let follower = start_hsm(&db, client, false).await;

	assert_eq!(
		follower.key_set().active_uuid().await,
		creator.key_set().active_uuid().await
	);
	assert_eq!(follower.decrypt_value(&value).await.unwrap(), "shared");
	assert_eq!(db.canary_uuids().await.len(), 1);
}
