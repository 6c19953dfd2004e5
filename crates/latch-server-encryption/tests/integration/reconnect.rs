// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use latch_server_config::KeyConfig;
use latch_server_encryption::testing::FlakyKeyProvider;
use latch_server_encryption::{
	EncryptionError, ProviderError, ProviderRegistry, RetryingEncryptionService,
};
use uuid::Uuid;

use super::support::{encryption_config, TestDatabase, PASSWORD_A, PASSWORD_B};

async fn start_flaky(
	db: &TestDatabase,
	provider: FlakyKeyProvider,
) -> (Arc<RetryingEncryptionService>, Arc<FlakyKeyProvider>) {
	let provider = Arc::new(provider);
	let config = encryption_config(vec![KeyConfig::internal(PASSWORD_A, true)]);
	let providers = ProviderRegistry::from_config(&config, None)
		.unwrap()
		.with_provider(provider.clone());
	(db.start_with(config, providers).await, provider)
}

#[tokio::test]
async fn encrypt_recovers_after_one_reconnect() {
	let db = TestDatabase::new().await;
	let (encryption, provider) = start_flaky(&db, FlakyKeyProvider::new(10)).await;
	let active = encryption.key_set().active_uuid().await;

	provider.disconnect();
	let value = encryption.encrypt("hunter2").await.unwrap();

	assert_eq!(value.key_uuid, active);
	assert_eq!(provider.reconnect_count(), 1);
	assert_eq!(encryption.reconnect_count(), 1);
	assert_eq!(encryption.decrypt_value(&value).await.unwrap(), "hunter2");
}

#[tokio::test]
async fn decrypt_recovers_after_one_reconnect() {
	let db = TestDatabase::new().await;
	let (encryption, provider) = start_flaky(&db, FlakyKeyProvider::new(10)).await;
	let value = encryption.encrypt("hunter2").await.unwrap();

	provider.disconnect();

	assert_eq!(encryption.decrypt_value(&value).await.unwrap(), "hunter2");
	assert_eq!(provider.reconnect_count(), 1);
}

fn is_connection_lost(result: &Result<impl std::fmt::Debug, EncryptionError>) -> bool {
	matches!(
		result,
		Err(EncryptionError::Provider(ProviderError::ConnectionLost(_)))
	)
}

#[tokio::test]
async fn persistent_failure_returns_the_retried_error() {
	let db = TestDatabase::new().await;
	let (encryption, provider) = start_flaky(&db, FlakyKeyProvider::new(10)).await;
	let attempts_before = provider.attempt_count();

	provider.stay_broken();
	provider.disconnect();

	// The key set reload after reconnecting fails too, but the single retry
	// still runs and its error is what comes back.
	let result = encryption.encrypt("hunter2").await;

	assert!(is_connection_lost(&result), "{result:?}");
	assert_eq!(provider.reconnect_count(), 1);
	assert_eq!(encryption.reconnect_count(), 1);
	// Original call, the reload's canary check, and the retry.
	assert_eq!(provider.attempt_count() - attempts_before, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_persistent_failures_all_return_the_same_error() {
	const CALLERS: usize = 8;

	let db = TestDatabase::new().await;
	let (encryption, provider) =
		start_flaky(&db, FlakyKeyProvider::new(10).with_failure_barrier(CALLERS)).await;
	let attempts_before = provider.attempt_count();

	provider.stay_broken();
	provider.disconnect();

	let mut tasks = Vec::new();
	for i in 0..CALLERS {
		let encryption = encryption.clone();
		tasks.push(tokio::spawn(async move {
			encryption.encrypt(&format!("value-{i}")).await
		}));
	}

	for task in tasks {
		let result = task.await.unwrap();
		assert!(is_connection_lost(&result), "{result:?}");
	}
	assert_eq!(provider.reconnect_count(), 1);
	assert_eq!(encryption.reconnect_count(), 1);
	assert_eq!(
		provider.attempt_count() - attempts_before,
		2 * CALLERS as u64 + 1
	);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_share_one_reconnect() {
	const CALLERS: usize = 8;

	let db = TestDatabase::new().await;
	let (encryption, provider) =
		start_flaky(&db, FlakyKeyProvider::new(10).with_failure_barrier(CALLERS)).await;

	provider.disconnect();

	let mut tasks = Vec::new();
	for i in 0..CALLERS {
		let encryption = encryption.clone();
		tasks.push(tokio::spawn(async move {
			let plaintext = format!("value-{i}");
			let value = encryption.encrypt(&plaintext).await.unwrap();
			(plaintext, value)
		}));
	}

	for task in tasks {
		let (plaintext, value) = task.await.unwrap();
		assert_eq!(encryption.decrypt_value(&value).await.unwrap(), plaintext);
	}
	assert_eq!(provider.reconnect_count(), 1);
	assert_eq!(encryption.reconnect_count(), 1);
}

#[tokio::test]
async fn value_under_unconfigured_key_is_not_found() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	let orphan = db.store(&before, "orphaned").await;

	let after = db.start(vec![KeyConfig::internal(PASSWORD_B, true)]).await;
	let row = db.values.get(orphan).await.unwrap().unwrap();

	let result = after.decrypt_value(&row.value).await;

	assert!(matches!(result, Err(EncryptionError::KeyNotFound(uuid)) if uuid == row.value.key_uuid));
	assert_eq!(after.reconnect_count(), 0);

	let stranger = Uuid::new_v4();
	assert!(matches!(
		after.decrypt(stranger, b"ciphertext", &[0; 12]).await,
		Err(EncryptionError::KeyNotFound(uuid)) if uuid == stranger
	));
}
