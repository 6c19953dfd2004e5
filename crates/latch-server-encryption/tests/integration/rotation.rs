// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashSet;
use std::sync::Arc;

use latch_server_config::KeyConfig;
use latch_server_db::EncryptedValue;
use latch_server_encryption::{EncryptionKeyRotator, KeyUsage, ProviderRegistry, SoftHsmClient};

use super::support::{encryption_config, PausingValues, TestDatabase, PASSWORD_A, PASSWORD_B};

#[tokio::test]
async fn restarted_instance_reads_existing_values() {
	let db = TestDatabase::new().await;
	let keys = vec![KeyConfig::internal(PASSWORD_A, true)];

	let first = db.start(keys.clone()).await;
	let id = db.store(&first, "hunter2").await;

	let second = db.start(keys).await;
	assert_eq!(
		second.key_set().active_uuid().await,
		first.key_set().active_uuid().await
	);
	assert_eq!(db.read(&second, id).await.0, "hunter2");
	assert_eq!(db.canary_uuids().await.len(), 1);
}

#[tokio::test]
async fn rotation_moves_values_to_new_key_and_retires_old_canary() {
	let db = TestDatabase::new().await;

	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	let old_key = before.key_set().active_uuid().await;
	let mut stored = Vec::new();
	for plaintext in ["one", "two", "three"] {
		stored.push((db.store(&before, plaintext).await, plaintext));
	}

	let after = db
		.start(vec![
			KeyConfig::internal(PASSWORD_A, false),
			KeyConfig::internal(PASSWORD_B, true),
		])
		.await;
	let new_key = after.key_set().active_uuid().await;
	assert_ne!(new_key, old_key);
	assert_eq!(
		db.read(&after, stored[0].0).await,
		("one".to_string(), old_key)
	);

	let report = db.rotator(&after, 2).rotate().await.unwrap();

	assert_eq!(report.rotated, 3);
	assert_eq!(report.failed, 0);
	assert_eq!(report.canaries_deleted, 1);
	for (id, plaintext) in stored {
		assert_eq!(db.read(&after, id).await, (plaintext.to_string(), new_key));
	}
	assert_eq!(db.canary_uuids().await, HashSet::from([new_key]));
	assert!(after.key_set().get_inactive_uuids().await.is_empty());
	assert_eq!(after.key_set().len().await, 1);
}

#[tokio::test]
async fn second_rotation_is_a_no_op() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	db.store(&before, "value").await;

	let after = db
		.start(vec![
			KeyConfig::internal(PASSWORD_A, false),
			KeyConfig::internal(PASSWORD_B, true),
		])
		.await;
	let rotator = db.rotator(&after, 10);
	rotator.rotate().await.unwrap();
	let canaries = db.canary_uuids().await;

	let again = rotator.rotate().await.unwrap();

	assert_eq!(again.rotated, 0);
	assert_eq!(again.failed, 0);
	assert_eq!(again.canaries_deleted, 0);
	assert_eq!(db.canary_uuids().await, canaries);
}

#[tokio::test]
async fn undecryptable_value_is_skipped_and_keeps_its_canary() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	let old_key = before.key_set().active_uuid().await;
	db.store(&before, "good-1").await;
	db.store(&before, "good-2").await;
	let corrupt = db
		.values
		.insert(&EncryptedValue {
			ciphertext: vec![0; 32],
			nonce: vec![0; 12],
			key_uuid: old_key,
		})
		.await
		.unwrap();

	let after = db
		.start(vec![
			KeyConfig::internal(PASSWORD_A, false),
			KeyConfig::internal(PASSWORD_B, true),
		])
		.await;
	let rotator = db.rotator(&after, 1);
	let report = rotator.rotate().await.unwrap();

	assert_eq!(report.rotated, 2);
	assert_eq!(report.failed, 1);
	assert_eq!(report.canaries_deleted, 0);
	assert!(db.canary_uuids().await.contains(&old_key));
	let row = db.values.get(corrupt).await.unwrap().unwrap();
	assert_eq!(row.value.key_uuid, old_key);
	assert_eq!(
		rotator.key_usage().await.unwrap(),
		KeyUsage {
			active_key: 2,
			inactive_keys: 1,
			unknown_keys: 0,
		}
	);
	assert_eq!(after.reconnect_count(), 0);
}

#[tokio::test]
async fn more_failing_values_than_fit_in_a_page_are_all_skipped() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	let old_key = before.key_set().active_uuid().await;

	let mut good = Vec::new();
	for i in 0..8 {
		if i % 3 == 0 {
			good.push(db.store(&before, &format!("good-{i}")).await);
		} else {
			db.values
				.insert(&EncryptedValue {
					ciphertext: vec![i; 32],
					nonce: vec![0; 12],
					key_uuid: old_key,
				})
				.await
				.unwrap();
		}
	}

	let after = db
		.start(vec![
			KeyConfig::internal(PASSWORD_A, false),
			KeyConfig::internal(PASSWORD_B, true),
		])
		.await;
	let new_key = after.key_set().active_uuid().await;
	let rotator = db.rotator(&after, 2);

	let report = rotator.rotate().await.unwrap();

	assert_eq!(report.rotated, 3);
	assert_eq!(report.failed, 5);
	assert_eq!(report.canaries_deleted, 0);
	for id in good {
		assert_eq!(db.read(&after, id).await.1, new_key);
	}
	assert_eq!(
		rotator.key_usage().await.unwrap(),
		KeyUsage {
			active_key: 3,
			inactive_keys: 5,
			unknown_keys: 0,
		}
	);
}

#[tokio::test]
async fn rotation_converges_while_old_instance_keeps_writing() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	let old_key = before.key_set().active_uuid().await;

	let mut stored = Vec::new();
	for i in 0..6 {
		let plaintext = format!("existing-{i}");
		stored.push((db.store(&before, &plaintext).await, plaintext));
	}

	let after = db
		.start(vec![
			KeyConfig::internal(PASSWORD_A, false),
			KeyConfig::internal(PASSWORD_B, true),
		])
		.await;
	let new_key = after.key_set().active_uuid().await;

	let values = Arc::new(PausingValues::new(db.values.clone(), 2));
	let rotator = EncryptionKeyRotator::new(after.clone(), values.clone(), 2);
	let rotation = tokio::spawn(async move { rotator.rotate().await });

	// First page is migrated; the rest still sits under the old key.
	values.wait_until_paused().await;

	let reads = async {
		for (id, plaintext) in &stored {
			assert_eq!(&db.read(&after, *id).await.0, plaintext);
		}
	};
	let writes = async {
		let mut written = Vec::new();
		for i in 0..3 {
			let plaintext = format!("late-{i}");
			let id = db.store(&before, &plaintext).await;
			assert_eq!(db.read(&before, id).await, (plaintext.clone(), old_key));
			written.push((id, plaintext));
		}
		written
	};
	let ((), written) = tokio::join!(reads, writes);

	values.resume().await;
	let report = rotation.await.unwrap().unwrap();

	assert_eq!(report.rotated, 9);
	assert_eq!(report.failed, 0);
	assert_eq!(report.canaries_deleted, 1);
	for (id, plaintext) in stored.into_iter().chain(written) {
		assert_eq!(db.read(&after, id).await, (plaintext, new_key));
	}
	assert_eq!(db.canary_uuids().await, HashSet::from([new_key]));
	assert!(after.key_set().get_inactive_uuids().await.is_empty());
}

#[tokio::test]
async fn rotation_moves_password_key_values_into_hsm() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	let id = db.store(&before, "to-the-hsm").await;

	let config = encryption_config(vec![
		KeyConfig::internal(PASSWORD_A, false),
		KeyConfig::hsm("latch-1", true),
	]);
	let providers = ProviderRegistry::from_config(&config, Some(Arc::new(SoftHsmClient::new()))).unwrap();
	let after = db.start_with(config, providers).await;
	let hsm_key = after.key_set().active_uuid().await;

	let report = db.rotator(&after, 10).rotate().await.unwrap();

	assert_eq!(report.rotated, 1);
	assert_eq!(report.canaries_deleted, 1);
	assert_eq!(db.read(&after, id).await, ("to-the-hsm".to_string(), hsm_key));

	let canaries = db.canaries.find_all().await.unwrap();
	assert_eq!(canaries.len(), 1);
	assert!(canaries[0].salt.is_none());
}

#[tokio::test]
async fn key_usage_reports_values_under_removed_keys() {
	let db = TestDatabase::new().await;
	let before = db.start(vec![KeyConfig::internal(PASSWORD_A, true)]).await;
	db.store(&before, "orphaned").await;

	let after = db.start(vec![KeyConfig::internal(PASSWORD_B, true)]).await;
	db.store(&after, "current").await;
	let rotator = db.rotator(&after, 10);

	assert_eq!(
		rotator.key_usage().await.unwrap(),
		KeyUsage {
			active_key: 1,
			inactive_keys: 0,
			unknown_keys: 1,
		}
	);

	// Nothing is inactive, so the orphaned value and its canary stay put.
	let report = rotator.rotate().await.unwrap();
	assert_eq!(report.rotated, 0);
	assert_eq!(db.canary_uuids().await.len(), 2);
}
