// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Moves stored values off inactive keys and retires their canaries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use latch_server_db::{EncryptedValueRow, EncryptedValueStore, ValueCursor};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::retrying::RetryingEncryptionService;

/// Outcome of one rotation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
	pub rotated: u64,
	pub failed: u64,
	pub canaries_deleted: u64,
	pub duration: Duration,
}

/// Stored value counts by key state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyUsage {
	pub active_key: u64,
	pub inactive_keys: u64,
	/// Values under a uuid no configured key resolves. These cannot be
	/// decrypted until the matching key is configured again.
	pub unknown_keys: u64,
}

pub struct EncryptionKeyRotator {
	encryption: Arc<RetryingEncryptionService>,
	values: Arc<dyn EncryptedValueStore>,
	page_size: u32,
}

impl EncryptionKeyRotator {
	pub fn new(
		encryption: Arc<RetryingEncryptionService>,
		values: Arc<dyn EncryptedValueStore>,
		page_size: u32,
	) -> Self {
		Self {
			encryption,
			values,
			page_size: page_size.max(1),
		}
	}

	/// Re-encrypt every value stored under an inactive key with the active
	/// key, then delete the canaries of inactive keys nothing references.
	///
	/// A value that fails to migrate is logged, left untouched under its old
	/// key and skipped for the rest of the run. Its key keeps its canary so
	/// a later run can retry. Once canaries are deleted the key set is
	/// reloaded so the retired keys drop out of it.
	#[tracing::instrument(skip(self), fields(page_size = self.page_size))]
	pub async fn rotate(&self) -> Result<RotationReport> {
		let started = Instant::now();
		let keys = self.encryption.key_set();
		let inactive = keys.get_inactive_uuids().await;
		let mut report = RotationReport::default();

		if inactive.is_empty() {
			info!("no inactive keys; nothing to rotate");
			report.duration = started.elapsed();
			return Ok(report);
		}

		let active_key_uuid = keys.active_uuid().await;
		info!(
			inactive_keys = inactive.len(),
			active_key_uuid = %active_key_uuid,
			"starting key rotation"
		);

		let mut cursor: Option<ValueCursor> = None;
		loop {
			let page = self
				.values
				.find_by_key_uuids(&inactive, cursor, self.page_size)
				.await?;
			let Some(last) = page.last() else {
				break;
			};
			cursor = Some(ValueCursor::from(last));

			debug!(rows = page.len(), "rotating page");
			for row in page {
				match self.rotate_row(&row).await {
					Ok(true) => report.rotated += 1,
					Ok(false) => {
						debug!(value_uuid = %row.uuid, "value changed during rotation; left to its writer")
					}
					Err(e) => {
						warn!(
							value_uuid = %row.uuid,
							key_uuid = %row.value.key_uuid,
							error = %e,
							"failed to rotate value; skipping"
						);
						report.failed += 1;
					}
				}
			}
		}

		let remaining = self.values.count_by_key_uuid().await?;
		let retired: Vec<Uuid> = inactive
			.iter()
			.copied()
			.filter(|uuid| remaining.get(uuid).copied().unwrap_or(0) == 0)
			.collect();
		report.canaries_deleted = keys.mapper().delete(&retired).await?;
		if report.canaries_deleted > 0 {
			if let Err(e) = keys.reload().await {
				warn!(error = %e, "failed to reload key set after retiring canaries");
			}
		}

		report.duration = started.elapsed();
		info!(
			rotated = report.rotated,
			failed = report.failed,
			canaries_deleted = report.canaries_deleted,
			duration_ms = report.duration.as_millis() as u64,
			"key rotation finished"
		);
		Ok(report)
	}

	/// Returns `false` when the row was rewritten by someone else first.
	async fn rotate_row(&self, row: &EncryptedValueRow) -> Result<bool> {
		let plaintext = self
			.encryption
			.decrypt_bytes(row.value.key_uuid, &row.value.ciphertext, &row.value.nonce)
			.await?;
		let reencrypted = self.encryption.encrypt_bytes(&plaintext).await?;
		Ok(self
			.values
			.update_if_key(row.uuid, row.value.key_uuid, &reencrypted)
			.await?)
	}

	/// Count stored values under the active key, inactive keys, and keys
	/// this process cannot resolve.
	pub async fn key_usage(&self) -> Result<KeyUsage> {
		let keys = self.encryption.key_set();
		let active = keys.active_uuid().await;
		let inactive = keys.get_inactive_uuids().await;

		let mut usage = KeyUsage::default();
		for (uuid, count) in self.values.count_by_key_uuid().await? {
			if uuid == active {
				usage.active_key += count;
			} else if inactive.contains(&uuid) {
				usage.inactive_keys += count;
			} else {
				usage.unknown_keys += count;
			}
		}
		Ok(usage)
	}
}
