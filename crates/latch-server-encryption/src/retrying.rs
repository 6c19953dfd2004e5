// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encrypt/decrypt entry point with coordinated reconnect.
//!
//! Every call runs under a shared read lock. A call that fails with a
//! transient provider error raises the `needs_reconnect` flag while still
//! holding its read lock, then queues for the write lock. The write lock is
//! granted only after every in-flight call has released its read lock, so
//! all calls that failed in the same episode have raised the flag by then.
//! The first writer clears the flag, reconnects and reloads the key set;
//! the rest find the flag clear and go straight to their single retry.
//!
//! A failed reconnect or reload is logged and does not end the call: the
//! single retry still runs and its result is what the caller sees.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use latch_server_db::EncryptedValue;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{EncryptionError, Result};
use crate::key::EncryptionKey;
use crate::key_set::EncryptionKeySet;

#[derive(Debug, Clone, Copy)]
enum KeySelector {
	Active,
	Uuid(Uuid),
}

pub struct RetryingEncryptionService {
	keys: Arc<EncryptionKeySet>,
	reconnect_lock: RwLock<()>,
	needs_reconnect: AtomicBool,
	reconnects: AtomicU64,
}

impl RetryingEncryptionService {
	pub fn new(keys: Arc<EncryptionKeySet>) -> Self {
		Self {
			keys,
			reconnect_lock: RwLock::new(()),
			needs_reconnect: AtomicBool::new(false),
			reconnects: AtomicU64::new(0),
		}
	}

	pub fn key_set(&self) -> &Arc<EncryptionKeySet> {
		&self.keys
	}

	/// Number of reconnects attempted since startup, successful or not.
	pub fn reconnect_count(&self) -> u64 {
		self.reconnects.load(Ordering::SeqCst)
	}

	/// Encrypt a credential value with the active key.
	pub async fn encrypt(&self, plaintext: &str) -> Result<EncryptedValue> {
		self.encrypt_bytes(plaintext.as_bytes()).await
	}

	#[tracing::instrument(skip_all)]
	pub async fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<EncryptedValue> {
		self.retry_on_error_with_remapping_keys(KeySelector::Active, move |key| async move {
			key.encrypt(plaintext).await
		})
		.await
	}

	/// Decrypt a value encrypted under `key_uuid`.
	///
	/// # Errors
	/// [`EncryptionError::KeyNotFound`] without any retry when no key with
	/// that uuid is registered.
	pub async fn decrypt(&self, key_uuid: Uuid, ciphertext: &[u8], nonce: &[u8]) -> Result<String> {
		let plaintext = self.decrypt_bytes(key_uuid, ciphertext, nonce).await?;
		String::from_utf8(plaintext.to_vec())
			.map_err(|_| EncryptionError::Decryption("plaintext is not valid UTF-8".to_string()))
	}

	pub async fn decrypt_value(&self, value: &EncryptedValue) -> Result<String> {
		self.decrypt(value.key_uuid, &value.ciphertext, &value.nonce).await
	}

	#[tracing::instrument(skip(self, ciphertext, nonce), fields(key_uuid = %key_uuid))]
	pub async fn decrypt_bytes(
		&self,
		key_uuid: Uuid,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> Result<Zeroizing<Vec<u8>>> {
		self.retry_on_error_with_remapping_keys(KeySelector::Uuid(key_uuid), move |key| async move {
			key.decrypt(ciphertext, nonce).await
		})
		.await
	}

	async fn select(&self, selector: KeySelector) -> Result<EncryptionKey> {
		match selector {
			KeySelector::Active => self.keys.get_active().await,
			KeySelector::Uuid(uuid) => self
				.keys
				.get(uuid)
				.await
				.ok_or(EncryptionError::KeyNotFound(uuid)),
		}
	}

	/// Run `operation` once; on a transient failure reconnect (at most once
	/// per failure episode across all callers) and run it exactly once more.
	async fn retry_on_error_with_remapping_keys<T, F, Fut>(
		&self,
		selector: KeySelector,
		operation: F,
	) -> Result<T>
	where
		F: Fn(EncryptionKey) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let (failed_key, error) = {
			let _read = self.reconnect_lock.read().await;
			let key = self.select(selector).await?;
			match operation(key.clone()).await {
				Ok(value) => return Ok(value),
				Err(e) if !e.is_retryable() => return Err(e),
				Err(e) => {
					self.needs_reconnect.store(true, Ordering::SeqCst);
					(key, e)
				}
			}
		};

		warn!(
			key_uuid = %failed_key.uuid(),
			provider = %failed_key.provider_kind(),
			error = %error,
			"transient provider failure; retrying once after reconnect"
		);

		{
			let _write = self.reconnect_lock.write().await;
			if self.needs_reconnect.swap(false, Ordering::SeqCst) {
				if let Err(e) = self.reconnect(&failed_key).await {
					warn!(
						key_uuid = %failed_key.uuid(),
						provider = %failed_key.provider_kind(),
						error = %e,
						"reconnect failed; retrying with the current key set"
					);
				}
			}
		}

		let _read = self.reconnect_lock.read().await;
		let key = self.select(selector).await?;
		operation(key).await
	}

	async fn reconnect(&self, key: &EncryptionKey) -> Result<()> {
		let total = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
		key.reconnect().await?;
		self.keys.reload().await?;
		info!(
			key_uuid = %key.uuid(),
			provider = %key.provider_kind(),
			reconnects = total,
			"provider reconnected and key set reloaded"
		);
		Ok(())
	}
}
