// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fault-injecting provider for exercising reconnect behaviour.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use latch_server_config::{KeyConfig, KeyProviderKind};
use tokio::sync::Barrier;
use zeroize::Zeroizing;

use crate::cipher::EncryptedData;
use crate::error::{ProviderError, Result};
use crate::provider::{InternalKeyProvider, KeyMaterial, KeyProvider, ResolvedKey};

/// Password-derived provider whose connection can be cut.
///
/// While disconnected every encrypt/decrypt fails with
/// [`ProviderError::ConnectionLost`]. `reconnect` restores the connection
/// unless the provider was told to stay broken.
pub struct FlakyKeyProvider {
	inner: InternalKeyProvider,
	connected: AtomicBool,
	heals_on_reconnect: AtomicBool,
	failure_barrier: Option<Arc<Barrier>>,
	attempts: AtomicU64,
	reconnects: AtomicU64,
}

impl FlakyKeyProvider {
	pub fn new(kdf_iterations: u32) -> Self {
		Self {
			inner: InternalKeyProvider::new(kdf_iterations),
			connected: AtomicBool::new(true),
			heals_on_reconnect: AtomicBool::new(true),
			failure_barrier: None,
			attempts: AtomicU64::new(0),
			reconnects: AtomicU64::new(0),
		}
	}

	/// Until the first reconnect, every failing call waits for `parties`
	/// failing calls before it returns its error. Lets a test line up
	/// concurrent failures without sleeps.
	pub fn with_failure_barrier(mut self, parties: usize) -> Self {
		self.failure_barrier = Some(Arc::new(Barrier::new(parties)));
		self
	}

	pub fn disconnect(&self) {
		self.connected.store(false, Ordering::SeqCst);
	}

	/// Make `reconnect` succeed without restoring the connection.
	pub fn stay_broken(&self) {
		self.heals_on_reconnect.store(false, Ordering::SeqCst);
	}

	pub fn reconnect_count(&self) -> u64 {
		self.reconnects.load(Ordering::SeqCst)
	}

	/// Encrypt and decrypt calls seen, failed or not.
	pub fn attempt_count(&self) -> u64 {
		self.attempts.load(Ordering::SeqCst)
	}

	async fn check_connection(&self) -> Result<()> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		if self.connected.load(Ordering::SeqCst) {
			return Ok(());
		}
		if let Some(barrier) = &self.failure_barrier {
			if self.reconnect_count() == 0 {
				barrier.wait().await;
			}
		}
		Err(ProviderError::ConnectionLost("session handle invalid".to_string()).into())
	}
}

#[async_trait]
impl KeyProvider for FlakyKeyProvider {
	fn kind(&self) -> KeyProviderKind {
		KeyProviderKind::Internal
	}

	fn derives_from_salt(&self) -> bool {
		self.inner.derives_from_salt()
	}

	async fn resolve_key(&self, config: &KeyConfig, salt: Option<&[u8]>) -> Result<ResolvedKey> {
		self.inner.resolve_key(config, salt).await
	}

	async fn encrypt(&self, key: &KeyMaterial, plaintext: &[u8]) -> Result<EncryptedData> {
		self.check_connection().await?;
		self.inner.encrypt(key, plaintext).await
	}

	async fn decrypt(
		&self,
		key: &KeyMaterial,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> Result<Zeroizing<Vec<u8>>> {
		self.check_connection().await?;
		self.inner.decrypt(key, ciphertext, nonce).await
	}

	async fn reconnect(&self) -> Result<()> {
		self.reconnects.fetch_add(1, Ordering::SeqCst);
		if self.heals_on_reconnect.load(Ordering::SeqCst) {
			self.connected.store(true, Ordering::SeqCst);
		}
		Ok(())
	}
}
