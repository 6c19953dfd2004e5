// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use latch_server_db::DbError;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a key provider, reduced to the cases callers act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
	/// The ciphertext was not produced by this key.
	#[error("ciphertext does not belong to this key")]
	KeyMismatch,

	/// The provider session or connection is gone; reconnecting may help.
	#[error("provider connection lost: {0}")]
	ConnectionLost(String),

	/// The provider is temporarily unreachable or overloaded.
	#[error("provider unavailable: {0}")]
	Unavailable(String),

	/// The provider refused the request.
	#[error("provider rejected request: {0}")]
	Rejected(String),

	#[error("provider error: {0}")]
	Other(String),
}

impl ProviderError {
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			ProviderError::ConnectionLost(_) | ProviderError::Unavailable(_)
		)
	}
}

#[derive(Debug, Error)]
pub enum EncryptionError {
	#[error("No active key was found")]
	NoActiveKey,

	#[error("Exactly one active key is allowed, found {0}")]
	MultipleActiveKeys(usize),

	#[error("Invalid key configuration: {0}")]
	InvalidKeyConfig(String),

	#[error("No encryption key registered for uuid {0}")]
	KeyNotFound(Uuid),

	#[error("Could not determine whether key matches canary: {0}")]
	IncorrectKey(String),

	#[error("Timed out after {waited_secs}s waiting for another process to create the active canary")]
	CanaryWaitTimeout { waited_secs: u64 },

	#[error("Timed out after {waited_secs}s waiting for HSM key '{alias}' to be created")]
	HsmKeyWaitTimeout { alias: String, waited_secs: u64 },

	#[error("Encryption failed: {0}")]
	Encryption(String),

	#[error("Decryption failed: {0}")]
	Decryption(String),

	#[error(transparent)]
	Provider(#[from] ProviderError),

	#[error(transparent)]
	Database(#[from] DbError),
}

impl EncryptionError {
	/// Whether a reconnect followed by one more attempt could succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			EncryptionError::Provider(e) => e.is_transient(),
			EncryptionError::Database(e) => e.is_transient(),
			_ => false,
		}
	}
}

pub type Result<T> = std::result::Result<T, EncryptionError>;
