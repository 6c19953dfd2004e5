// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption key configuration section.
//!
//! Keys are listed in order under `[[encryption.keys]]`. Exactly one key must
//! be marked `active`; the others are kept so that values encrypted under
//! them can still be decrypted until rotation has moved them off.

use std::time::Duration;

use latch_common_secret::SecretString;
use serde::{Deserialize, Serialize};

const DEFAULT_CANARY_WAIT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_CANARY_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_HSM_KEY_WAIT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_ROTATION_PAGE_SIZE: u32 = 1000;
const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
const DEFAULT_KMS_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Minimum accepted length of a password for a password-derived key.
pub const MIN_PASSWORD_LENGTH: usize = 20;

/// Backend that holds (or derives) the material for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyProviderKind {
	/// Key derived in-process from a password and a per-canary salt.
	Internal,
	/// Key generated and held by a hardware security module, addressed by alias.
	Hsm,
	/// Key held by an external key management service, addressed by key id.
	External,
}

impl std::fmt::Display for KeyProviderKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			KeyProviderKind::Internal => write!(f, "internal"),
			KeyProviderKind::Hsm => write!(f, "hsm"),
			KeyProviderKind::External => write!(f, "external"),
		}
	}
}

/// One configured encryption key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeyConfig {
	pub provider: KeyProviderKind,
	#[serde(default)]
	pub password: Option<SecretString>,
	#[serde(default)]
	pub alias: Option<String>,
	#[serde(default)]
	pub key_id: Option<String>,
	#[serde(default)]
	pub active: bool,
}

impl KeyConfig {
	pub fn internal(password: impl Into<String>, active: bool) -> Self {
		Self {
			provider: KeyProviderKind::Internal,
			password: Some(SecretString::new(password.into())),
			alias: None,
			key_id: None,
			active,
		}
	}

	pub fn hsm(alias: impl Into<String>, active: bool) -> Self {
		Self {
			provider: KeyProviderKind::Hsm,
			password: None,
			alias: Some(alias.into()),
			key_id: None,
			active,
		}
	}

	pub fn external(key_id: impl Into<String>, active: bool) -> Self {
		Self {
			provider: KeyProviderKind::External,
			password: None,
			alias: None,
			key_id: Some(key_id.into()),
			active,
		}
	}

	/// Loggable description of the key. Never includes the password.
	pub fn label(&self) -> String {
		match self.provider {
			KeyProviderKind::Internal => "internal:password".to_string(),
			KeyProviderKind::Hsm => format!("hsm:{}", self.alias.as_deref().unwrap_or("?")),
			KeyProviderKind::External => {
				format!("external:{}", self.key_id.as_deref().unwrap_or("?"))
			}
		}
	}
}

/// Connection settings for the external key management service.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalKmsConfig {
	pub endpoint: String,
	pub auth_token: Option<SecretString>,
	pub request_timeout_secs: u64,
}

impl ExternalKmsConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExternalKmsConfigLayer {
	#[serde(default)]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub auth_token: Option<SecretString>,
	#[serde(default)]
	pub request_timeout_secs: Option<u64>,
}

impl ExternalKmsConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.endpoint.is_some() {
			self.endpoint = other.endpoint;
		}
		if other.auth_token.is_some() {
			self.auth_token = other.auth_token;
		}
		if other.request_timeout_secs.is_some() {
			self.request_timeout_secs = other.request_timeout_secs;
		}
	}

	/// Returns `None` when no endpoint is configured.
	pub fn finalize(self) -> Option<ExternalKmsConfig> {
		let endpoint = self.endpoint?;
		Some(ExternalKmsConfig {
			endpoint: endpoint.trim_end_matches('/').to_string(),
			auth_token: self.auth_token,
			request_timeout_secs: self
				.request_timeout_secs
				.unwrap_or(DEFAULT_KMS_REQUEST_TIMEOUT_SECS),
		})
	}
}

/// Encryption configuration (runtime, fully resolved).
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionConfig {
	pub keys: Vec<KeyConfig>,
	/// Whether this process may create canaries and HSM keys. Disable on all
	/// but one instance when several start against the same database.
	pub key_creation_enabled: bool,
	pub canary_wait_timeout_secs: u64,
	pub canary_poll_interval_ms: u64,
	pub hsm_key_wait_timeout_secs: u64,
	pub rotation_page_size: u32,
	pub kdf_iterations: u32,
	pub external: Option<ExternalKmsConfig>,
}

impl Default for EncryptionConfig {
	fn default() -> Self {
		EncryptionConfigLayer::default().finalize()
	}
}

impl EncryptionConfig {
	pub fn canary_wait_timeout(&self) -> Duration {
		Duration::from_secs(self.canary_wait_timeout_secs)
	}

	pub fn canary_poll_interval(&self) -> Duration {
		Duration::from_millis(self.canary_poll_interval_ms)
	}

	pub fn hsm_key_wait_timeout(&self) -> Duration {
		Duration::from_secs(self.hsm_key_wait_timeout_secs)
	}

	pub fn active_keys(&self) -> impl Iterator<Item = &KeyConfig> {
		self.keys.iter().filter(|k| k.active)
	}
}

/// Encryption configuration layer (partial, for merging).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EncryptionConfigLayer {
	#[serde(default)]
	pub keys: Option<Vec<KeyConfig>>,
	#[serde(default)]
	pub key_creation_enabled: Option<bool>,
	#[serde(default)]
	pub canary_wait_timeout_secs: Option<u64>,
	#[serde(default)]
	pub canary_poll_interval_ms: Option<u64>,
	#[serde(default)]
	pub hsm_key_wait_timeout_secs: Option<u64>,
	#[serde(default)]
	pub rotation_page_size: Option<u32>,
	#[serde(default)]
	pub kdf_iterations: Option<u32>,
	#[serde(default)]
	pub external: Option<ExternalKmsConfigLayer>,
}

impl EncryptionConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.keys.is_some() {
			self.keys = other.keys;
		}
		if other.key_creation_enabled.is_some() {
			self.key_creation_enabled = other.key_creation_enabled;
		}
		if other.canary_wait_timeout_secs.is_some() {
			self.canary_wait_timeout_secs = other.canary_wait_timeout_secs;
		}
		if other.canary_poll_interval_ms.is_some() {
			self.canary_poll_interval_ms = other.canary_poll_interval_ms;
		}
		if other.hsm_key_wait_timeout_secs.is_some() {
			self.hsm_key_wait_timeout_secs = other.hsm_key_wait_timeout_secs;
		}
		if other.rotation_page_size.is_some() {
			self.rotation_page_size = other.rotation_page_size;
		}
		if other.kdf_iterations.is_some() {
			self.kdf_iterations = other.kdf_iterations;
		}
		match (&mut self.external, other.external) {
			(Some(base), Some(overlay)) => base.merge(overlay),
			(None, Some(overlay)) => self.external = Some(overlay),
			_ => {}
		}
	}

	pub fn finalize(self) -> EncryptionConfig {
		EncryptionConfig {
			keys: self.keys.unwrap_or_default(),
			key_creation_enabled: self.key_creation_enabled.unwrap_or(true),
			canary_wait_timeout_secs: self
				.canary_wait_timeout_secs
				.unwrap_or(DEFAULT_CANARY_WAIT_TIMEOUT_SECS),
			canary_poll_interval_ms: self
				.canary_poll_interval_ms
				.unwrap_or(DEFAULT_CANARY_POLL_INTERVAL_MS),
			hsm_key_wait_timeout_secs: self
				.hsm_key_wait_timeout_secs
				.unwrap_or(DEFAULT_HSM_KEY_WAIT_TIMEOUT_SECS),
			rotation_page_size: self
				.rotation_page_size
				.unwrap_or(DEFAULT_ROTATION_PAGE_SIZE)
				.max(1),
			kdf_iterations: self.kdf_iterations.unwrap_or(DEFAULT_KDF_ITERATIONS),
			external: self.external.and_then(|l| l.finalize()),
		}
	}
}
