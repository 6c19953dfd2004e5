// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HSM-backed keys.
//!
//! The HSM is reached only through [`HsmClient`]. Deployments plug in a
//! client for their vendor library; [`SoftHsmClient`] is an in-memory
//! stand-in for development and tests.
//!
//! Vendor libraries report failures as PKCS#11 return codes. The codes that
//! mean "this ciphertext was not made by this key" are what let canary
//! matching move on to the next configured key, so they are kept as a typed
//! [`HsmReturnCode`]. Some libraries surface only a message string; for
//! those the code is recovered from the text (`"... returns 0x40"` or a
//! `CKR_*` name). That fallback depends on the vendor's message format and
//! is the weakest part of the classification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use latch_server_config::{KeyConfig, KeyProviderKind};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::{wrong_material, KeyMaterial, KeyProvider, ResolvedKey};
use crate::cipher::{self, EncryptedData, KEY_SIZE, NONCE_SIZE};
use crate::error::{EncryptionError, ProviderError, Result};
use crate::timed_retry::TimedRetry;

/// PKCS#11 return codes this crate acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HsmReturnCode {
	DeviceError,
	DeviceRemoved,
	EncryptedDataInvalid,
	EncryptedDataLenRange,
	KeyHandleInvalid,
	SessionClosed,
	SessionHandleInvalid,
	TokenNotPresent,
	Other(u64),
}

const NAMED_CODES: [HsmReturnCode; 8] = [
	HsmReturnCode::DeviceError,
	HsmReturnCode::DeviceRemoved,
	HsmReturnCode::EncryptedDataInvalid,
	HsmReturnCode::EncryptedDataLenRange,
	HsmReturnCode::KeyHandleInvalid,
	HsmReturnCode::SessionClosed,
	HsmReturnCode::SessionHandleInvalid,
	HsmReturnCode::TokenNotPresent,
];

impl HsmReturnCode {
	pub fn from_code(code: u64) -> Self {
		match code {
			0x30 => Self::DeviceError,
			0x32 => Self::DeviceRemoved,
			0x40 => Self::EncryptedDataInvalid,
			0x41 => Self::EncryptedDataLenRange,
			0x60 => Self::KeyHandleInvalid,
			0xB0 => Self::SessionClosed,
			0xB3 => Self::SessionHandleInvalid,
			0xE0 => Self::TokenNotPresent,
			other => Self::Other(other),
		}
	}

	pub fn code(&self) -> u64 {
		match self {
			Self::DeviceError => 0x30,
			Self::DeviceRemoved => 0x32,
			Self::EncryptedDataInvalid => 0x40,
			Self::EncryptedDataLenRange => 0x41,
			Self::KeyHandleInvalid => 0x60,
			Self::SessionClosed => 0xB0,
			Self::SessionHandleInvalid => 0xB3,
			Self::TokenNotPresent => 0xE0,
			Self::Other(code) => *code,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::DeviceError => "CKR_DEVICE_ERROR",
			Self::DeviceRemoved => "CKR_DEVICE_REMOVED",
			Self::EncryptedDataInvalid => "CKR_ENCRYPTED_DATA_INVALID",
			Self::EncryptedDataLenRange => "CKR_ENCRYPTED_DATA_LEN_RANGE",
			Self::KeyHandleInvalid => "CKR_KEY_HANDLE_INVALID",
			Self::SessionClosed => "CKR_SESSION_CLOSED",
			Self::SessionHandleInvalid => "CKR_SESSION_HANDLE_INVALID",
			Self::TokenNotPresent => "CKR_TOKEN_NOT_PRESENT",
			Self::Other(_) => "CKR_UNKNOWN",
		}
	}

	/// Recover a return code from a vendor error message.
	pub fn parse_message(message: &str) -> Option<Self> {
		if let Some(code) = NAMED_CODES.iter().find(|c| message.contains(c.name())) {
			return Some(*code);
		}

		let lower = message.to_ascii_lowercase();
		let (_, rest) = lower.split_once("returns 0x")?;
		let digits: String = rest.chars().take_while(char::is_ascii_hexdigit).collect();
		u64::from_str_radix(&digits, 16).ok().map(Self::from_code)
	}

	pub fn classify(&self) -> ProviderError {
		match self {
			Self::EncryptedDataInvalid | Self::EncryptedDataLenRange => ProviderError::KeyMismatch,
			Self::SessionHandleInvalid
			| Self::SessionClosed
			| Self::KeyHandleInvalid
			| Self::DeviceRemoved
			| Self::DeviceError
			| Self::TokenNotPresent => ProviderError::ConnectionLost(self.name().to_string()),
			Self::Other(code) => ProviderError::Other(format!("HSM returned 0x{code:X}")),
		}
	}
}

/// Error reported by an [`HsmClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HsmError {
	pub code: Option<HsmReturnCode>,
	pub message: String,
}

impl HsmError {
	pub fn new(code: HsmReturnCode, message: impl Into<String>) -> Self {
		Self {
			code: Some(code),
			message: message.into(),
		}
	}

	/// Error from a library that reports only text. The return code is
	/// recovered from the message when possible.
	pub fn from_message(message: impl Into<String>) -> Self {
		let message = message.into();
		Self {
			code: HsmReturnCode::parse_message(&message),
			message,
		}
	}

	pub fn return_code(&self) -> Option<HsmReturnCode> {
		self.code.or_else(|| HsmReturnCode::parse_message(&self.message))
	}
}

impl From<HsmError> for ProviderError {
	fn from(err: HsmError) -> Self {
		match err.return_code() {
			Some(code) => code.classify(),
			None => ProviderError::Other(err.message),
		}
	}
}

impl From<HsmError> for EncryptionError {
	fn from(err: HsmError) -> Self {
		EncryptionError::Provider(err.into())
	}
}

/// Reference to a key object inside the HSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmKeyHandle {
	pub alias: String,
	pub object: u64,
}

/// Operations the HSM vendor library must provide.
#[async_trait]
pub trait HsmClient: Send + Sync {
	async fn find_key(&self, alias: &str) -> std::result::Result<Option<HsmKeyHandle>, HsmError>;

	async fn generate_key(&self, alias: &str) -> std::result::Result<HsmKeyHandle, HsmError>;

	async fn encrypt(
		&self,
		key: &HsmKeyHandle,
		plaintext: &[u8],
	) -> std::result::Result<EncryptedData, HsmError>;

	async fn decrypt(
		&self,
		key: &HsmKeyHandle,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> std::result::Result<Vec<u8>, HsmError>;

	async fn reconnect(&self) -> std::result::Result<(), HsmError>;
}

/// Keys held by an HSM, addressed by alias.
pub struct HsmKeyProvider {
	client: Arc<dyn HsmClient>,
	key_creation_enabled: bool,
	key_wait: TimedRetry,
}

impl HsmKeyProvider {
	pub fn new(client: Arc<dyn HsmClient>, key_creation_enabled: bool, key_wait: TimedRetry) -> Self {
		Self {
			client,
			key_creation_enabled,
			key_wait,
		}
	}
}

#[async_trait]
impl KeyProvider for HsmKeyProvider {
	fn kind(&self) -> KeyProviderKind {
		KeyProviderKind::Hsm
	}

	#[tracing::instrument(skip(self, config, _salt), fields(alias = config.alias.as_deref().unwrap_or_default()))]
	async fn resolve_key(&self, config: &KeyConfig, _salt: Option<&[u8]>) -> Result<ResolvedKey> {
		let alias = config
			.alias
			.as_deref()
			.filter(|a| !a.is_empty())
			.ok_or_else(|| EncryptionError::InvalidKeyConfig("hsm key has no alias".to_string()))?;

		let resolved = |handle| ResolvedKey {
			material: KeyMaterial::Hsm(handle),
			salt: None,
		};

		if let Some(handle) = self.client.find_key(alias).await? {
			return Ok(resolved(handle));
		}

		if self.key_creation_enabled {
			let handle = self.client.generate_key(alias).await?;
			info!(alias, "generated HSM key");
			return Ok(resolved(handle));
		}

		info!(
			alias,
			timeout_secs = self.key_wait.timeout.as_secs(),
			"HSM key not found and key creation is disabled; waiting for another instance to create it"
		);
		let client = &self.client;
		let found = self
			.key_wait
			.poll(|| async move { client.find_key(alias).await.map_err(EncryptionError::from) })
			.await?;

		match found {
			Some(handle) => Ok(resolved(handle)),
			None => Err(EncryptionError::HsmKeyWaitTimeout {
				alias: alias.to_string(),
				waited_secs: self.key_wait.timeout.as_secs(),
			}),
		}
	}

	async fn encrypt(&self, key: &KeyMaterial, plaintext: &[u8]) -> Result<EncryptedData> {
		match key {
			KeyMaterial::Hsm(handle) => Ok(self.client.encrypt(handle, plaintext).await?),
			other => Err(wrong_material(self.kind(), other)),
		}
	}

	async fn decrypt(
		&self,
		key: &KeyMaterial,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> Result<Zeroizing<Vec<u8>>> {
		match key {
			KeyMaterial::Hsm(handle) => Ok(Zeroizing::new(
				self.client.decrypt(handle, ciphertext, nonce).await?,
			)),
			other => Err(wrong_material(self.kind(), other)),
		}
	}

	async fn reconnect(&self) -> Result<()> {
		warn!("reconnecting to HSM");
		self.client.reconnect().await?;
		Ok(())
	}
}

#[derive(Default)]
struct SoftHsmState {
	aliases: HashMap<String, u64>,
	keys: HashMap<u64, Zeroizing<[u8; KEY_SIZE]>>,
	next_object: u64,
	session_lost: bool,
}

/// In-memory HSM with fault injection.
///
/// Several key providers can share one instance through an `Arc` to
/// simulate sibling processes talking to the same device.
#[derive(Default)]
pub struct SoftHsmClient {
	state: Mutex<SoftHsmState>,
	reconnects: AtomicU32,
	message_only_errors: bool,
}

impl SoftHsmClient {
	pub fn new() -> Self {
		Self::default()
	}

	/// Report errors as bare messages with no typed return code, the way
	/// some vendor libraries do.
	pub fn with_message_only_errors() -> Self {
		Self {
			message_only_errors: true,
			..Self::default()
		}
	}

	/// Invalidate the session. Every operation fails with
	/// `CKR_SESSION_HANDLE_INVALID` until [`HsmClient::reconnect`] is called.
	pub async fn drop_session(&self) {
		self.state.lock().await.session_lost = true;
	}

	pub fn reconnect_count(&self) -> u32 {
		self.reconnects.load(Ordering::SeqCst)
	}

	fn error(&self, code: HsmReturnCode, operation: &str) -> HsmError {
		let message = format!("{operation} returns 0x{:X}", code.code());
		if self.message_only_errors {
			HsmError::from_message(message)
		} else {
			HsmError::new(code, message)
		}
	}

	fn check_session(&self, state: &SoftHsmState, operation: &str) -> std::result::Result<(), HsmError> {
		if state.session_lost {
			return Err(self.error(HsmReturnCode::SessionHandleInvalid, operation));
		}
		Ok(())
	}
}

#[async_trait]
impl HsmClient for SoftHsmClient {
	async fn find_key(&self, alias: &str) -> std::result::Result<Option<HsmKeyHandle>, HsmError> {
		let state = self.state.lock().await;
		self.check_session(&state, "C_FindObjects")?;
		Ok(state.aliases.get(alias).map(|object| HsmKeyHandle {
			alias: alias.to_string(),
			object: *object,
		}))
	}

	async fn generate_key(&self, alias: &str) -> std::result::Result<HsmKeyHandle, HsmError> {
		let mut state = self.state.lock().await;
		self.check_session(&state, "C_GenerateKey")?;

		if let Some(object) = state.aliases.get(alias) {
			return Ok(HsmKeyHandle {
				alias: alias.to_string(),
				object: *object,
			});
		}

		state.next_object += 1;
		let object = state.next_object;
		state.aliases.insert(alias.to_string(), object);
		state.keys.insert(object, cipher::generate_key());
		Ok(HsmKeyHandle {
			alias: alias.to_string(),
			object,
		})
	}

	async fn encrypt(
		&self,
		key: &HsmKeyHandle,
		plaintext: &[u8],
	) -> std::result::Result<EncryptedData, HsmError> {
		let state = self.state.lock().await;
		self.check_session(&state, "C_Encrypt")?;
		let material = state
			.keys
			.get(&key.object)
			.ok_or_else(|| self.error(HsmReturnCode::KeyHandleInvalid, "C_EncryptInit"))?;
		cipher::seal(material, plaintext).map_err(|e| HsmError::from_message(e.to_string()))
	}

	async fn decrypt(
		&self,
		key: &HsmKeyHandle,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> std::result::Result<Vec<u8>, HsmError> {
		let state = self.state.lock().await;
		self.check_session(&state, "C_Decrypt")?;
		let material = state
			.keys
			.get(&key.object)
			.ok_or_else(|| self.error(HsmReturnCode::KeyHandleInvalid, "C_DecryptInit"))?;

		if nonce.len() != NONCE_SIZE {
			return Err(self.error(HsmReturnCode::EncryptedDataLenRange, "C_Decrypt"));
		}
		match cipher::open(material, ciphertext, nonce) {
			Ok(plaintext) => Ok(plaintext.to_vec()),
			Err(_) => Err(self.error(HsmReturnCode::EncryptedDataInvalid, "C_Decrypt")),
		}
	}

	async fn reconnect(&self) -> std::result::Result<(), HsmError> {
		self.state.lock().await.session_lost = false;
		self.reconnects.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}
