// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keys held by an external key management service.
//!
//! The service speaks a small JSON protocol:
//!
//! ```text
//! POST {endpoint}/v1/keys/{key_id}/encrypt  {"plaintext": b64}
//!   -> 200 {"ciphertext": b64, "nonce": b64}
//! POST {endpoint}/v1/keys/{key_id}/decrypt  {"ciphertext": b64, "nonce": b64}
//!   -> 200 {"plaintext": b64}
//!   -> 422 {"error": "key_mismatch"} when the ciphertext belongs to another key
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use latch_common_secret::SecretString;
use latch_server_config::{ExternalKmsConfig, KeyConfig, KeyProviderKind};
use reqwest::{Client, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{wrong_material, KeyMaterial, KeyProvider, ResolvedKey};
use crate::cipher::EncryptedData;
use crate::error::{EncryptionError, ProviderError, Result};

#[derive(Debug, Error)]
pub enum KmsClientError {
	#[error("KMS unavailable: {0}")]
	Unavailable(String),

	#[error("ciphertext does not belong to this KMS key")]
	KeyMismatch,

	#[error("KMS rejected request with status {status}: {message}")]
	Rejected { status: u16, message: String },

	#[error("invalid KMS response: {0}")]
	InvalidResponse(String),

	#[error("invalid KMS endpoint: {0}")]
	InvalidEndpoint(String),
}

impl From<KmsClientError> for ProviderError {
	fn from(err: KmsClientError) -> Self {
		match err {
			KmsClientError::Unavailable(message) => ProviderError::Unavailable(message),
			KmsClientError::KeyMismatch => ProviderError::KeyMismatch,
			rejected @ KmsClientError::Rejected { .. } => ProviderError::Rejected(rejected.to_string()),
			other => ProviderError::Other(other.to_string()),
		}
	}
}

impl From<KmsClientError> for EncryptionError {
	fn from(err: KmsClientError) -> Self {
		EncryptionError::Provider(err.into())
	}
}

#[async_trait]
pub trait KmsClient: Send + Sync {
	async fn encrypt(
		&self,
		key_id: &str,
		plaintext: &[u8],
	) -> std::result::Result<EncryptedData, KmsClientError>;

	async fn decrypt(
		&self,
		key_id: &str,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> std::result::Result<Vec<u8>, KmsClientError>;

	/// Drop pooled connections and start fresh.
	async fn reconnect(&self) -> std::result::Result<(), KmsClientError>;
}

#[derive(Serialize)]
struct EncryptRequest {
	plaintext: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
	ciphertext: String,
	nonce: String,
}

#[derive(Serialize)]
struct DecryptRequest {
	ciphertext: String,
	nonce: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
	plaintext: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
	error: String,
}

/// [`KmsClient`] over HTTPS with bearer-token auth.
pub struct HttpKmsClient {
	endpoint: Url,
	auth_token: Option<SecretString>,
	timeout: Duration,
	http: RwLock<Client>,
}

impl HttpKmsClient {
	pub fn new(config: &ExternalKmsConfig) -> std::result::Result<Self, KmsClientError> {
		let endpoint = Url::parse(&config.endpoint)
			.map_err(|e| KmsClientError::InvalidEndpoint(format!("{}: {e}", config.endpoint)))?;
		if endpoint.cannot_be_a_base() {
			return Err(KmsClientError::InvalidEndpoint(config.endpoint.clone()));
		}

		let timeout = config.request_timeout();
		Ok(Self {
			endpoint,
			auth_token: config.auth_token.clone(),
			timeout,
			http: RwLock::new(build_http_client(timeout)?),
		})
	}

	fn key_url(&self, key_id: &str, operation: &str) -> std::result::Result<Url, KmsClientError> {
		let mut url = self.endpoint.clone();
		url.path_segments_mut()
			.map_err(|_| KmsClientError::InvalidEndpoint(self.endpoint.to_string()))?
			.pop_if_empty()
			.extend(["v1", "keys", key_id, operation]);
		Ok(url)
	}

	#[tracing::instrument(skip(self, body))]
	async fn post<Req, Resp>(
		&self,
		key_id: &str,
		operation: &str,
		body: &Req,
	) -> std::result::Result<Resp, KmsClientError>
	where
		Req: Serialize + Sync,
		Resp: DeserializeOwned,
	{
		let url = self.key_url(key_id, operation)?;
		let http = self.http.read().await.clone();

		let mut request = http.post(url).json(body);
		if let Some(token) = &self.auth_token {
			request = request.bearer_auth(token.expose());
		}

		let response = request
			.send()
			.await
			.map_err(|e| KmsClientError::Unavailable(e.to_string()))?;

		let status = response.status();
		if status.is_success() {
			return response
				.json::<Resp>()
				.await
				.map_err(|e| KmsClientError::InvalidResponse(e.to_string()));
		}

		let text = response.text().await.unwrap_or_default();
		debug!(status = status.as_u16(), "KMS request failed");

		if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
			return Err(KmsClientError::Unavailable(format!("status {status}")));
		}

		if status == StatusCode::UNPROCESSABLE_ENTITY {
			let is_mismatch = serde_json::from_str::<ErrorResponse>(&text)
				.map(|e| e.error == "key_mismatch")
				.unwrap_or(false);
			if is_mismatch {
				return Err(KmsClientError::KeyMismatch);
			}
		}

		Err(KmsClientError::Rejected {
			status: status.as_u16(),
			message: text,
		})
	}
}

fn build_http_client(timeout: Duration) -> std::result::Result<Client, KmsClientError> {
	Client::builder()
		.timeout(timeout)
		.build()
		.map_err(|e| KmsClientError::InvalidEndpoint(format!("failed to build HTTP client: {e}")))
}

fn decode(field: &str, value: &str) -> std::result::Result<Vec<u8>, KmsClientError> {
	STANDARD
		.decode(value)
		.map_err(|e| KmsClientError::InvalidResponse(format!("{field} is not base64: {e}")))
}

#[async_trait]
impl KmsClient for HttpKmsClient {
	async fn encrypt(
		&self,
		key_id: &str,
		plaintext: &[u8],
	) -> std::result::Result<EncryptedData, KmsClientError> {
		let request = EncryptRequest {
			plaintext: STANDARD.encode(plaintext),
		};
		let response: EncryptResponse = self.post(key_id, "encrypt", &request).await?;
		Ok(EncryptedData {
			ciphertext: decode("ciphertext", &response.ciphertext)?,
			nonce: decode("nonce", &response.nonce)?,
		})
	}

	async fn decrypt(
		&self,
		key_id: &str,
		ciphertext: &[u8],
		nonce: &[u8],
	) -> std::result::Result<Vec<u8>, KmsClientError> {
		let request = DecryptRequest {
			ciphertext: STANDARD.encode(ciphertext),
			nonce: STANDARD.encode(nonce),
		};
		let response: DecryptResponse = self.post(key_id, "decrypt", &request).await?;
		decode("plaintext", &response.plaintext)
	}

	async fn reconnect(&self) -> std::result::Result<(), KmsClientError> {
		let fresh = build_http_client(self.timeout)?;
		*self.http.write().await = fresh;
		Ok(())
	}
}

/// Keys held by a [`KmsClient`], addressed by key id.
pub struct ExternalKeyProvider {
	client: Arc<dyn KmsClient>,
}

impl ExternalKeyProvider {
	pub fn new(client: Arc<dyn KmsClient>) -> Self {
		Self { client }
	}
}

#[async_trait]
impl KeyProvider for ExternalKeyProvider {
	fn kind(&self) -> KeyProviderKind {
		KeyProviderKind::External
	}

	async fn resolve_key(&self, config: &KeyConfig, _salt: Option<&[u8]>) -> Result<ResolvedKey> {
		let key_id = config
			.key_id
			.as_deref()
			.filter(|k| !k.is_empty())
			.ok_or_else(|| {
				EncryptionError::InvalidKeyConfig("external key has no key_id".to_string())
			})?;
		Ok(ResolvedKey {
			material: KeyMaterial::Remote {
				key_id: key_id.to_string(),
			},
			salt: None,
		})
	}

	async fn encrypt(&self, key: &KeyMaterial, plaintext: &[u8]) -> Result<EncryptedData> {
		match key {
			KeyMaterial::Remote { key_id } => Ok(self.client.encrypt(key_id, plaintext).await?),
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
			KeyMaterial::Remote { key_id } => Ok(Zeroizing::new(
				self.client.decrypt(key_id, ciphertext, nonce).await?,
			)),
			other => Err(wrong_material(self.kind(), other)),
		}
	}

	async fn reconnect(&self) -> Result<()> {
		warn!("reconnecting to external KMS");
		self.client.reconnect().await?;
		Ok(())
	}
}
