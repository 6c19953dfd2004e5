// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption key management for Latch.
//!
//! Every stored credential value is encrypted under one of a small set of
//! configured keys. This crate:
//!
//! - resolves each configured key through its provider (password-derived,
//!   HSM or external KMS)
//! - identifies keys by the uuid of a persisted canary, so key material is
//!   never stored
//! - encrypts and decrypts through [`RetryingEncryptionService`], which
//!   survives transient provider failures with one coordinated reconnect
//! - rotates stored values onto the active key with [`EncryptionKeyRotator`]
//!
//! # Usage
//!
//! ```ignore
//! let providers = ProviderRegistry::from_config(&config.encryption, None)?;
//! let mapper = EncryptionKeyCanaryMapper::new(config.encryption.clone(), providers, canaries);
//! let keys = Arc::new(EncryptionKeySet::load(Arc::new(mapper)).await?);
//! let encryption = RetryingEncryptionService::new(keys);
//!
//! let value = encryption.encrypt("hunter2").await?;
//! assert_eq!(encryption.decrypt_value(&value).await?, "hunter2");
//! ```

pub mod canary;
pub mod canary_mapper;
pub mod cipher;
pub mod error;
pub mod key;
pub mod key_proxy;
pub mod key_set;
pub mod provider;
pub mod retrying;
pub mod rotator;
pub mod testing;
pub mod timed_retry;

pub use canary::{is_canary_value, CANARY_VALUE, DEPRECATED_CANARY_VALUE};
pub use canary_mapper::{EncryptionKeyCanaryMapper, KeyMapping};
pub use cipher::EncryptedData;
pub use error::{EncryptionError, ProviderError, Result};
pub use key::EncryptionKey;
pub use key_proxy::KeyProxy;
pub use key_set::EncryptionKeySet;
pub use provider::{
	ExternalKeyProvider, HsmClient, HsmError, HsmKeyHandle, HsmKeyProvider, HsmReturnCode,
	HttpKmsClient, InternalKeyProvider, KeyMaterial, KeyProvider, KmsClient, KmsClientError,
	ProviderRegistry, ResolvedKey, SoftHsmClient,
};
pub use retrying::RetryingEncryptionService;
pub use rotator::{EncryptionKeyRotator, KeyUsage, RotationReport};
pub use timed_retry::{retry_every_second_until, TimedRetry};
