// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections.

mod database;
mod encryption;
mod logging;

pub use database::{DatabaseConfig, DatabaseConfigLayer};
pub use encryption::{
	EncryptionConfig, EncryptionConfigLayer, ExternalKmsConfig, ExternalKmsConfigLayer, KeyConfig,
	KeyProviderKind, MIN_PASSWORD_LENGTH,
};
pub use logging::{LogFormat, LoggingConfig, LoggingConfigLayer};
