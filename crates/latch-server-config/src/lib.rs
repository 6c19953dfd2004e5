// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Centralized configuration management for the Latch server.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Type-safe configuration with validation
//! - Consistent environment variable naming (`LATCH_SERVER_*`)
//!
//! # Usage
//!
//! ```ignore
//! use latch_server_config::load_config;
//!
//! let config = load_config()?;
//! println!("{} encryption keys configured", config.encryption.keys.len());
//! ```

pub mod env;
pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use env::{load_secret_env, SecretEnvError};
pub use error::ConfigError;
pub use layer::ServerConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use tracing::{debug, info};

/// Fully resolved server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub database: DatabaseConfig,
	pub logging: LoggingConfig,
	pub encryption: EncryptionConfig,
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`LATCH_SERVER_*`)
/// 2. Config file (`/etc/latch/server.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(
	config_path: impl Into<std::path::PathBuf>,
) -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource),
	])
}

fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ServerConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ServerConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		let layer = source.load()?;
		merged.merge(layer);
	}

	finalize(merged)
}

/// Finalize configuration layer into resolved config.
pub fn finalize(layer: ServerConfigLayer) -> Result<ServerConfig, ConfigError> {
	let database = layer.database.unwrap_or_default().finalize();
	let logging = layer.logging.unwrap_or_default().finalize();
	let encryption = layer.encryption.unwrap_or_default().finalize();

	validate_encryption(&encryption)?;

	info!(
		database = %database.url,
		keys = encryption.keys.len(),
		key_creation_enabled = encryption.key_creation_enabled,
		external_kms_configured = encryption.external.is_some(),
		"Server configuration loaded"
	);

	Ok(ServerConfig {
		database,
		logging,
		encryption,
	})
}

/// Validate cross-field encryption rules.
pub fn validate_encryption(encryption: &EncryptionConfig) -> Result<(), ConfigError> {
	match encryption.active_keys().count() {
		0 => {
			return Err(ConfigError::Validation(
				"No active key was found. Mark exactly one [[encryption.keys]] entry active = true."
					.to_string(),
			))
		}
		1 => {}
		n => {
			return Err(ConfigError::Validation(format!(
				"Exactly one active key is allowed, found {n}"
			)))
		}
	}

	for (index, key) in encryption.keys.iter().enumerate() {
		match key.provider {
			KeyProviderKind::Internal => {
				let long_enough = key
					.password
					.as_ref()
					.is_some_and(|p| p.len() >= sections::MIN_PASSWORD_LENGTH);
				if !long_enough {
					return Err(ConfigError::Validation(format!(
						"encryption key {index}: internal keys need a password of at least {} characters",
						sections::MIN_PASSWORD_LENGTH
					)));
				}
			}
			KeyProviderKind::Hsm => {
				if key.alias.as_deref().map_or(true, str::is_empty) {
					return Err(ConfigError::Validation(format!(
						"encryption key {index}: hsm keys need an alias"
					)));
				}
			}
			KeyProviderKind::External => {
				if key.key_id.as_deref().map_or(true, str::is_empty) {
					return Err(ConfigError::Validation(format!(
						"encryption key {index}: external keys need a key_id"
					)));
				}
				if encryption.external.is_none() {
					return Err(ConfigError::Validation(format!(
						"encryption key {index}: external keys need [encryption.external] endpoint"
					)));
				}
			}
		}
	}

	Ok(())
}
