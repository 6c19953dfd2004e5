// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::env::load_secret_env;
use crate::error::ConfigError;
use crate::layer::ServerConfigLayer;
use crate::sections::{
	DatabaseConfigLayer, EncryptionConfigLayer, ExternalKmsConfigLayer, KeyConfig,
	KeyProviderKind, LogFormat, LoggingConfigLayer,
};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ServerConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ServerConfigLayer::default())
	}
}

/// TOML file configuration source.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/latch/server.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ServerConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ServerConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: LATCH_SERVER_<SECTION>_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ServerConfigLayer {
			database: Some(load_database_from_env()),
			logging: Some(load_logging_from_env()?),
			encryption: Some(load_encryption_from_env()?),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u32 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u64 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn load_database_from_env() -> DatabaseConfigLayer {
	DatabaseConfigLayer {
		url: env_var("LATCH_SERVER_DATABASE_URL"),
	}
}

fn load_logging_from_env() -> Result<LoggingConfigLayer, ConfigError> {
	let format = match env_var("LATCH_SERVER_LOG_FORMAT") {
		Some(v) => Some(parse_log_format(&v)?),
		None => None,
	};

	Ok(LoggingConfigLayer {
		level: env_var("LATCH_SERVER_LOG_LEVEL"),
		format,
	})
}

fn parse_log_format(value: &str) -> Result<LogFormat, ConfigError> {
	match value.to_lowercase().as_str() {
		"text" => Ok(LogFormat::Text),
		"json" => Ok(LogFormat::Json),
		other => Err(ConfigError::InvalidValue {
			key: "LATCH_SERVER_LOG_FORMAT".to_string(),
			message: format!("expected 'text' or 'json', got '{other}'"),
		}),
	}
}

fn load_encryption_from_env() -> Result<EncryptionConfigLayer, ConfigError> {
	// A single password in the environment describes a one-key deployment.
	let keys = load_secret_env("LATCH_SERVER_ENCRYPTION_PASSWORD")
		.map_err(|e| ConfigError::Secret(e.to_string()))?
		.map(|password| {
			vec![KeyConfig {
				provider: KeyProviderKind::Internal,
				password: Some(password),
				alias: None,
				key_id: None,
				active: true,
			}]
		});

	let auth_token = load_secret_env("LATCH_SERVER_ENCRYPTION_EXTERNAL_AUTH_TOKEN")
		.map_err(|e| ConfigError::Secret(e.to_string()))?;
	let external = ExternalKmsConfigLayer {
		endpoint: env_var("LATCH_SERVER_ENCRYPTION_EXTERNAL_ENDPOINT"),
		auth_token,
		request_timeout_secs: env_u64("LATCH_SERVER_ENCRYPTION_EXTERNAL_REQUEST_TIMEOUT_SECS")?,
	};
	let external = (external != ExternalKmsConfigLayer::default()).then_some(external);

	Ok(EncryptionConfigLayer {
		keys,
		key_creation_enabled: env_bool("LATCH_SERVER_ENCRYPTION_KEY_CREATION_ENABLED"),
		canary_wait_timeout_secs: env_u64("LATCH_SERVER_ENCRYPTION_CANARY_WAIT_TIMEOUT_SECS")?,
		canary_poll_interval_ms: env_u64("LATCH_SERVER_ENCRYPTION_CANARY_POLL_INTERVAL_MS")?,
		hsm_key_wait_timeout_secs: env_u64("LATCH_SERVER_ENCRYPTION_HSM_KEY_WAIT_TIMEOUT_SECS")?,
		rotation_page_size: env_u32("LATCH_SERVER_ENCRYPTION_ROTATION_PAGE_SIZE")?,
		kdf_iterations: env_u32("LATCH_SERVER_ENCRYPTION_KDF_ITERATIONS")?,
		external,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn test_precedence_ordering() {
		assert!(Precedence::Environment > Precedence::ConfigFile);
		assert!(Precedence::ConfigFile > Precedence::Defaults);
	}

	#[test]
	fn test_defaults_source_returns_empty_layer() {
		let source = DefaultsSource;
		let layer = source.load().unwrap();
		assert!(layer.database.is_none());
		assert!(layer.encryption.is_none());
	}

	#[test]
	fn test_toml_source_missing_file_returns_empty() {
		let source = TomlSource::new("/nonexistent/config.toml");
		let layer = source.load().unwrap();
		assert!(layer.encryption.is_none());
	}

	#[test]
	fn test_toml_source_reads_keys() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"
[database]
url = "sqlite:/tmp/latch.db"

[[encryption.keys]]
provider = "internal"
password = "correct-horse-battery-staple"
active = true
"#
		)
		.unwrap();

		let layer = TomlSource::new(file.path()).load().unwrap();
		let encryption = layer.encryption.unwrap().finalize();
		assert_eq!(encryption.keys.len(), 1);
		assert!(encryption.keys[0].active);
	}

	#[test]
	fn test_toml_source_reports_parse_errors() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, "[[encryption.keys]]\nprovider = \"floppy-disk\"\n").unwrap();

		let result = TomlSource::new(file.path()).load();
		assert!(matches!(result, Err(ConfigError::TomlParse { .. })));
	}

	#[test]
	fn test_parse_log_format() {
		assert_eq!(parse_log_format("JSON").unwrap(), LogFormat::Json);
		assert!(parse_log_format("xml").is_err());
	}
}
