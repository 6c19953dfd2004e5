// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Secret loading from environment variables with `*_FILE` support.

use std::path::PathBuf;

use latch_common_secret::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum SecretEnvError {
	#[error("failed to read {var} from file {path}: {source}")]
	FileRead {
		var: String,
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("{var}_FILE points at an empty file: {path}")]
	EmptyFile { var: String, path: PathBuf },
}

/// Load a secret from `name`, or from the file named by `name_FILE`.
///
/// The direct variable wins when both are set. Trailing newlines in the file
/// are stripped so `echo secret > file` works as expected.
pub fn load_secret_env(name: &str) -> Result<Option<SecretString>, SecretEnvError> {
	if let Some(value) = std::env::var(name).ok().filter(|v| !v.is_empty()) {
		return Ok(Some(SecretString::new(value)));
	}

	let file_var = format!("{name}_FILE");
	let Some(path) = std::env::var(&file_var).ok().filter(|v| !v.is_empty()) else {
		return Ok(None);
	};

	load_secret_file(name, PathBuf::from(path)).map(Some)
}

fn load_secret_file(name: &str, path: PathBuf) -> Result<SecretString, SecretEnvError> {
	let content = std::fs::read_to_string(&path).map_err(|source| SecretEnvError::FileRead {
		var: name.to_string(),
		path: path.clone(),
		source,
	})?;

	let value = content.trim_end_matches(['\r', '\n']).to_string();
	if value.is_empty() {
		return Err(SecretEnvError::EmptyFile {
			var: name.to_string(),
			path,
		});
	}

	Ok(SecretString::new(value))
}
