// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Latch key management operator binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use latch_server::{init_tracing, EncryptionRuntime};

mod version;

/// Latch server - encryption key management.
#[derive(Parser, Debug)]
#[command(name = "latch-server", about = "Latch encryption key management", version)]
struct Args {
	/// Config file to load instead of /etc/latch/server.toml
	#[arg(long, global = true, env = "LATCH_SERVER_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Re-encrypt stored values under the active key and retire unused keys
	RotateKeys,
	/// Print how many stored values each key state holds
	KeyUsage,
	/// Load the key set and report which canaries each configured key owns
	CheckKeys,
	/// Show version and build information
	Version,
}

/// Subcommands that need configuration and a started runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
	RotateKeys,
	KeyUsage,
	CheckKeys,
}

impl Command {
	/// `None` for commands answered without loading anything.
	fn operation(&self) -> Option<Operation> {
		match self {
			Command::Version => None,
			Command::RotateKeys => Some(Operation::RotateKeys),
			Command::KeyUsage => Some(Operation::KeyUsage),
			Command::CheckKeys => Some(Operation::CheckKeys),
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let Some(operation) = args.command.operation() else {
		println!("{}", version::format_version_info());
		return Ok(());
	};

	dotenvy::dotenv().ok();

	let config = match &args.config {
		Some(path) => latch_server_config::load_config_with_file(path)?,
		None => latch_server_config::load_config()?,
	};

	init_tracing(&config.logging);

	tracing::info!(
		operation = ?operation,
		database = %config.database.url,
		"starting latch-server"
	);

	let runtime = EncryptionRuntime::start(&config).await?;

	let output = match operation {
		Operation::RotateKeys => serde_json::to_string_pretty(&runtime.rotate_keys().await?)?,
		Operation::KeyUsage => serde_json::to_string_pretty(&runtime.key_usage().await?)?,
		Operation::CheckKeys => serde_json::to_string_pretty(&runtime.check_keys().await?)?,
	};
	println!("{output}");

	Ok(())
}
