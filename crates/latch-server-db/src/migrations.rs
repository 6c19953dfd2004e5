// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Schema for key canaries and encrypted values.
//!
//! Every statement is idempotent so the same binary can be started against
//! a fresh or an existing database.

use sqlx::sqlite::SqlitePool;

use crate::error::DbError;

const STATEMENTS: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS encryption_key_canary (
		uuid TEXT PRIMARY KEY NOT NULL,
		encrypted_value BLOB NOT NULL,
		nonce BLOB NOT NULL,
		salt BLOB,
		created_at TEXT NOT NULL
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS encrypted_value (
		uuid TEXT PRIMARY KEY NOT NULL,
		encryption_key_uuid TEXT NOT NULL,
		encrypted_value BLOB NOT NULL,
		nonce BLOB NOT NULL,
		updated_at TEXT NOT NULL
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_encrypted_value_key_uuid ON encrypted_value(encryption_key_uuid)",
];

#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
	for statement in STATEMENTS {
		sqlx::query(statement).execute(pool).await?;
	}

	tracing::debug!(statements = STATEMENTS.len(), "database migrations applied");
	Ok(())
}
