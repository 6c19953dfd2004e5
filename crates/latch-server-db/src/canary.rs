// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption key canary repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePool, QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::error::DbError;
use crate::types::EncryptionKeyCanary;

#[async_trait]
pub trait CanaryStore: Send + Sync {
	async fn find_all(&self) -> Result<Vec<EncryptionKeyCanary>, DbError>;
	async fn save(&self, canary: &EncryptionKeyCanary) -> Result<EncryptionKeyCanary, DbError>;
	async fn delete(&self, uuids: &[Uuid]) -> Result<u64, DbError>;
}

#[async_trait]
impl CanaryStore for CanaryRepository {
	async fn find_all(&self) -> Result<Vec<EncryptionKeyCanary>, DbError> {
		self.find_all().await
	}

	async fn save(&self, canary: &EncryptionKeyCanary) -> Result<EncryptionKeyCanary, DbError> {
		self.save(canary).await
	}

	async fn delete(&self, uuids: &[Uuid]) -> Result<u64, DbError> {
		self.delete(uuids).await
	}
}

/// Repository for encryption key canaries.
///
/// One row per key that has ever been active. Rows are created at startup
/// and removed only by key rotation once nothing references their uuid.
#[derive(Clone)]
pub struct CanaryRepository {
	pool: SqlitePool,
}

impl CanaryRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// All canaries, oldest first.
	#[tracing::instrument(skip(self))]
	pub async fn find_all(&self) -> Result<Vec<EncryptionKeyCanary>, DbError> {
		let rows = sqlx::query(
			r#"
			SELECT uuid, encrypted_value, nonce, salt
			FROM encryption_key_canary
			ORDER BY created_at, uuid
			"#,
		)
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(parse_canary_row).collect()
	}

	/// Insert a canary.
	///
	/// # Errors
	/// Returns `DbError::Conflict` if a canary with the same uuid exists.
	#[tracing::instrument(skip(self, canary), fields(canary_uuid = %canary.uuid))]
	pub async fn save(&self, canary: &EncryptionKeyCanary) -> Result<EncryptionKeyCanary, DbError> {
		let result = sqlx::query(
			r#"
			INSERT INTO encryption_key_canary (uuid, encrypted_value, nonce, salt, created_at)
			VALUES (?, ?, ?, ?, ?)
			ON CONFLICT(uuid) DO NOTHING
			"#,
		)
		.bind(canary.uuid.to_string())
		.bind(&canary.encrypted_canary_value)
		.bind(&canary.nonce)
		.bind(canary.salt.as_deref())
		.bind(Utc::now().to_rfc3339())
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::Conflict(format!(
				"canary {} already exists",
				canary.uuid
			)));
		}

		tracing::debug!(canary_uuid = %canary.uuid, "canary saved");
		Ok(canary.clone())
	}

	/// Delete the canaries with the given uuids. Returns the number removed.
	#[tracing::instrument(skip(self, uuids), fields(count = uuids.len()))]
	pub async fn delete(&self, uuids: &[Uuid]) -> Result<u64, DbError> {
		if uuids.is_empty() {
			return Ok(0);
		}

		let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM encryption_key_canary WHERE uuid IN (");
		{
			let mut separated = query.separated(", ");
			for uuid in uuids {
				separated.push_bind(uuid.to_string());
			}
		}
		query.push(")");

		let result = query.build().execute(&self.pool).await?;

		tracing::debug!(deleted = result.rows_affected(), "canaries deleted");
		Ok(result.rows_affected())
	}
}

fn parse_canary_row(row: &sqlx::sqlite::SqliteRow) -> Result<EncryptionKeyCanary, DbError> {
	let uuid_str: String = row.get("uuid");
	let uuid = Uuid::parse_str(&uuid_str)
		.map_err(|e| DbError::Internal(format!("Invalid canary UUID: {e}")))?;

	Ok(EncryptionKeyCanary {
		uuid,
		encrypted_canary_value: row.get("encrypted_value"),
		nonce: row.get("nonce"),
		salt: row.get("salt"),
	})
}
