// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encrypted value repository.
//!
//! Every credential version stores its value here, tagged with the uuid of
//! the key that encrypted it. Key rotation pages through the rows tagged
//! with retired key uuids and rewrites them in place.
//!
//! `updated_at` is stored as fixed-width RFC 3339 UTC with microseconds so
//! that text order matches time order and a cursor built from a parsed row
//! binds back to the exact stored string.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePool, QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::error::DbError;
use crate::types::{EncryptedValue, EncryptedValueRow, ValueCursor};

#[async_trait]
pub trait EncryptedValueStore: Send + Sync {
	async fn insert(&self, value: &EncryptedValue) -> Result<Uuid, DbError>;
	async fn get(&self, uuid: Uuid) -> Result<Option<EncryptedValueRow>, DbError>;
	async fn find_by_key_uuids(
		&self,
		key_uuids: &HashSet<Uuid>,
		after: Option<ValueCursor>,
		limit: u32,
	) -> Result<Vec<EncryptedValueRow>, DbError>;
	async fn update_if_key(
		&self,
		uuid: Uuid,
		expected_key_uuid: Uuid,
		value: &EncryptedValue,
	) -> Result<bool, DbError>;
	async fn count_by_key_uuid(&self) -> Result<HashMap<Uuid, u64>, DbError>;
	async fn count_by_key_uuids(&self, key_uuids: &HashSet<Uuid>) -> Result<u64, DbError>;
}

#[async_trait]
impl EncryptedValueStore for EncryptedValueRepository {
	async fn insert(&self, value: &EncryptedValue) -> Result<Uuid, DbError> {
		self.insert(value).await
	}

	async fn get(&self, uuid: Uuid) -> Result<Option<EncryptedValueRow>, DbError> {
		self.get(uuid).await
	}

	async fn find_by_key_uuids(
		&self,
		key_uuids: &HashSet<Uuid>,
		after: Option<ValueCursor>,
		limit: u32,
	) -> Result<Vec<EncryptedValueRow>, DbError> {
		self.find_by_key_uuids(key_uuids, after, limit).await
	}

	async fn update_if_key(
		&self,
		uuid: Uuid,
		expected_key_uuid: Uuid,
		value: &EncryptedValue,
	) -> Result<bool, DbError> {
		self.update_if_key(uuid, expected_key_uuid, value).await
	}

	async fn count_by_key_uuid(&self) -> Result<HashMap<Uuid, u64>, DbError> {
		self.count_by_key_uuid().await
	}

	async fn count_by_key_uuids(&self, key_uuids: &HashSet<Uuid>) -> Result<u64, DbError> {
		self.count_by_key_uuids(key_uuids).await
	}
}

/// Repository for encrypted credential values.
#[derive(Clone)]
pub struct EncryptedValueRepository {
	pool: SqlitePool,
}

impl EncryptedValueRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Store a new encrypted value and return its row uuid.
	#[tracing::instrument(skip(self, value), fields(key_uuid = %value.key_uuid))]
	pub async fn insert(&self, value: &EncryptedValue) -> Result<Uuid, DbError> {
		let uuid = Uuid::new_v4();

		sqlx::query(
			r#"
			INSERT INTO encrypted_value (uuid, encryption_key_uuid, encrypted_value, nonce, updated_at)
			VALUES (?, ?, ?, ?, ?)
			"#,
		)
		.bind(uuid.to_string())
		.bind(value.key_uuid.to_string())
		.bind(&value.ciphertext)
		.bind(&value.nonce)
		.bind(timestamp(Utc::now()))
		.execute(&self.pool)
		.await?;

		tracing::debug!(value_uuid = %uuid, "encrypted value stored");
		Ok(uuid)
	}

	#[tracing::instrument(skip(self), fields(value_uuid = %uuid))]
	pub async fn get(&self, uuid: Uuid) -> Result<Option<EncryptedValueRow>, DbError> {
		let row = sqlx::query(
			r#"
			SELECT uuid, encryption_key_uuid, encrypted_value, nonce, updated_at
			FROM encrypted_value
			WHERE uuid = ?
			"#,
		)
		.bind(uuid.to_string())
		.fetch_optional(&self.pool)
		.await?;

		row.as_ref().map(parse_encrypted_value_row).transpose()
	}

	/// One page of values encrypted under any of `key_uuids`, in
	/// `(updated_at, uuid)` order, starting just past `after`.
	///
	/// Passing the last row of a page as the next `after` walks the table
	/// once; rows a caller leaves untouched stay behind the cursor. A row
	/// rewritten meanwhile gets a later `updated_at` and shows up again.
	#[tracing::instrument(skip(self, key_uuids), fields(keys = key_uuids.len()))]
	pub async fn find_by_key_uuids(
		&self,
		key_uuids: &HashSet<Uuid>,
		after: Option<ValueCursor>,
		limit: u32,
	) -> Result<Vec<EncryptedValueRow>, DbError> {
		if key_uuids.is_empty() || limit == 0 {
			return Ok(Vec::new());
		}

		let mut query = QueryBuilder::<Sqlite>::new(
			"SELECT uuid, encryption_key_uuid, encrypted_value, nonce, updated_at \
			 FROM encrypted_value WHERE encryption_key_uuid IN (",
		);
		push_uuid_list(&mut query, key_uuids);
		query.push(")");

		if let Some(cursor) = after {
			let updated_at = timestamp(cursor.updated_at);
			query.push(" AND (updated_at > ");
			query.push_bind(updated_at.clone());
			query.push(" OR (updated_at = ");
			query.push_bind(updated_at);
			query.push(" AND uuid > ");
			query.push_bind(cursor.uuid.to_string());
			query.push("))");
		}

		query.push(" ORDER BY updated_at, uuid LIMIT ");
		query.push_bind(i64::from(limit));

		let rows = query.build().fetch_all(&self.pool).await?;
		rows.iter().map(parse_encrypted_value_row).collect()
	}

	/// Replace a row's ciphertext only if it is still encrypted under
	/// `expected_key_uuid`. Returns `false` when the row is gone or was
	/// rewritten concurrently.
	#[tracing::instrument(skip(self, value), fields(value_uuid = %uuid, from = %expected_key_uuid, to = %value.key_uuid))]
	pub async fn update_if_key(
		&self,
		uuid: Uuid,
		expected_key_uuid: Uuid,
		value: &EncryptedValue,
	) -> Result<bool, DbError> {
		let result = sqlx::query(
			r#"
			UPDATE encrypted_value
			SET encryption_key_uuid = ?, encrypted_value = ?, nonce = ?, updated_at = ?
			WHERE uuid = ? AND encryption_key_uuid = ?
			"#,
		)
		.bind(value.key_uuid.to_string())
		.bind(&value.ciphertext)
		.bind(&value.nonce)
		.bind(timestamp(Utc::now()))
		.bind(uuid.to_string())
		.bind(expected_key_uuid.to_string())
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// Number of stored values per key uuid.
	#[tracing::instrument(skip(self))]
	pub async fn count_by_key_uuid(&self) -> Result<HashMap<Uuid, u64>, DbError> {
		let rows = sqlx::query(
			r#"
			SELECT encryption_key_uuid, COUNT(*) AS count
			FROM encrypted_value
			GROUP BY encryption_key_uuid
			"#,
		)
		.fetch_all(&self.pool)
		.await?;

		rows.iter()
			.map(|row| {
				let uuid_str: String = row.get("encryption_key_uuid");
				let count: i64 = row.get("count");
				let uuid = Uuid::parse_str(&uuid_str)
					.map_err(|e| DbError::Internal(format!("Invalid encryption_key_uuid: {e}")))?;
				Ok((uuid, count.max(0) as u64))
			})
			.collect()
	}

	/// Number of stored values encrypted under any of `key_uuids`.
	#[tracing::instrument(skip(self, key_uuids), fields(keys = key_uuids.len()))]
	pub async fn count_by_key_uuids(&self, key_uuids: &HashSet<Uuid>) -> Result<u64, DbError> {
		if key_uuids.is_empty() {
			return Ok(0);
		}

		let mut query = QueryBuilder::<Sqlite>::new(
			"SELECT COUNT(*) AS count FROM encrypted_value WHERE encryption_key_uuid IN (",
		);
		push_uuid_list(&mut query, key_uuids);
		query.push(")");

		let row = query.build().fetch_one(&self.pool).await?;
		let count: i64 = row.get("count");
		Ok(count.max(0) as u64)
	}
}

fn timestamp(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn push_uuid_list(query: &mut QueryBuilder<'_, Sqlite>, uuids: &HashSet<Uuid>) {
	let mut separated = query.separated(", ");
	for uuid in uuids {
		separated.push_bind(uuid.to_string());
	}
}

fn parse_encrypted_value_row(row: &sqlx::sqlite::SqliteRow) -> Result<EncryptedValueRow, DbError> {
	let uuid_str: String = row.get("uuid");
	let key_uuid_str: String = row.get("encryption_key_uuid");
	let updated_at_str: String = row.get("updated_at");

	let uuid = Uuid::parse_str(&uuid_str)
		.map_err(|e| DbError::Internal(format!("Invalid encrypted_value UUID: {e}")))?;
	let key_uuid = Uuid::parse_str(&key_uuid_str)
		.map_err(|e| DbError::Internal(format!("Invalid encryption_key_uuid: {e}")))?;
	let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
		.map_err(|e| DbError::Internal(format!("Invalid updated_at: {e}")))?
		.with_timezone(&Utc);

	Ok(EncryptedValueRow {
		uuid,
		value: EncryptedValue {
			ciphertext: row.get("encrypted_value"),
			nonce: row.get("nonce"),
			key_uuid,
		},
		updated_at,
	})
}
