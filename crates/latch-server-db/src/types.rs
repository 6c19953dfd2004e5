// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A persisted ciphertext of a well-known constant, used to discover which
/// configured key a key uuid belongs to without storing key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKeyCanary {
	pub uuid: Uuid,
	pub encrypted_canary_value: Vec<u8>,
	pub nonce: Vec<u8>,
	/// Present only for password-derived keys; needed to re-derive the key.
	pub salt: Option<Vec<u8>>,
}

/// Ciphertext plus everything needed to decrypt it, minus the key itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
	pub ciphertext: Vec<u8>,
	pub nonce: Vec<u8>,
	pub key_uuid: Uuid,
}

/// A stored encrypted value as read back from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValueRow {
	pub uuid: Uuid,
	pub value: EncryptedValue,
	pub updated_at: DateTime<Utc>,
}

/// Position just past a row in `(updated_at, uuid)` order, for paging
/// through encrypted values without re-reading rows already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCursor {
	pub updated_at: DateTime<Utc>,
	pub uuid: Uuid,
}

impl From<&EncryptedValueRow> for ValueCursor {
	fn from(row: &EncryptedValueRow) -> Self {
		Self {
			updated_at: row.updated_at,
			uuid: row.uuid,
		}
	}
}
