// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#[derive(Debug, thiserror::Error)]
pub enum DbError {
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Conflict: {0}")]
	Conflict(String),

	#[error("Internal: {0}")]
	Internal(String),
}

impl DbError {
	/// Whether retrying the same statement later could succeed.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			DbError::Sqlx(sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_))
		)
	}
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pool_timeout_is_transient() {
		assert!(DbError::Sqlx(sqlx::Error::PoolTimedOut).is_transient());
	}

	#[test]
	fn row_not_found_is_not_transient() {
		assert!(!DbError::Sqlx(sqlx::Error::RowNotFound).is_transient());
		assert!(!DbError::Internal("bad uuid".to_string()).is_transient());
	}
}
