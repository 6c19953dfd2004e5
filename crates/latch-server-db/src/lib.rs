// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Database layer for the Latch encryption core.
//!
//! Holds the two tables the key management core reads and writes: key
//! canaries, and the encrypted values that reference a key by uuid.

pub mod canary;
pub mod encrypted_value;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod testing;
pub mod types;

pub use canary::{CanaryRepository, CanaryStore};
pub use encrypted_value::{EncryptedValueRepository, EncryptedValueStore};
pub use error::{DbError, Result};
pub use migrations::run_migrations;
pub use pool::create_pool;
pub use types::{EncryptedValue, EncryptedValueRow, EncryptionKeyCanary, ValueCursor};
