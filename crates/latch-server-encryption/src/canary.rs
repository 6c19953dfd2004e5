// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Well-known canary plaintexts.
//!
//! A canary row holds one of these values encrypted under a configured key.
//! Whichever key decrypts the row back to a known value owns the row's uuid.

/// Plaintext written into every new canary.
pub const CANARY_VALUE: [u8; 128] = [0u8; 128];

/// Plaintext of canaries written by older releases. Still accepted on read.
pub const DEPRECATED_CANARY_VALUE: [u8; 64] = [0u8; 64];

/// Whether `plaintext` is a current or deprecated canary value.
pub fn is_canary_value(plaintext: &[u8]) -> bool {
	plaintext == CANARY_VALUE.as_slice() || plaintext == DEPRECATED_CANARY_VALUE.as_slice()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_both_generations() {
		assert!(is_canary_value(&CANARY_VALUE));
		assert!(is_canary_value(&DEPRECATED_CANARY_VALUE));
	}

	#[test]
	fn rejects_other_plaintexts() {
		assert!(!is_canary_value(b""));
		assert!(!is_canary_value(&[0u8; 127]));
		assert!(!is_canary_value(&[1u8; 128]));
	}
}
