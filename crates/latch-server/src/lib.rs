// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Latch server bootstrap.
//!
//! Starts the encryption core from a [`ServerConfig`](latch_server_config::ServerConfig)
//! and exposes the operator actions the `latch-server` binary runs.

pub mod logging;
pub mod runtime;

pub use logging::init_tracing;
pub use runtime::{EncryptionRuntime, KeyCheck, Result, RuntimeError};
