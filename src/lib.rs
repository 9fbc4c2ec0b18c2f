// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Session-scoped sidecar manager.
//!
//! Sidekick wraps invocations of a command-line tool so that the background
//! processes the tool relies on, its __sidecars__, are running for as long as
//! at least one wrapped session is active, and are stopped once the last one
//! ends. Concurrent sessions are separate processes that coordinate through a
//! lock file and a small state record on disk.
//!
//! # See Also
//!
//! 1. [`session`] for the entry and exit protocol.
//! 2. [`sidecar`] for how each sidecar is started and stopped.

pub mod config;
pub mod lock;
pub mod path;
pub mod session;
pub mod sidecar;
pub mod store;
