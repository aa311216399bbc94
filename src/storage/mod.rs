// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store backends.
//!
//! - [`traits`]: the [`DocumentStore`](traits::DocumentStore) and
//!   [`StoreConnector`](traits::StoreConnector) seams
//! - [`memory`]: in-process store with fault injection
//! - [`sql`]: SQLite/MySQL store with an outbox-backed change feed

pub mod memory;
pub mod sql;
pub mod traits;
