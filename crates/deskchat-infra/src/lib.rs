//! Infrastructure layer for deskchat.
//!
//! Implements the ports defined in `deskchat-core`: the SQLite-backed
//! `PostJobStore`, the environment-backed `IdentityProvider`, and the
//! `config.toml` loader.

pub mod config;
pub mod identity;
pub mod sqlite;
