//! pg-console - query execution core for a browser-based PostgreSQL console.
//!
//! This library exposes the core modules for the binary and integration tests.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pool;
pub mod query;
pub mod server;
