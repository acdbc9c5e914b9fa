//! SQLite store for keel.
//!
//! This crate implements the `Store` trait from keel-core over libsqlite3,
//! compiled from the bundled amalgamation.
//!
//! # Features
//!
//! - Synchronous `Store` implementation driven by the persistence context
//! - `BEGIN IMMEDIATE` transactions, one per unit of work
//! - Type-safe parameter binding with `?N` placeholders
//! - In-memory and file-based databases
//! - Configurable open flags, busy timeout and foreign key enforcement
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_sqlite::SqliteConnection;
//! use keel_core::{Store, Value};
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let id = conn.insert("INSERT INTO users (name) VALUES (?1)", &[Value::from("Alice")])?;
//! ```
//!
//! SQLite has no row-level locks, so `LockMode::PessimisticWrite` renders no
//! `FOR UPDATE` clause here. The write lock taken by `BEGIN IMMEDIATE`
//! already serializes writers.
//!
//! # Thread Safety
//!
//! `SqliteConnection` is both `Send` and `Sync`; a mutex guards the
//! underlying handle.

// FFI bindings require unsafe code
#![allow(unsafe_code)]

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

/// The SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// The SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
