//! Homeport Core Library
//!
//! Shared functionality for the Homeport services and endpoints:
//! - JWT authentication and argon2id password hashing (the signaling and
//!   relay services must verify tokens against the same secret)
//! - SQLite pool helpers and the `define_database!` macro
//! - Tracing/logging initialization

pub mod auth;
pub mod db;
pub mod tracing_init;
