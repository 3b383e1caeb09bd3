//! SQLite storage for the signaling service.

pub mod models;
pub mod queries;

homeport_core::define_database!(SignalingDatabase, "Signaling database migrations complete");
