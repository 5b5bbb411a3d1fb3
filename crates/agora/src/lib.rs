//! Agora forum messaging server.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! build the same router over an in-memory database.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod messages;
pub mod users;
pub mod ws;
