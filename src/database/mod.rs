//! # Database Operations
//!
//! Connection pooling and schema migrations for the PostgreSQL-backed task store
//! and server registry.

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::run_migrations;
