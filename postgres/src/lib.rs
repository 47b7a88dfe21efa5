//! Source side types and catalog queries for Postgres.

#[cfg(feature = "sqlx")]
pub mod introspection;
pub mod schema;
