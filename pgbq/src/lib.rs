//! Schema translation and upsert loading from Postgres into BigQuery.
//!
//! Source tables are described once by [`catalog::discover_catalog`] and persisted as a
//! [`catalog::Catalog`]. Loading then reads newline-delimited records ([`transport`]),
//! normalizes them ([`coercion`]), appends them to per-table staging tables ([`loader`]) and
//! reconciles staging into the durable targets with a single `MERGE` per cycle ([`merge`]).
//! [`pipeline::LoadPipeline`] ties these steps together.

pub mod catalog;
pub mod coercion;
pub mod destination;
pub mod error;
pub mod loader;
mod macros;
pub mod mapping;
pub mod merge;
pub mod pipeline;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod types;
