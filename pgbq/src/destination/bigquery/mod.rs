//! BigQuery destination over the REST API.

mod client;
mod core;
mod schema;

pub use client::{BigQueryClient, BigQueryDatasetId, BigQueryProjectId};
pub use core::BigQueryDestination;
pub use schema::parse_column_type;
