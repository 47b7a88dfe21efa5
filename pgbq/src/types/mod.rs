//! Core data types: target columns, stream schemas, records and their cells.

mod cell;
mod column;
mod record;
mod schema;

pub use cell::*;
pub use column::*;
pub use record::*;
pub use schema::*;

pub use postgres::schema::{ColumnDescriptor, TableName};
