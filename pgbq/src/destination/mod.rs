//! Warehouse abstractions used by the staging loader and the merge reconciler.
//!
//! The [`Destination`] trait covers table provisioning, row appends and statement execution.
//! [`memory::MemoryDestination`] keeps everything in process and mirrors the warehouse's
//! validation and merge behavior, which makes it the destination of choice for tests.

mod base;
#[cfg(feature = "bigquery")]
pub mod bigquery;
mod identifier;
pub mod memory;

pub use base::{Destination, RejectedRow};
pub use identifier::{quote_identifier, sanitize_identifier};
