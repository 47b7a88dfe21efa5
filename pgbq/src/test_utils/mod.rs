//! Doubles and builders shared by unit and integration tests.

pub mod destination;
pub mod introspector;
pub mod record;
