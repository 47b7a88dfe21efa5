//! Configuration types and the layered configuration loader shared by the loader binary
//! and the engine.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::*;
