mod base;
mod batch;
mod connection;
mod destination;
mod discovery;
mod loader;
mod staging;

pub use base::*;
pub use batch::*;
pub use connection::*;
pub use destination::*;
pub use discovery::*;
pub use loader::*;
pub use staging::*;
