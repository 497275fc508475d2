//! Database module for PostgreSQL persistence.

mod pool;
mod revisions;

pub use pool::*;
pub use revisions::*;
