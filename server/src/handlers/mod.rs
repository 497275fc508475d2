//! Request handlers for record, conflict and merge operations.

mod conflicts;
mod merge;
mod records;

pub use conflicts::*;
pub use merge::*;
pub use records::*;
