//! Domain types: task ids, statuses, records, and transitions.
//!
//! These types are backend-neutral. Stores persist [`TaskRecord`] field by
//! field (key-value) or column by column (relational); both go through
//! [`TaskRecord::apply`] for every mutation.

pub mod record;
pub mod status;

pub use record::*;
pub use status::*;
