//! Gleaner DB - PostgreSQL persistence for the Gleaner store traits.

mod repository;

pub use repository::{is_lock_not_available, PgRepository};
