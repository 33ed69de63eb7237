//! Core domain types
//!
//! These types are shared between the store (which persists them) and the
//! supervisor (which runs them). Relationships between jobs are held as IDs.

pub mod job;
pub mod related;
