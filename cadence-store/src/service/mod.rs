//! Service Module
//!
//! Business logic on top of a `JobStore`: job selection, deduplicated
//! creation and the close-out cascade.

pub mod close_out;
pub mod job;

pub use close_out::CloseOutReport;
pub use job::JobService;
