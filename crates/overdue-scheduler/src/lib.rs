//! Work claiming for overdue.
//!
//! Hands out overdue units to concurrent workers. Uses PostgreSQL row locks
//! with SKIP LOCKED so that no two workers ever claim the same unit and no
//! worker waits on another's claim.

pub mod error;
pub mod handler;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use error::{HandlerError, QueueError, QueueResult};
pub use handler::ClaimHandler;
pub use queue::{Claim, ClaimQueue};
pub use worker::{Outcome, Worker};
