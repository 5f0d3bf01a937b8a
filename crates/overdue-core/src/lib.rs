//! Core domain types for the overdue work-claiming queue.
//!
//! This crate contains:
//! - Unit identifiers
//! - Stage discriminators and work record statuses
//! - The claim policy (eligibility predicate inputs)

pub mod error;
pub mod id;
pub mod policy;
pub mod stage;
pub mod status;

pub use error::{Error, Result};
pub use id::UnitId;
pub use policy::ClaimPolicy;
pub use stage::StageKind;
pub use status::WorkStatus;
