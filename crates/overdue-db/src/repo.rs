//! Repositories used by the process that owns units.
//!
//! The claim protocol itself lives in `overdue-scheduler`; these cover the
//! other side: creating and touching units, and recording stage outcomes.

pub mod unit;
pub mod work_record;

pub use unit::{PgUnitRepo, Unit, UnitRepo};
pub use work_record::{PgWorkRecordRepo, WorkRecord, WorkRecordRepo};
