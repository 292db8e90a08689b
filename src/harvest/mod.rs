//! Resumable page-by-page sweep over a source.
//!
//! [`Cursor`] is the persisted position grammar, [`Paginator`] drives the
//! fetch loop and emits checkpointable pages.

mod cursor;
mod paginator;

pub use cursor::Cursor;
pub use paginator::{HarvestError, HarvestPage, Paginator, RunState};
