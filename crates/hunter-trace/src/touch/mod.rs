//! Selective state materialization: per-field touch tracking, committed
//! baseline, call-boundary snapshots, and the lazy loader that backfills
//! ground truth on first access.

mod cache;
pub use cache::*;

mod loader;
pub use loader::*;

mod snapshot;
pub use snapshot::*;
