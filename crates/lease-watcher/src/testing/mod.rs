//! Testing utilities for watchers
//!
//! An in-memory lease store and recording sinks, so the coordinator and
//! renewer can be exercised without a database.

pub mod memory;
pub mod sink;

pub use memory::MemoryLeaseStore;
pub use sink::{OverlapTracker, RecordedDelivery, RecordingSink};
