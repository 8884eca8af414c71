//! Durable storage: the segment transaction log and the persistence wrapper
//! that owns it together with epoch counters, cluster config, and snapshot.

mod log;
mod persist;

pub use log::{LogIter, SegmentLog};
pub use persist::Persistence;
