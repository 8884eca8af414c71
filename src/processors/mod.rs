//! Pipeline processor tasks: each owns a bounded input queue and one worker
//! task, torn down deterministically with a poison-pill shutdown input.

mod ack;
mod commit;
mod prep;
mod syncer;

pub(crate) use ack::{AckInput, AckProcessor};
pub(crate) use commit::{CommitInput, CommitProcessor};
pub(crate) use prep::{PrepInput, PreProcessor};
pub(crate) use syncer::{SyncInput, SyncProposalProcessor};

/// Capacity of each processor's bounded input queue; a full queue blocks the
/// submitter, which is the engine's backpressure.
pub(crate) const PROC_QUEUE_CAP: usize = 8192;
