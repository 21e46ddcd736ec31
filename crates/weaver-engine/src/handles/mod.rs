//! Wait handles: a generic completion primitive for long-running work.
//!
//! A launcher creates a handle and returns immediately; whoever finishes the
//! work calls `complete` or `fail`; callers poll with `wait_for` or
//! `wait_for_multiple`. A background sweeper times out handles whose deadline
//! has passed, whether or not anyone is polling them.

pub mod registry;
pub mod sweeper;
pub mod wait;

pub use registry::{HandleFilter, SweepReport, WaitHandleRegistry};
pub use sweeper::HandleSweeper;
pub use wait::MultiWaitOutcome;
