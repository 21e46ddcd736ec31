//! Dependency ordering and execution planning.
//!
//! `GraphScheduler` orders any set of nodes by their declared dependencies.
//! `Plan` applies it twice: once to the raw definition to reject cycles,
//! and once to the top-level steps after folding container-owned steps into
//! their containers.

pub mod plan;
pub mod scheduler;

pub use plan::Plan;
pub use scheduler::{GraphScheduler, Schedulable};
