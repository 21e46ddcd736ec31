//! Test doubles and fixtures shared by weaver's unit and integration tests.

pub mod caller;
pub mod fixtures;
pub mod sampler;

pub use caller::RecordingCaller;
pub use fixtures::{config_file, lit, workflow};
pub use sampler::{FlakySampler, ScriptedSampler};
