pub mod config;
pub mod error;
pub mod event;
pub mod step;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{GraphError, Result, WeaverError};
pub use event::{EngineEvent, EventBus};
pub use step::{Step, StepKind, StepType, WorkflowDefinition};
pub use types::*;
