pub mod context;
pub mod expr;
pub mod graph;
pub mod handles;
pub mod orchestrator;
pub mod retry;
pub mod steps;
pub mod team;

pub use context::ExecutionContext;
pub use graph::{GraphScheduler, Plan, Schedulable};
pub use handles::{HandleFilter, HandleSweeper, MultiWaitOutcome, SweepReport, WaitHandleRegistry};
pub use orchestrator::{ExecuteOptions, Orchestrator, OrchestratorBuilder};
pub use retry::RetryingSampler;
pub use steps::{RunScope, StepExecutor, StepOutcome};
pub use team::TurnTakingTeam;
