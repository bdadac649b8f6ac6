pub mod context;
pub mod coordinator;
pub mod operator;
pub mod pipeline;
pub mod prompt;
pub mod tools;

pub use context::{Context, RunContext};
pub use coordinator::{
    Coordinator, CoordinatorSettings, CoordinatorStatus, OperatorRunResult, RunOptions,
    RunOutcome, Strategy,
};
pub use operator::{OperatorConfig, OperatorEvent, OperatorHandle};
