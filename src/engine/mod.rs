mod context;
mod control;
mod embedded;
mod error;
mod evaluation;
mod report;
mod runner;
mod state;
mod steps;
mod value;

pub use context::ScenarioContext;
pub use control::{ControlHandle, ControlState, ExecutionManager};
pub use embedded::EmbeddedEngine;
pub use error::EngineError;
pub use evaluation::{EvaluationError, Evaluator, FunctionRegistry, HelperFn};
pub use report::{ExecutionReport, ReportStream, Reporter, StepExecutionReport};
pub use state::{ExecutionTree, StepNode, StepStatus, derive_parent_status};
pub use steps::{
    ActionInput, ActionOutcome, ActionRegistry, ActionStatus, CompareAction, ContextPutAction,
    DebugAction, FailAction, SharedAction, SleepAction, StepAction, SuccessAction,
    parse_duration,
};
pub use value::{ContextObject, Value};
