//! Query routing: classification, worker dispatch, and orchestration.

pub mod classify;
pub mod dispatch;
pub mod orchestrator;
pub mod worker;

pub use classify::{Classification, QueryComplexity, WorkerTarget};
pub use dispatch::{RouteData, RouteOutcome, Router, RouterContext};
pub use orchestrator::{ExecutionPlan, Orchestrator, PlanStep, StepOutcome};
pub use worker::{
    ScheduledExecution, SharedWorker, WorkerClient, WorkerClientDyn, WorkerCompletion, WorkerInput,
    WorkerRegistry, WorkerResult, WorkerSignal,
};
