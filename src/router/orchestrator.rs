//! Multi-step orchestration: plan a DAG, execute it in waves, aggregate.

use crate::config::RuntimeConfig;
use crate::error::{LlmError, Result, RouterError};
use crate::llm::{ChatMessage, ChatOptions, LlmProviderDyn as _, SharedProvider, TokenUsage};
use crate::router::classify::WorkerTarget;
use crate::router::worker::{
    ScheduledExecution, SharedWorker, WorkerClient, WorkerClientDyn as _, WorkerCompletion,
    WorkerInput, WorkerRegistry, WorkerResult, WorkerSignal, deliver,
};
use crate::session::state::StoredMessage;
use crate::transport::SharedTransport;
use crate::{Platform, ResponseTarget};
use arc_swap::ArcSwap;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One node of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    pub step_id: String,
    pub worker_type: String,
    pub task: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A validated DAG of steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success { output: String },
    Failed { error: String },
    /// Not run because a dependency failed and `continue_on_error` is off.
    Skipped,
}

/// One step paired with its outcome.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step: PlanStep,
    pub outcome: StepOutcome,
}

impl ExecutionPlan {
    /// Validate IDs, dependency references, step count, and acyclicity.
    pub fn validate(&self, max_steps: usize) -> Result<()> {
        if self.steps.is_empty() {
            return Err(RouterError::InvalidPlan("plan has no steps".into()).into());
        }
        if self.steps.len() > max_steps {
            return Err(RouterError::InvalidPlan(format!(
                "plan has {} steps, cap is {max_steps}",
                self.steps.len()
            ))
            .into());
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.step_id.as_str()) {
                return Err(
                    RouterError::InvalidPlan(format!("duplicate step id: {}", step.step_id)).into(),
                );
            }
        }

        for step in &self.steps {
            for dependency in &step.dependencies {
                if !ids.contains(dependency.as_str()) {
                    return Err(RouterError::InvalidPlan(format!(
                        "step {} depends on undefined step {dependency}",
                        step.step_id
                    ))
                    .into());
                }
                if dependency == &step.step_id {
                    return Err(RouterError::InvalidPlan(format!(
                        "step {} depends on itself",
                        step.step_id
                    ))
                    .into());
                }
            }
        }

        // Kahn's algorithm; leftover nodes mean a cycle.
        if self.topological_waves().is_none() {
            return Err(RouterError::InvalidPlan("dependency cycle detected".into()).into());
        }

        Ok(())
    }

    /// Group steps into waves where every step's dependencies are satisfied
    /// by earlier waves. None when the graph has a cycle.
    pub fn topological_waves(&self) -> Option<Vec<Vec<&PlanStep>>> {
        let mut resolved: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&PlanStep> = self.steps.iter().collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<&PlanStep>, Vec<&PlanStep>) =
                remaining.into_iter().partition(|step| {
                    step.dependencies
                        .iter()
                        .all(|dependency| resolved.contains(dependency.as_str()))
                });

            if ready.is_empty() {
                return None;
            }

            for step in &ready {
                resolved.insert(step.step_id.as_str());
            }
            waves.push(ready);
            remaining = rest;
        }

        Some(waves)
    }
}

const PLAN_PROMPT: &str = "Break the user's request into an execution plan. \
Reply with ONLY a JSON object of the form \
{\"steps\": [{\"step_id\": \"s1\", \"worker_type\": \"general|code|research\", \
\"task\": \"...\", \"description\": \"...\", \"dependencies\": []}]}. \
Use dependencies to order steps; keep the plan minimal.";

const AGGREGATE_PROMPT: &str = "Combine the step results below into one clear answer \
for the user. Do not mention steps or workers.";

struct OrchestratorInner {
    provider: SharedProvider,
    step_workers: WorkerRegistry,
    config: Arc<ArcSwap<RuntimeConfig>>,
    transports: Arc<HashMap<Platform, SharedTransport>>,
    signal_tx: mpsc::Sender<WorkerSignal>,
}

/// Orchestrator worker: plans, fans out to step workers, aggregates.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        provider: SharedProvider,
        step_workers: WorkerRegistry,
        config: Arc<ArcSwap<RuntimeConfig>>,
        transports: Arc<HashMap<Platform, SharedTransport>>,
        signal_tx: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                provider,
                step_workers,
                config,
                transports,
                signal_tx,
            }),
        }
    }

    /// Ask the LLM for an execution plan and validate it.
    pub async fn plan(&self, query: &str) -> Result<ExecutionPlan> {
        let messages = [ChatMessage::system(PLAN_PROMPT), ChatMessage::user(query)];
        let response = self
            .inner
            .provider
            .chat(&messages, &[], &ChatOptions::default())
            .await?;

        let plan = parse_plan(&response.content)?;
        plan.validate(self.inner.config.load().orchestrator.max_steps)?;
        Ok(plan)
    }

    /// Execute a validated plan in topological waves.
    pub async fn execute_plan(&self, plan: &ExecutionPlan, input: &WorkerInput) -> Vec<StepResult> {
        let config = self.inner.config.load_full();
        let max_parallel = config.orchestrator.max_parallel;
        let step_timeout = config.orchestrator.step_timeout;
        let continue_on_error = config.orchestrator.continue_on_error;

        let waves = plan
            .topological_waves()
            .expect("plan validated before execution");

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results: Vec<StepResult> = Vec::new();

        for wave in waves {
            let mut runnable: Vec<PlanStep> = Vec::new();
            for step in wave {
                let blocked = step
                    .dependencies
                    .iter()
                    .any(|dependency| failed.contains(dependency.as_str()));
                if blocked && !continue_on_error {
                    failed.insert(step.step_id.clone());
                    results.push(StepResult {
                        step: step.clone(),
                        outcome: StepOutcome::Skipped,
                    });
                    continue;
                }
                runnable.push(step.clone());
            }

            let wave_results: Vec<(PlanStep, StepOutcome)> =
                futures::stream::iter(runnable.into_iter().map(|step| {
                    let context = dependency_context(&step, &outputs);
                    let inner = self.inner.clone();
                    let input = input.clone();
                    async move {
                        let outcome =
                            run_step(&inner, &step, &input, context, step_timeout).await;
                        (step, outcome)
                    }
                }))
                .buffer_unordered(max_parallel.max(1))
                .collect()
                .await;

            for (step, outcome) in wave_results {
                match &outcome {
                    StepOutcome::Success { output } => {
                        outputs.insert(step.step_id.clone(), output.clone());
                    }
                    StepOutcome::Failed { .. } => {
                        failed.insert(step.step_id.clone());
                    }
                    StepOutcome::Skipped => {
                        failed.insert(step.step_id.clone());
                    }
                }
                results.push(StepResult { step, outcome });
            }
        }

        results
    }

    /// Merge step results into one reply.
    pub async fn aggregate(&self, query: &str, results: &[StepResult]) -> String {
        let concatenated = concat_results(results);

        if !self.inner.config.load().orchestrator.use_llm_aggregation {
            return concatenated;
        }

        let messages = [
            ChatMessage::system(AGGREGATE_PROMPT),
            ChatMessage::user(format!("Request: {query}\n\nStep results:\n{concatenated}")),
        ];
        match self
            .inner
            .provider
            .chat(&messages, &[], &ChatOptions::default())
            .await
        {
            Ok(response) if !response.content.is_empty() => response.content,
            Ok(_) => concatenated,
            Err(error) => {
                tracing::warn!(%error, "llm aggregation failed, concatenating");
                concatenated
            }
        }
    }

    async fn run(&self, input: &WorkerInput) -> Result<WorkerResult> {
        let plan = self.plan(&input.query).await?;
        tracing::info!(
            steps = plan.steps.len(),
            execution_id = %input.execution_id,
            "executing plan"
        );

        let results = self.execute_plan(&plan, input).await;
        let content = self.aggregate(&input.query, &results).await;

        let any_success = results
            .iter()
            .any(|result| matches!(result.outcome, StepOutcome::Success { .. }));
        let any_failed = results
            .iter()
            .any(|result| !matches!(result.outcome, StepOutcome::Success { .. }));
        let continue_on_error = self.inner.config.load().orchestrator.continue_on_error;
        let success = any_success && (!any_failed || continue_on_error);

        let new_messages = if success {
            vec![
                StoredMessage::user(input.query.clone()),
                StoredMessage::assistant(content.clone()),
            ]
        } else {
            Vec::new()
        };

        Ok(WorkerResult {
            success,
            content,
            new_messages,
            error: (!success).then(|| "one or more plan steps failed".to_string()),
            usage: TokenUsage::default(),
        })
    }
}

fn dependency_context(step: &PlanStep, outputs: &HashMap<String, String>) -> String {
    let mut context = String::new();
    for dependency in &step.dependencies {
        if let Some(output) = outputs.get(dependency) {
            context.push_str(&format!("[{dependency}]\n{output}\n\n"));
        }
    }
    context
}

async fn run_step(
    inner: &OrchestratorInner,
    step: &PlanStep,
    input: &WorkerInput,
    context: String,
    step_timeout: std::time::Duration,
) -> StepOutcome {
    let target = WorkerTarget::from_label(&step.worker_type).unwrap_or(WorkerTarget::General);
    let Some(worker) = inner
        .step_workers
        .lookup(target)
        .or_else(|| inner.step_workers.lookup(WorkerTarget::General))
    else {
        return StepOutcome::Failed {
            error: format!("no worker for step type {}", step.worker_type),
        };
    };

    let query = if context.is_empty() {
        step.task.clone()
    } else {
        format!("{}\n\nContext from earlier steps:\n{context}", step.task)
    };

    let step_input = WorkerInput {
        execution_id: input.execution_id,
        query,
        history: Vec::new(),
        session: input.session.clone(),
        event_id: input.event_id.clone(),
    };

    match tokio::time::timeout(step_timeout, worker.execute(step_input)).await {
        Ok(Ok(result)) if result.success => StepOutcome::Success {
            output: result.content,
        },
        Ok(Ok(result)) => StepOutcome::Failed {
            error: result
                .error
                .unwrap_or_else(|| "step reported failure".into()),
        },
        Ok(Err(error)) => StepOutcome::Failed {
            error: error.to_string(),
        },
        Err(_) => StepOutcome::Failed {
            error: format!("step timed out after {step_timeout:?}"),
        },
    }
}

fn concat_results(results: &[StepResult]) -> String {
    let mut output = String::new();
    for result in results {
        match &result.outcome {
            StepOutcome::Success { output: text } => {
                output.push_str(text);
                output.push_str("\n\n");
            }
            StepOutcome::Failed { error } => {
                output.push_str(&format!("({}: failed — {error})\n\n", result.step.step_id));
            }
            StepOutcome::Skipped => {
                output.push_str(&format!("({}: skipped)\n\n", result.step.step_id));
            }
        }
    }
    output.trim_end().to_string()
}

/// Parse a plan out of an LLM reply, tolerating markdown code fences.
fn parse_plan(content: &str) -> Result<ExecutionPlan> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body)
        .map_err(|error| LlmError::BadResponse(format!("unparseable plan: {error}")).into())
}

impl WorkerClient for Orchestrator {
    fn name(&self) -> &str {
        "orchestrator"
    }

    async fn execute(&self, input: WorkerInput) -> Result<WorkerResult> {
        self.run(&input).await
    }

    async fn schedule_execution(
        &self,
        input: WorkerInput,
        target: ResponseTarget,
    ) -> Result<ScheduledExecution> {
        let execution_id = input.execution_id;
        let orchestrator = self.clone();

        tokio::spawn(async move {
            let signal_tx = orchestrator.inner.signal_tx.clone();
            let _ = signal_tx
                .send(WorkerSignal::Progress {
                    session: input.session.clone(),
                    execution_id,
                    status: "planning".into(),
                })
                .await;

            let interval = orchestrator.inner.config.load().timing.rotation_interval;
            let run_future = orchestrator.run(&input);
            tokio::pin!(run_future);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            let outcome = loop {
                tokio::select! {
                    outcome = &mut run_future => break outcome,
                    _ = ticker.tick() => {
                        let _ = signal_tx
                            .send(WorkerSignal::Progress {
                                session: input.session.clone(),
                                execution_id,
                                status: "orchestrating".into(),
                            })
                            .await;
                    }
                }
            };

            let result = match outcome {
                Ok(result) => result,
                Err(error) => {
                    tracing::warn!(%error, "orchestration failed");
                    WorkerResult {
                        success: false,
                        content:
                            "I couldn't complete that multi-step task. Please try again."
                                .into(),
                        new_messages: Vec::new(),
                        error: Some(error.to_string()),
                        usage: TokenUsage::default(),
                    }
                }
            };

            if let Err(error) =
                deliver(&orchestrator.inner.transports, &target, &result.content).await
            {
                tracing::warn!(%error, "failed to deliver orchestrator reply");
            }

            let _ = signal_tx
                .send(WorkerSignal::Complete(Box::new(WorkerCompletion {
                    session: input.session.clone(),
                    execution_id,
                    result,
                    target,
                })))
                .await;
        });

        Ok(ScheduledExecution {
            scheduled: true,
            execution_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::test_provider::ScriptedProvider;
    use crate::llm::ChatResponse;
    use crate::transport::MemoryTransport;
    use crate::{ReplyOrigin, SessionKey};
    use std::sync::Mutex;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep {
            step_id: id.into(),
            worker_type: "general".into(),
            task: format!("task {id}"),
            description: String::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn validate_accepts_a_diamond() {
        let plan = ExecutionPlan {
            steps: vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b", "c"]),
            ],
        };
        plan.validate(10).expect("valid");

        let waves = plan.topological_waves().expect("waves");
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].len(), 1);
        assert_eq!(waves[1].len(), 2);
    }

    #[test]
    fn validate_rejects_cycles_and_bad_refs() {
        let cycle = ExecutionPlan {
            steps: vec![step("a", &["b"]), step("b", &["a"])],
        };
        assert!(cycle.validate(10).is_err());

        let undefined = ExecutionPlan {
            steps: vec![step("a", &["ghost"])],
        };
        assert!(undefined.validate(10).is_err());

        let duplicate = ExecutionPlan {
            steps: vec![step("a", &[]), step("a", &[])],
        };
        assert!(duplicate.validate(10).is_err());

        let oversized = ExecutionPlan {
            steps: vec![step("a", &[]), step("b", &[])],
        };
        assert!(oversized.validate(1).is_err());

        let self_loop = ExecutionPlan {
            steps: vec![step("a", &["a"])],
        };
        assert!(self_loop.validate(10).is_err());
    }

    #[test]
    fn parse_plan_tolerates_code_fences() {
        let fenced = "```json\n{\"steps\": [{\"step_id\": \"s1\", \"worker_type\": \"general\", \"task\": \"t\"}]}\n```";
        let plan = parse_plan(fenced).expect("plan");
        assert_eq!(plan.steps.len(), 1);

        assert!(parse_plan("not json").is_err());
    }

    /// Step worker that records execution order and fails on request.
    struct StubWorker {
        log: Arc<Mutex<Vec<String>>>,
        fail_ids: Vec<String>,
    }

    impl WorkerClient for StubWorker {
        fn name(&self) -> &str {
            "stub"
        }

        async fn execute(&self, input: WorkerInput) -> Result<WorkerResult> {
            // Task text is "task <id>" possibly with appended context.
            let id = input
                .query
                .lines()
                .next()
                .and_then(|line| line.strip_prefix("task "))
                .unwrap_or("?")
                .to_string();
            self.log.lock().expect("log").push(id.clone());

            if self.fail_ids.contains(&id) {
                return Ok(WorkerResult {
                    success: false,
                    content: String::new(),
                    new_messages: Vec::new(),
                    error: Some(format!("{id} exploded")),
                    usage: TokenUsage::default(),
                });
            }
            Ok(WorkerResult {
                success: true,
                content: format!("out-{id} ({})", input.query.contains("Context")),
                new_messages: Vec::new(),
                error: None,
                usage: TokenUsage::default(),
            })
        }

        async fn schedule_execution(
            &self,
            _input: WorkerInput,
            _target: ResponseTarget,
        ) -> Result<ScheduledExecution> {
            unreachable!("stub is synchronous only")
        }
    }

    fn orchestrator_with(
        provider: Arc<ScriptedProvider>,
        fail_ids: Vec<String>,
        config: RuntimeConfig,
    ) -> (Orchestrator, Arc<Mutex<Vec<String>>>, mpsc::Receiver<WorkerSignal>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkerRegistry::new();
        registry.register(
            WorkerTarget::General,
            Arc::new(StubWorker {
                log: log.clone(),
                fail_ids,
            }),
        );

        let (signal_tx, signal_rx) = mpsc::channel(16);
        let mut transports: HashMap<Platform, SharedTransport> = HashMap::new();
        transports.insert(Platform::Rest, Arc::new(MemoryTransport::new()));

        let orchestrator = Orchestrator::new(
            provider,
            registry,
            Arc::new(ArcSwap::from_pointee(config)),
            Arc::new(transports),
            signal_tx,
        );
        (orchestrator, log, signal_rx)
    }

    fn worker_input(query: &str) -> WorkerInput {
        WorkerInput {
            execution_id: uuid::Uuid::new_v4(),
            query: query.into(),
            history: Vec::new(),
            session: SessionKey::new(Platform::Rest, "u", "c"),
            event_id: None,
        }
    }

    #[tokio::test]
    async fn executes_waves_and_feeds_dependency_context() {
        let plan = ExecutionPlan {
            steps: vec![step("a", &[]), step("b", &["a"])],
        };
        let provider = Arc::new(ScriptedProvider::always("unused"));
        let (orchestrator, log, _rx) =
            orchestrator_with(provider, Vec::new(), RuntimeConfig::default());

        let results = orchestrator
            .execute_plan(&plan, &worker_input("q"))
            .await;

        assert_eq!(log.lock().expect("log").as_slice(), ["a", "b"]);
        assert!(matches!(results[0].outcome, StepOutcome::Success { .. }));
        // Step b saw dependency context from a.
        let StepOutcome::Success { output } = &results[1].outcome else {
            panic!("b should succeed");
        };
        assert!(output.contains("true"), "b ran with context: {output}");
    }

    #[tokio::test]
    async fn dependent_steps_are_skipped_when_a_dependency_fails() {
        let plan = ExecutionPlan {
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
        };
        let provider = Arc::new(ScriptedProvider::always("unused"));
        let (orchestrator, log, _rx) =
            orchestrator_with(provider, vec!["a".into()], RuntimeConfig::default());

        let results = orchestrator
            .execute_plan(&plan, &worker_input("q"))
            .await;

        assert_eq!(log.lock().expect("log").as_slice(), ["a"]);
        assert!(matches!(results[0].outcome, StepOutcome::Failed { .. }));
        assert!(matches!(results[1].outcome, StepOutcome::Skipped));
        assert!(matches!(results[2].outcome, StepOutcome::Skipped));
    }

    #[tokio::test]
    async fn continue_on_error_keeps_going() {
        let plan = ExecutionPlan {
            steps: vec![step("a", &[]), step("b", &["a"])],
        };
        let mut config = RuntimeConfig::default();
        config.orchestrator.continue_on_error = true;
        let provider = Arc::new(ScriptedProvider::always("unused"));
        let (orchestrator, log, _rx) = orchestrator_with(provider, vec!["a".into()], config);

        let results = orchestrator
            .execute_plan(&plan, &worker_input("q"))
            .await;

        assert_eq!(log.lock().expect("log").as_slice(), ["a", "b"]);
        assert!(matches!(results[1].outcome, StepOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn concat_aggregation_marks_failures() {
        let results = vec![
            StepResult {
                step: step("a", &[]),
                outcome: StepOutcome::Success {
                    output: "alpha".into(),
                },
            },
            StepResult {
                step: step("b", &[]),
                outcome: StepOutcome::Failed {
                    error: "boom".into(),
                },
            },
            StepResult {
                step: step("c", &[]),
                outcome: StepOutcome::Skipped,
            },
        ];
        let text = concat_results(&results);
        assert!(text.contains("alpha"));
        assert!(text.contains("(b: failed — boom)"));
        assert!(text.contains("(c: skipped)"));
    }

    #[tokio::test]
    async fn execute_plans_validates_and_aggregates_end_to_end() {
        let plan_json = serde_json::json!({
            "steps": [
                {"step_id": "s1", "worker_type": "general", "task": "task s1", "dependencies": []},
                {"step_id": "s2", "worker_type": "general", "task": "task s2", "dependencies": ["s1"]},
            ]
        });
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ChatResponse {
            content: plan_json.to_string(),
            ..ChatResponse::default()
        })]));
        let (orchestrator, _log, _rx) =
            orchestrator_with(provider, Vec::new(), RuntimeConfig::default());

        let result = WorkerClient::execute(&orchestrator, worker_input("do two things"))
            .await
            .expect("result");

        assert!(result.success);
        assert!(result.content.contains("out-s1"));
        assert!(result.content.contains("out-s2"));
        assert_eq!(result.new_messages.len(), 2);
    }

    #[tokio::test]
    async fn invalid_plan_is_a_validation_error() {
        let plan_json = serde_json::json!({
            "steps": [
                {"step_id": "s1", "worker_type": "general", "task": "t", "dependencies": ["s1"]},
            ]
        });
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ChatResponse {
            content: plan_json.to_string(),
            ..ChatResponse::default()
        })]));
        let (orchestrator, _log, _rx) =
            orchestrator_with(provider, Vec::new(), RuntimeConfig::default());

        let error = WorkerClient::execute(&orchestrator, worker_input("q"))
            .await
            .expect_err("must fail");
        assert_eq!(error.kind(), Some(crate::ErrorKind::Validation));
    }
}
