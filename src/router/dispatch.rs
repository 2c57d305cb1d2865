//! The router: classify, dispatch to a worker, merge the response.

use crate::error::ErrorKind;
use crate::llm::SharedProvider;
use crate::progress::{Step, StepRecorder};
use crate::router::classify::{Classification, WorkerTarget, classify};
use crate::router::worker::{WorkerClientDyn as _, WorkerInput, WorkerRegistry, WorkerResult};
use crate::session::state::StoredMessage;
use crate::{ExecutionId, ResponseTarget, SessionKey};

/// Everything the router needs for one query.
#[derive(Debug, Clone)]
pub struct RouterContext {
    pub query: String,
    pub session: SessionKey,
    pub history: Vec<StoredMessage>,
    pub event_id: Option<String>,
    pub target: ResponseTarget,
}

/// Structured routing data carried alongside the reply.
#[derive(Debug, Clone, Default)]
pub struct RouteData {
    pub new_messages: Vec<StoredMessage>,
    pub routed_to: Option<String>,
    pub classification: Option<Classification>,
}

/// Result of routing one query.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub success: bool,
    pub content: Option<String>,
    pub data: RouteData,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
    /// Set when the query was handed off fire-and-forget; the reply will
    /// arrive through the worker completion channel.
    pub delegated: Option<ExecutionId>,
}

/// Router over an explicit worker registry. The router never retries and
/// never substitutes a worker after a failure: retry policy belongs to the
/// batch processor, and the fallback to the direct chat loop belongs to the
/// session actor. An unregistered target is a routing decision, though, and
/// resolves to the general worker at lookup time.
pub struct Router {
    workers: WorkerRegistry,
    provider: SharedProvider,
}

impl Router {
    pub fn new(workers: WorkerRegistry, provider: SharedProvider) -> Self {
        Self { workers, provider }
    }

    #[tracing::instrument(skip(self, ctx, recorder), fields(session = %ctx.session))]
    pub async fn route(&self, ctx: RouterContext, recorder: &StepRecorder) -> RouteOutcome {
        let started = std::time::Instant::now();
        let classification = classify(&ctx.query, &self.provider).await;
        recorder.record(Step::Routing {
            agent: classification.target.to_string(),
        });
        tracing::info!(
            target = %classification.target,
            category = %classification.category,
            "classified query"
        );

        let input = WorkerInput {
            execution_id: uuid::Uuid::new_v4(),
            query: ctx.query.clone(),
            history: ctx.history.clone(),
            session: ctx.session.clone(),
            event_id: ctx.event_id.clone(),
        };

        // Orchestrations can outlive any sane request deadline, so they are
        // always dispatched fire-and-forget.
        if classification.target == WorkerTarget::Orchestrator {
            if let Some(worker) = self.workers.lookup(WorkerTarget::Orchestrator) {
                match worker.schedule_execution(input.clone(), ctx.target.clone()).await {
                    Ok(receipt) => {
                        recorder.record(Step::Subagent {
                            name: "orchestrator".into(),
                            status: "scheduled".into(),
                        });
                        return RouteOutcome {
                            success: true,
                            content: None,
                            data: RouteData {
                                new_messages: Vec::new(),
                                routed_to: Some("orchestrator".into()),
                                classification: Some(classification),
                            },
                            duration_ms: started.elapsed().as_millis() as u64,
                            error_kind: None,
                            delegated: Some(receipt.execution_id),
                        };
                    }
                    Err(error) => {
                        tracing::warn!(%error, "orchestrator scheduling failed, running inline");
                    }
                }
            } else {
                tracing::warn!("no orchestrator registered, running inline");
            }
        }

        let (worker, routed_to) = match self
            .workers
            .lookup(classification.target)
            .map(|worker| (worker, classification.target))
            .or_else(|| {
                self.workers
                    .lookup(WorkerTarget::General)
                    .map(|worker| (worker, WorkerTarget::General))
            }) {
            Some(found) => found,
            None => {
                return RouteOutcome {
                    success: false,
                    content: None,
                    data: RouteData {
                        classification: Some(classification),
                        ..RouteData::default()
                    },
                    duration_ms: started.elapsed().as_millis() as u64,
                    error_kind: Some(ErrorKind::WorkerUnavailable),
                    delegated: None,
                };
            }
        };

        recorder.record(Step::Subagent {
            name: routed_to.to_string(),
            status: "running".into(),
        });

        match worker.execute(input).await {
            Ok(result) => outcome_from_result(result, classification, routed_to, started),
            Err(error) => {
                tracing::warn!(%error, "worker dispatch failed");
                RouteOutcome {
                    success: false,
                    content: None,
                    data: RouteData {
                        classification: Some(classification),
                        routed_to: Some(routed_to.to_string()),
                        ..RouteData::default()
                    },
                    duration_ms: started.elapsed().as_millis() as u64,
                    error_kind: error.kind().or(Some(ErrorKind::WorkerUnavailable)),
                    delegated: None,
                }
            }
        }
    }
}

fn outcome_from_result(
    result: WorkerResult,
    classification: Classification,
    routed_to: WorkerTarget,
    started: std::time::Instant,
) -> RouteOutcome {
    RouteOutcome {
        success: result.success,
        content: Some(result.content),
        data: RouteData {
            new_messages: result.new_messages,
            routed_to: Some(routed_to.to_string()),
            classification: Some(classification),
        },
        duration_ms: started.elapsed().as_millis() as u64,
        error_kind: result
            .error
            .is_some()
            .then_some(ErrorKind::WorkerUnavailable)
            .filter(|_| !result.success),
        delegated: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::test_provider::ScriptedProvider;
    use crate::clock::SystemClock;
    use crate::error::Result;
    use crate::llm::TokenUsage;
    use crate::router::worker::{ScheduledExecution, WorkerClient};
    use crate::{Platform, ReplyOrigin};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedWorker {
        label: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedWorker {
        fn new(label: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                label,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl WorkerClient for Arc<FixedWorker> {
        fn name(&self) -> &str {
            self.label
        }

        async fn execute(&self, input: WorkerInput) -> Result<WorkerResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::LlmError::Unavailable("worker down".into()).into());
            }
            Ok(WorkerResult {
                success: true,
                content: format!("{} answered", self.label),
                new_messages: vec![
                    StoredMessage::user(input.query),
                    StoredMessage::assistant(format!("{} answered", self.label)),
                ],
                error: None,
                usage: TokenUsage::default(),
            })
        }

        async fn schedule_execution(
            &self,
            input: WorkerInput,
            _target: ResponseTarget,
        ) -> Result<ScheduledExecution> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScheduledExecution {
                scheduled: true,
                execution_id: input.execution_id,
            })
        }
    }

    fn ctx(query: &str) -> RouterContext {
        let session = SessionKey::new(Platform::Rest, "u", "c");
        RouterContext {
            query: query.into(),
            session: session.clone(),
            history: Vec::new(),
            event_id: None,
            target: ResponseTarget {
                session,
                origin: ReplyOrigin::Chat {
                    chat_id: "c".into(),
                },
                message_ref: None,
                is_admin: false,
            },
        }
    }

    fn recorder() -> StepRecorder {
        StepRecorder::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn code_queries_reach_the_code_worker() {
        let code = FixedWorker::new("code", false);
        let general = FixedWorker::new("general", false);
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerTarget::Code, Arc::new(code.clone()));
        registry.register(WorkerTarget::General, Arc::new(general.clone()));

        let provider: SharedProvider = Arc::new(ScriptedProvider::always("general"));
        let router = Router::new(registry, provider);

        let outcome = router
            .route(ctx("please debug this function"), &recorder())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.content.as_deref(), Some("code answered"));
        assert_eq!(outcome.data.routed_to.as_deref(), Some("code"));
        assert_eq!(outcome.data.new_messages.len(), 2);
        assert_eq!(code.calls.load(Ordering::SeqCst), 1);
        assert_eq!(general.calls.load(Ordering::SeqCst), 0);
    }

    /// A worker failure propagates with its own kind; the router does not
    /// substitute another worker behind the caller's back.
    #[tokio::test]
    async fn failing_specialist_propagates_error() {
        let code = FixedWorker::new("code", true);
        let general = FixedWorker::new("general", false);
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerTarget::Code, Arc::new(code.clone()));
        registry.register(WorkerTarget::General, Arc::new(general.clone()));

        let provider: SharedProvider = Arc::new(ScriptedProvider::always("general"));
        let router = Router::new(registry, provider);

        let outcome = router.route(ctx("fix this bug"), &recorder()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::LlmUnavailable));
        assert_eq!(code.calls.load(Ordering::SeqCst), 1);
        assert_eq!(general.calls.load(Ordering::SeqCst), 0, "no substitution");
    }

    /// An unregistered target resolves to general at lookup time.
    #[tokio::test]
    async fn unregistered_target_routes_to_general() {
        let general = FixedWorker::new("general", false);
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerTarget::General, Arc::new(general.clone()));

        let provider: SharedProvider = Arc::new(ScriptedProvider::always("general"));
        let router = Router::new(registry, provider);

        let outcome = router.route(ctx("fix this bug"), &recorder()).await;

        assert!(outcome.success);
        assert_eq!(outcome.data.routed_to.as_deref(), Some("general"));
        assert_eq!(general.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_registry_reports_worker_unavailable() {
        let provider: SharedProvider = Arc::new(ScriptedProvider::always("general"));
        let router = Router::new(WorkerRegistry::new(), provider);

        let outcome = router.route(ctx("hello"), &recorder()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::WorkerUnavailable));
    }

    #[tokio::test]
    async fn multi_step_queries_are_delegated_not_awaited() {
        let orchestrator = FixedWorker::new("orchestrator", false);
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerTarget::Orchestrator, Arc::new(orchestrator.clone()));

        let provider: SharedProvider = Arc::new(ScriptedProvider::always("general"));
        let router = Router::new(registry, provider);

        let outcome = router
            .route(
                ctx("first fetch the data and then summarize it, finally email me"),
                &recorder(),
            )
            .await;

        assert!(outcome.success);
        assert!(outcome.delegated.is_some());
        assert_eq!(outcome.content, None);
        assert_eq!(outcome.data.routed_to.as_deref(), Some("orchestrator"));
        assert_eq!(orchestrator.calls.load(Ordering::SeqCst), 1);
    }
}
