//! Per-runtime supervision: prepare, execute, stop, status, restore.
//!
//! Each execution attempt owns a small task graph (the evaluation itself, the
//! log scanner, and a port watchdog) bound to one cancellation token that is
//! a child of the caller's token. Cancelling the attempt token stops all of
//! them; cancellation is never treated as a failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use promptdock_sandbox::{EvaluatorFactory, SandboxError};

use crate::error::RuntimeError;
use crate::llm::{extract_code, initial_prompt, LanguageModel};
use crate::models::{Runtime, RuntimeState};
use crate::registry::RuntimeRegistry;
use crate::routes::RouteTable;
use crate::scanner::run_scanner;
use crate::store::RecordStore;
use crate::validator::ProgramValidator;

/// Timing knobs for the supervision pipeline. The defaults are load-bearing;
/// tests compress them.
#[derive(Clone, Debug)]
pub struct SupervisorTimings {
    /// Log-buffer poll period while no port is known.
    pub log_poll: Duration,
    /// Registry poll period while waiting for a candidate's health check.
    pub health_poll: Duration,
    /// Wait between proxy registration and the health probe.
    pub settle: Duration,
    /// Grace between cooperative Shutdown and hard cancellation on Stop.
    pub stop_drain: Duration,
    /// Deadline for a program to log its port beacon.
    pub port_watchdog: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            log_poll: Duration::from_millis(10),
            health_poll: Duration::from_millis(500),
            settle: Duration::from_secs(10),
            stop_drain: Duration::from_secs(15),
            port_watchdog: Duration::from_secs(45),
        }
    }
}

/// The per-runtime state machine and owner of every lifecycle transition.
pub struct Supervisor {
    pub(crate) registry: RuntimeRegistry,
    pub(crate) model: Arc<dyn LanguageModel>,
    pub(crate) evaluators: Arc<dyn EvaluatorFactory>,
    pub(crate) routes: Arc<dyn RouteTable>,
    pub(crate) store: RecordStore,
    pub(crate) timings: SupervisorTimings,
    pub(crate) retry_limit: u32,
    pub(crate) candidates: usize,
    pub(crate) public_base_url: String,
    pub(crate) http: reqwest::Client,
    pub(crate) active_rebuilds: Mutex<HashSet<String>>,
    pub(crate) last_chance_used: Mutex<HashSet<String>>,
}

impl Supervisor {
    pub fn new(
        registry: RuntimeRegistry,
        model: Arc<dyn LanguageModel>,
        evaluators: Arc<dyn EvaluatorFactory>,
        routes: Arc<dyn RouteTable>,
        store: RecordStore,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            model,
            evaluators,
            routes,
            store,
            timings: SupervisorTimings::default(),
            retry_limit: 5,
            candidates: 5,
            public_base_url: public_base_url.into(),
            http: reqwest::Client::new(),
            active_rebuilds: Mutex::new(HashSet::new()),
            last_chance_used: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    /// Prepare + execute one runtime for `prompt`.
    pub async fn new_execution(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, RuntimeError> {
        info!("new execution request for prompt: {prompt}");
        let id = self.prepare(cancel, prompt, None).await?;
        self.execute(&id, cancel).await?;
        Ok(id)
    }

    /// Generate a program for `prompt` and stage it as a runtime record.
    ///
    /// With `reuse_id` the existing record is replaced in place (the retry
    /// exhaustion path), preserving its rebuild count. A validation failure
    /// records the error on the runtime, signals the rebuild controller in
    /// the background, and surfaces the failure to the caller.
    pub async fn prepare(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        prompt: &str,
        reuse_id: Option<String>,
    ) -> Result<String, RuntimeError> {
        let reused = reuse_id.is_some();
        let id = reuse_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let full_prompt = initial_prompt(prompt, &id);
        info!(runtime = %id, "requesting program from model");

        let response = tokio::select! {
            response = self.model.complete(&full_prompt) => response?,
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        };
        let code = extract_code(&response);

        let (evaluator, logs) = self.evaluators.create();
        let mut runtime = Runtime::new(id.clone(), full_prompt, code.clone());
        if reused {
            if let Some(previous) = self.registry.load(&id) {
                runtime.rebuild_count = previous.rebuild_count;
                runtime.created_at = previous.created_at;
                runtime.title = previous.title;
            }
        }
        runtime.evaluator = Some(evaluator);
        runtime.logs = Some(logs);
        self.registry.store(runtime);
        self.persist(&id).await;

        if let Err(e) = ProgramValidator::for_runtime(&id).validate(&code) {
            warn!(runtime = %id, "code validation failed: {e}");
            self.registry.update(&id, |r| {
                r.last_error_msg = format!("code validation failed: {e}");
                r.state = RuntimeState::Error;
            });
            self.persist(&id).await;
            let supervisor = self.clone();
            let failed_id = id.clone();
            let parent = cancel.clone();
            tokio::spawn(async move {
                let _ = supervisor.handle_runtime_failure(&failed_id, &parent).await;
            });
            return Err(e.into());
        }
        Ok(id)
    }

    /// Start the attempt task graph for a prepared runtime.
    ///
    /// Returns as soon as the tasks are running; outcomes are reported through
    /// the registry. `running` is only ever entered by the scanner once the
    /// port beacon has been parsed.
    pub async fn execute(
        self: &Arc<Self>,
        id: &str,
        parent: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let runtime = self
            .registry
            .load(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let evaluator = runtime
            .evaluator
            .clone()
            .ok_or_else(|| RuntimeError::NotExecutable(id.to_string()))?;
        info!(runtime = %id, "executing runtime");

        // At most one evaluation in flight per id.
        if let Some(previous) = runtime.cancel.clone() {
            previous.cancel();
        }

        let attempt = parent.child_token();
        self.registry.update(id, |r| {
            r.cancel = Some(attempt.clone());
            r.started_at = Some(Utc::now());
            r.port = 0;
            r.state = RuntimeState::Initializing;
        });
        self.persist(id).await;

        let supervisor = self.clone();
        let id = id.to_string();
        let parent = parent.clone();
        let code = runtime.code;
        tokio::spawn(async move {
            tokio::spawn(run_scanner(
                supervisor.clone(),
                id.clone(),
                attempt.clone(),
                parent.clone(),
            ));
            tokio::spawn(run_watchdog(
                supervisor.clone(),
                id.clone(),
                attempt.clone(),
                parent.clone(),
            ));

            let result = evaluator.evaluate(attempt.clone(), &code).await;
            attempt.cancel();

            match result {
                Ok(()) => {
                    info!(runtime = %id, "runtime finished");
                    supervisor.registry.update(&id, |r| {
                        r.state = RuntimeState::Finished;
                        r.finished_at = Some(Utc::now());
                    });
                    supervisor.persist(&id).await;
                }
                Err(SandboxError::Cancelled) => {}
                Err(e) => {
                    let message = e.to_string();
                    error!(runtime = %id, "runtime failed: {message}");
                    supervisor.registry.update(&id, |r| {
                        r.last_error_msg = message;
                        r.state = RuntimeState::Error;
                    });
                    supervisor.persist(&id).await;
                    let _ = supervisor.handle_runtime_failure(&id, &parent).await;
                }
            }
        });
        Ok(())
    }

    /// Administrative stop: cooperative shutdown, route removal, drain, hard
    /// cancel. Terminal for automated recovery; the record is retained.
    pub async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let runtime = self
            .registry
            .load(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        info!(runtime = %id, "stopping runtime");
        if let Some(evaluator) = &runtime.evaluator {
            let _ = evaluator.invoke("Shutdown").await;
        }
        self.routes.deregister(id).await;
        tokio::time::sleep(self.timings.stop_drain).await;
        if let Some(cancel) = &runtime.cancel {
            cancel.cancel();
        }
        self.registry.update(id, |r| r.state = RuntimeState::Stopped);
        self.persist(id).await;
        Ok(())
    }

    /// Current record for `id`.
    pub fn status(&self, id: &str) -> Result<Runtime, RuntimeError> {
        self.registry
            .load(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    /// Repopulate the registry from the record store. Restored records are
    /// inert: no interpreter, no cancellation handle, and nothing is resumed.
    pub async fn restore(&self) -> Result<usize, RuntimeError> {
        let records = self.store.load_all().await?;
        let count = records.len();
        for record in records {
            self.registry.store(record.into_inert());
        }
        info!("restored {count} runtime records");
        Ok(count)
    }

    /// Probe the runtime's root endpoint through the public router, then
    /// record the verdict: healthy runtimes get their flag set exactly once,
    /// unhealthy ones transition to `error`, lose their evaluation, and are
    /// handed to the rebuild controller.
    pub(crate) async fn run_health_check(
        self: &Arc<Self>,
        id: &str,
        attempt: &CancellationToken,
        parent: &CancellationToken,
    ) {
        if self.health_probe(id).await {
            info!(runtime = %id, "health check passed");
            self.registry.update(id, |r| r.passed_health_check = true);
            self.persist(id).await;
            return;
        }

        warn!(runtime = %id, "health check failed");
        self.registry.update(id, |r| {
            r.last_error_msg = "runtime root endpoint was inaccessible".to_string();
            r.state = RuntimeState::Error;
        });
        self.persist(id).await;

        let supervisor = self.clone();
        let failed_id = id.to_string();
        let parent = parent.clone();
        tokio::spawn(async move {
            let _ = supervisor.handle_runtime_failure(&failed_id, &parent).await;
        });
        attempt.cancel();
    }

    async fn health_probe(&self, id: &str) -> bool {
        let url = format!("{}/runtime/{}", self.public_base_url, id);
        match self.http.get(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!(runtime = %id, "health probe request failed: {e}");
                false
            }
        }
    }

    /// Write the current record to the durable store; persistence problems
    /// are logged, not fatal to supervision.
    pub(crate) async fn persist(&self, id: &str) {
        if let Some(runtime) = self.registry.load(id) {
            if let Err(e) = self.store.save(&runtime).await {
                warn!(runtime = %id, "failed to persist runtime record: {e}");
            }
        }
    }
}

/// Port watchdog: if no beacon has been parsed within the deadline, the
/// attempt is cancelled, the runtime transitions to `error`, and the rebuild
/// controller takes over.
async fn run_watchdog(
    supervisor: Arc<Supervisor>,
    id: String,
    attempt: CancellationToken,
    parent: CancellationToken,
) {
    tokio::select! {
        _ = tokio::time::sleep(supervisor.timings.port_watchdog) => {}
        _ = attempt.cancelled() => return,
    }
    let port_seen = supervisor
        .registry
        .load(&id)
        .map(|r| r.port > 0)
        .unwrap_or(false);
    if port_seen {
        return;
    }

    warn!(runtime = %id, "runtime never logged a port");
    attempt.cancel();
    supervisor.registry.update(&id, |r| {
        r.last_error_msg = "runtime never logged a port".to_string();
        r.state = RuntimeState::Error;
    });
    supervisor.persist(&id).await;
    let _ = supervisor.handle_runtime_failure(&id, &parent).await;
}
