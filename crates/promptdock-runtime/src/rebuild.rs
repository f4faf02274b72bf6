//! Rebuild controller: the `error -> running` recovery path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::llm::{extract_code, rebuild_prompt};
use crate::models::RuntimeState;
use crate::supervisor::Supervisor;
use crate::validator::ProgramValidator;

impl Supervisor {
    /// Recover a failed runtime by asking the model for a corrected program
    /// and re-executing, bounded by the retry limit.
    ///
    /// Single-flight per id: a second invocation while a rebuild is in
    /// progress is a no-op, as is a cancelled `parent` token (the attempt's
    /// owner has already given up on it).
    ///
    /// Boxed: this, `execute`, and `prepare` call each other across this
    /// module and `supervisor.rs`, and leaving all three as plain `async fn`
    /// makes their opaque return types mutually referential, which rustc
    /// cannot resolve for the auto `Send` bound `tokio::spawn` needs. Boxing
    /// this one is enough to break the cycle.
    pub fn handle_runtime_failure<'a>(
        self: &'a Arc<Self>,
        id: &'a str,
        parent: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.active_rebuilds.lock().insert(id.to_string()) {
                info!(runtime = %id, "rebuild already in progress, skipping duplicate attempt");
                return Ok(());
            }
            let result = self.rebuild_locked(id, parent).await;
            self.active_rebuilds.lock().remove(id);
            result
        })
    }

    async fn rebuild_locked(
        self: &Arc<Self>,
        id: &str,
        parent: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        if parent.is_cancelled() {
            info!(runtime = %id, "parent context canceled, aborting failure handling");
            return Err(RuntimeError::Cancelled);
        }
        info!(runtime = %id, "handling runtime failure");

        loop {
            let runtime = self
                .registry
                .load(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

            if runtime.rebuild_count >= self.retry_limit {
                return self.exhaust_retries(id, parent, &runtime.prompt).await;
            }

            let attempt_no = runtime.rebuild_count + 1;
            info!(
                runtime = %id,
                "retrying runtime (attempt {attempt_no} of {})", self.retry_limit
            );
            self.registry.update(id, |r| r.rebuild_count = attempt_no);

            // Free the old program's port before the replacement arrives.
            if let Some(evaluator) = &runtime.evaluator {
                let _ = evaluator.invoke("Shutdown").await;
            }
            self.routes.deregister(id).await;

            let prompt = rebuild_prompt(&runtime.prompt, &runtime.last_error_msg, &runtime.code);
            let response = self.model.complete(&prompt).await?;

            // The record may have been stopped or failed while the model was
            // thinking; a terminal record is not rebuilt.
            if let Some(current) = self.registry.load(id) {
                if current.state.is_terminal() {
                    info!(runtime = %id, state = %current.state, "runtime became terminal during rebuild, aborting");
                    return Ok(());
                }
            }

            let code = extract_code(&response);
            if let Err(e) = ProgramValidator::for_runtime(id).validate(&code) {
                warn!(runtime = %id, "rebuilt code failed validation: {e}");
                self.registry.update(id, |r| {
                    r.last_error_msg = format!("code validation failed: {e}");
                    r.state = RuntimeState::Error;
                    r.code = code.clone();
                });
                self.persist(id).await;
                continue;
            }

            let (evaluator, logs) = self.evaluators.create();
            self.registry.update(id, |r| {
                r.code = code;
                r.state = RuntimeState::Rebuilding;
                r.last_error_msg.clear();
                r.evaluator = Some(evaluator.clone());
                r.logs = Some(logs.clone());
            });
            self.persist(id).await;
            return self.execute(id, parent).await;
        }
    }

    /// Retry budget spent: mark the record `failed` and drop its route. As a
    /// last chance the original prompt is prepared and executed once more
    /// under the same id; when that too has been spent, the failure is final.
    async fn exhaust_retries(
        self: &Arc<Self>,
        id: &str,
        parent: &CancellationToken,
        prompt: &str,
    ) -> Result<(), RuntimeError> {
        warn!(
            runtime = %id,
            "retry limit reached after {} attempts", self.retry_limit
        );
        self.registry.update(id, |r| r.state = RuntimeState::Failed);
        self.persist(id).await;
        self.routes.deregister(id).await;

        if !self.last_chance_used.lock().insert(id.to_string()) {
            return Err(RuntimeError::RetriesExhausted(self.retry_limit));
        }

        info!(runtime = %id, "rebuilding runtime once more after reaching the retry limit");
        let prompt = prompt.to_string();
        match self.prepare(parent, &prompt, Some(id.to_string())).await {
            Ok(_) => self.execute(id, parent).await,
            Err(e) => {
                self.registry.update(id, |r| r.state = RuntimeState::Failed);
                self.persist(id).await;
                Err(e)
            }
        }
    }
}
