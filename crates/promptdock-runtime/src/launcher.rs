//! Speculative launcher: best-of-N candidate racing.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::llm::title_prompt;
use crate::models::RuntimeState;
use crate::supervisor::Supervisor;

impl Supervisor {
    /// Start N candidate runtimes for `prompt` on independent child tokens
    /// and commit to the first one that passes its health check.
    ///
    /// On commit every other candidate's token is cancelled and each loser is
    /// stopped and deregistered before this returns; exactly one winner is
    /// ever selected. The winner then gets a model-generated title. When all
    /// candidates fail, the last failure is returned.
    pub async fn new_concurrent_execution(
        self: &Arc<Self>,
        parent: &CancellationToken,
        prompt: &str,
    ) -> Result<String, RuntimeError> {
        let candidates = self.candidates.max(1);
        let started: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tokens = Vec::with_capacity(candidates);
        let mut races: JoinSet<Result<(usize, String), RuntimeError>> = JoinSet::new();

        for index in 0..candidates {
            let token = parent.child_token();
            tokens.push(token.clone());
            let supervisor = self.clone();
            let prompt = prompt.to_string();
            let started = started.clone();
            races.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => Err(RuntimeError::Cancelled),
                    result = run_candidate(supervisor, token.clone(), prompt, started) => {
                        result.map(|id| (index, id))
                    }
                }
            });
        }

        let mut winner: Option<(usize, String)> = None;
        let mut last_error = "no candidates started".to_string();
        while let Some(joined) = races.join_next().await {
            match joined {
                Ok(Ok(won)) => {
                    winner = Some(won);
                    break;
                }
                Ok(Err(e)) => {
                    if !e.is_cancellation() {
                        warn!("speculative candidate failed: {e}");
                        last_error = e.to_string();
                    }
                }
                Err(e) => {
                    warn!("speculative candidate task died: {e}");
                    last_error = e.to_string();
                }
            }
        }

        let Some((winner_index, winner)) = winner else {
            return Err(RuntimeError::AllCandidatesFailed(last_error));
        };
        info!(runtime = %winner, "speculative launch committed to winner");

        // The winner's attempt token is a child of its candidate token, so
        // only the losing candidates are cancelled.
        for (index, token) in tokens.iter().enumerate() {
            if index != winner_index {
                token.cancel();
            }
        }
        while races.join_next().await.is_some() {}

        let losers: Vec<String> = started
            .lock()
            .iter()
            .filter(|id| **id != winner)
            .cloned()
            .collect();
        let mut stops = JoinSet::new();
        for loser in losers {
            let supervisor = self.clone();
            stops.spawn(async move {
                if let Err(e) = supervisor.stop(&loser).await {
                    warn!(runtime = %loser, "failed to stop losing candidate: {e}");
                }
                supervisor.routes.deregister(&loser).await;
            });
        }
        while stops.join_next().await.is_some() {}

        let title = self.model.complete(&title_prompt(prompt)).await?;
        let title = title.trim().to_string();
        self.registry.update(&winner, |r| r.title = title);
        self.persist(&winner).await;
        Ok(winner)
    }

    /// Poll the registry until the runtime passes its health check or lands
    /// in an error or failed state.
    pub(crate) async fn wait_for_passed_health_check(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> Result<(), RuntimeError> {
        let mut ticker = tokio::time::interval(self.timings.health_poll);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                _ = ticker.tick() => {
                    let runtime = self
                        .registry
                        .load(id)
                        .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
                    if runtime.passed_health_check {
                        return Ok(());
                    }
                    if matches!(runtime.state, RuntimeState::Error | RuntimeState::Failed) {
                        return Err(RuntimeError::CandidateError(id.to_string()));
                    }
                }
            }
        }
    }
}

async fn run_candidate(
    supervisor: Arc<Supervisor>,
    token: CancellationToken,
    prompt: String,
    started: Arc<Mutex<Vec<String>>>,
) -> Result<String, RuntimeError> {
    let id = supervisor.new_execution(&token, &prompt).await?;
    started.lock().push(id.clone());
    supervisor.wait_for_passed_health_check(&token, &id).await?;
    Ok(id)
}
