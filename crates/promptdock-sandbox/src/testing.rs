//! Deterministic evaluator doubles for orchestrator tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Evaluator, EvaluatorFactory, LogBuffer, SandboxError};

/// What a scripted evaluation does once its lines are written.
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    /// Behave like a web server: park until the token cancels.
    ServeUntilCancelled,
    /// Return successfully.
    Complete,
    /// Fail with an evaluation error.
    Fail(String),
    /// Fail like an interpreter panic.
    Panic(String),
}

/// One scripted evaluation: wait, emit log lines, then follow the outcome.
#[derive(Clone, Debug)]
pub struct ScriptedBehavior {
    pub start_delay: Duration,
    pub lines: Vec<String>,
    pub outcome: ScriptedOutcome,
}

impl ScriptedBehavior {
    /// A healthy candidate that logs the beacon and then serves.
    pub fn serving(port: u16) -> Self {
        Self {
            start_delay: Duration::ZERO,
            lines: vec![format!("PORT={port}")],
            outcome: ScriptedOutcome::ServeUntilCancelled,
        }
    }

    /// A candidate that never logs a port.
    pub fn silent() -> Self {
        Self {
            start_delay: Duration::ZERO,
            lines: Vec::new(),
            outcome: ScriptedOutcome::ServeUntilCancelled,
        }
    }

    /// A candidate that fails immediately.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            start_delay: Duration::ZERO,
            lines: Vec::new(),
            outcome: ScriptedOutcome::Fail(message.into()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

pub struct ScriptedEvaluator {
    behavior: ScriptedBehavior,
    buffer: LogBuffer,
    invoked: Mutex<Vec<String>>,
    sources: Mutex<Vec<String>>,
}

impl ScriptedEvaluator {
    pub fn new(behavior: ScriptedBehavior, buffer: LogBuffer) -> Self {
        Self {
            behavior,
            buffer,
            invoked: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
        }
    }

    /// Symbols passed to [`Evaluator::invoke`], in order.
    pub fn invoked(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }

    /// Program sources this evaluator was asked to run.
    pub fn sources(&self) -> Vec<String> {
        self.sources.lock().clone()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, cancel: CancellationToken, source: &str) -> Result<(), SandboxError> {
        self.sources.lock().push(source.to_string());

        if !self.behavior.start_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.behavior.start_delay) => {}
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            }
        }
        for line in &self.behavior.lines {
            self.buffer.append(&format!("{line}\n"));
        }

        match &self.behavior.outcome {
            ScriptedOutcome::ServeUntilCancelled => {
                cancel.cancelled().await;
                Err(SandboxError::Cancelled)
            }
            ScriptedOutcome::Complete => Ok(()),
            ScriptedOutcome::Fail(message) => Err(SandboxError::Eval(message.clone())),
            ScriptedOutcome::Panic(message) => Err(SandboxError::Panicked(message.clone())),
        }
    }

    async fn invoke(&self, symbol: &str) -> Result<(), SandboxError> {
        self.invoked.lock().push(symbol.to_string());
        Ok(())
    }
}

/// Factory handing out scripted evaluators in sequence.
///
/// Each [`EvaluatorFactory::create`] pops the next queued behavior; once the
/// queue is empty the fallback behavior repeats. Created evaluators are kept
/// so tests can inspect their `invoke` history afterwards.
pub struct ScriptedFactory {
    queue: Mutex<VecDeque<ScriptedBehavior>>,
    fallback: ScriptedBehavior,
    created: Mutex<Vec<Arc<ScriptedEvaluator>>>,
}

impl ScriptedFactory {
    pub fn new(behaviors: Vec<ScriptedBehavior>, fallback: ScriptedBehavior) -> Self {
        Self {
            queue: Mutex::new(behaviors.into()),
            fallback,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(behavior: ScriptedBehavior) -> Self {
        Self::new(Vec::new(), behavior)
    }

    pub fn created(&self) -> Vec<Arc<ScriptedEvaluator>> {
        self.created.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl EvaluatorFactory for ScriptedFactory {
    fn create(&self) -> (Arc<dyn Evaluator>, LogBuffer) {
        let behavior = self
            .queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let buffer = LogBuffer::new();
        let evaluator = Arc::new(ScriptedEvaluator::new(behavior, buffer.clone()));
        self.created.lock().push(evaluator.clone());
        (evaluator, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_evaluator_emits_lines_then_serves() {
        let buffer = LogBuffer::new();
        let evaluator = ScriptedEvaluator::new(ScriptedBehavior::serving(9090), buffer.clone());
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { evaluator.evaluate(cancel, "package main").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(buffer.snapshot().contains("PORT=9090"));
        cancel.cancel();
        let result = task.await.expect("join");
        assert!(matches!(result, Err(SandboxError::Cancelled)));
    }

    #[tokio::test]
    async fn scripted_factory_pops_then_falls_back() {
        let factory = ScriptedFactory::new(
            vec![ScriptedBehavior::failing("first")],
            ScriptedBehavior::silent(),
        );
        let (first, _) = factory.create();
        let (second, _) = factory.create();
        let result = first
            .evaluate(CancellationToken::new(), "package main")
            .await;
        assert!(matches!(result, Err(SandboxError::Eval(_))));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = second.evaluate(cancel, "package main").await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));
        assert_eq!(factory.created_count(), 2);
    }
}
