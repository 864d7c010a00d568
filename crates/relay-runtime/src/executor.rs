//! Pluggable run execution.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::ids::{RunId, SessionId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::RuntimeError;
use crate::events::EventEmitter;

/// Everything an executor gets for one run.
#[derive(Clone)]
pub struct RunContext {
    /// Run being executed.
    pub run_id: RunId,
    /// Session the run belongs to.
    pub session_id: SessionId,
    /// Session key at submission time.
    pub session_key: String,
    /// Caller-supplied input.
    pub input: Value,
    /// Fires when the run is aborted.
    pub cancel: CancellationToken,
    /// Emitter for progress events.
    pub events: Arc<EventEmitter>,
}

/// Executes the body of a run. The coordinator owns bookkeeping; the
/// executor only produces a result and should watch `cancel`.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Run to completion.
    async fn execute(&self, run: RunContext) -> Result<Value, RuntimeError>;
}

/// Executor that hands the input back as the result.
///
/// An input object with a numeric `delayMs` field sleeps that long first,
/// ending early with [`RuntimeError::Cancelled`] if the run is aborted.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl RunExecutor for EchoExecutor {
    async fn execute(&self, run: RunContext) -> Result<Value, RuntimeError> {
        let delay = run
            .input
            .get("delayMs")
            .and_then(Value::as_u64)
            .map(std::time::Duration::from_millis);
        if let Some(delay) = delay {
            tokio::select! {
                () = run.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        Ok(run.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn context(input: Value) -> RunContext {
        RunContext {
            run_id: RunId::from("r1"),
            session_id: SessionId::from("s1"),
            session_key: "main".into(),
            input,
            cancel: CancellationToken::new(),
            events: Arc::new(EventEmitter::new()),
        }
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let out = EchoExecutor.execute(context(json!({ "text": "hi" }))).await.unwrap();
        assert_eq!(out, json!({ "text": "hi" }));
    }

    #[tokio::test(start_paused = true)]
    async fn echo_delay_observes_cancel() {
        let run = context(json!({ "delayMs": 60_000 }));
        let cancel = run.cancel.clone();
        let task = tokio::spawn(async move { EchoExecutor.execute(run).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();
        assert_matches!(task.await.unwrap(), Err(RuntimeError::Cancelled));
    }
}
