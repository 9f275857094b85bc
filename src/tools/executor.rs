//! Concurrent batch tool execution.
//!
//! `execute_tool_calls` runs a batch of tool calls with bounded parallelism,
//! per-tool timeout, panic isolation, and cooperative cancellation. Results
//! come back in input order: output index `i` always answers call `i`.
//!
//! Workers write to their own pre-allocated slot; a completion channel is
//! used only for progress reporting, never for result collection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
#[cfg(test)]
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::providers::LLMToolCall;
use crate::session::Message;
use crate::utils::truncate;

use super::registry::ToolRegistry;

/// Progress callback: `(completed, total, original_index, call, result)`.
/// Invoked in completion order, which is not input order.
pub type ToolCompleteFn = Arc<dyn Fn(usize, usize, usize, &LLMToolCall, &Message) + Send + Sync>;

/// Options for a batch execution.
#[derive(Clone)]
pub struct ExecuteToolCallsOptions {
    /// Origin channel injected into tool args.
    pub channel: String,
    /// Origin chat id injected into tool args.
    pub chat_id: String,
    /// Trace id injected into tool args and logs.
    pub trace_id: String,
    /// Per-tool timeout. Zero = none.
    pub timeout: Duration,
    /// Max concurrent executions. 0 = one worker per call.
    pub max_parallel: usize,
    /// Component name used in log events.
    pub log_component: String,
    /// Iteration number for correlation.
    pub iteration: u32,
    /// Optional per-completion callback.
    pub on_tool_complete: Option<ToolCompleteFn>,
}

impl Default for ExecuteToolCallsOptions {
    fn default() -> Self {
        Self {
            channel: String::new(),
            chat_id: String::new(),
            trace_id: String::new(),
            timeout: Duration::ZERO,
            max_parallel: 0,
            log_component: "tool".to_string(),
            iteration: 0,
            on_tool_complete: None,
        }
    }
}

impl ToolRegistry {
    /// Execute a batch of tool calls concurrently.
    ///
    /// Returns one tool-result message per call, in input order. Errors,
    /// timeouts, panics and cancellation all surface as `Error: ...` result
    /// text with the original `tool_call_id`; the batch itself never fails.
    pub async fn execute_tool_calls(
        self: &Arc<Self>,
        cancel: CancellationToken,
        tool_calls: &[LLMToolCall],
        opts: ExecuteToolCallsOptions,
    ) -> Vec<Message> {
        let n = tool_calls.len();
        if n == 0 {
            return Vec::new();
        }

        let component = if opts.log_component.is_empty() {
            "tool".to_string()
        } else {
            opts.log_component.clone()
        };

        let parallel_limit = if opts.max_parallel == 0 {
            n
        } else {
            opts.max_parallel.min(n)
        };

        let sem = Arc::new(Semaphore::new(parallel_limit));
        let (done_tx, mut done_rx) = mpsc::channel::<(usize, Message)>(n);

        for (idx, call) in tool_calls.iter().enumerate() {
            let call = call.clone();
            let registry = Arc::clone(self);
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            let done_tx = done_tx.clone();
            let component = component.clone();
            let opts = opts.clone();

            tokio::spawn(async move {
                let message = run_one(registry, sem, cancel, &call, &component, &opts).await;
                // Receiver outlives all workers; a send failure means the
                // batch was abandoned and there is nothing left to do.
                let _ = done_tx.send((idx, message)).await;
            });
        }
        drop(done_tx);

        // Drain completion signals in arrival order for progress reporting;
        // results land in their input-order slots.
        let mut results: Vec<Option<Message>> = (0..n).map(|_| None).collect();
        let mut completed = 0;
        while completed < n {
            let Some((idx, message)) = done_rx.recv().await else {
                break;
            };
            completed += 1;
            if let Some(callback) = &opts.on_tool_complete {
                callback(completed, n, idx, &tool_calls[idx], &message);
            }
            results[idx] = Some(message);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    Message::tool_result(&tool_calls[i].id, "Error: tool worker exited unexpectedly")
                })
            })
            .collect()
    }
}

async fn run_one(
    registry: Arc<ToolRegistry>,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
    call: &LLMToolCall,
    component: &str,
    opts: &ExecuteToolCallsOptions,
) -> Message {
    // Semaphore acquisition races against cancellation; an already-cancelled
    // context must win even when a slot is free.
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Message::tool_result(&call.id, "Error: context cancelled");
        }
        permit = sem.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                return Message::tool_result(&call.id, "Error: executor semaphore closed");
            }
        },
    };

    let args_preview = truncate(&call.arguments_json(), 200);
    info!(
        component = component,
        tool = %call.name,
        iteration = opts.iteration,
        trace_id = %opts.trace_id,
        args = %args_preview,
        "tool call"
    );

    let tool_cancel = cancel.child_token();
    let exec = registry.execute_with_context(
        tool_cancel.clone(),
        &call.name,
        call.arguments_value(),
        &opts.channel,
        &opts.chat_id,
        &opts.trace_id,
    );
    let guarded = AssertUnwindSafe(exec).catch_unwind();

    let outcome = if opts.timeout.is_zero() {
        guarded.await
    } else {
        tokio::select! {
            outcome = guarded => outcome,
            _ = tokio::time::sleep(opts.timeout) => {
                tool_cancel.cancel();
                return Message::tool_result(
                    &call.id,
                    &format!("Error: tool {} timed out after {:?}", call.name, opts.timeout),
                );
            }
        }
    };

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => format!("Error: {}", e),
        Err(panic) => {
            let reason = panic_message(panic);
            error!(
                component = component,
                tool = %call.name,
                iteration = opts.iteration,
                panic = %reason,
                "recovered panic in tool execution"
            );
            format!("Error: tool {} panicked: {}", call.name, reason)
        }
    };

    Message::tool_result(&call.id, &result)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct SleepTool {
        name: String,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl SleepTool {
        fn new(name: &str, delay: Duration) -> Self {
            Self {
                name: name.to_string(),
                delay,
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_counters(
            name: &str,
            delay: Duration,
            in_flight: Arc<AtomicUsize>,
            max_in_flight: Arc<AtomicUsize>,
        ) -> Self {
            Self {
                name: name.to_string(),
                delay,
                in_flight,
                max_in_flight,
            }
        }
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "sleeps then answers"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, cancel: CancellationToken, _args: Value) -> Result<String> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            let out = tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(format!("{} done", self.name)),
                _ = cancel.cancelled() => Err(crate::error::YoctoError::Cancelled("tool".into())),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _cancel: CancellationToken, _args: Value) -> Result<String> {
            panic!("kaboom");
        }
    }

    fn calls(names: &[(&str, &str)]) -> Vec<LLMToolCall> {
        names
            .iter()
            .map(|(id, name)| LLMToolCall::new(id, name, "{}"))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let registry = Arc::new(ToolRegistry::new());
        let results = registry
            .execute_tool_calls(CancellationToken::new(), &[], ExecuteToolCallsOptions::default())
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let registry = Arc::new(ToolRegistry::new());
        // slow finishes last but must stay at index 0.
        registry.register(Arc::new(SleepTool::new("slow", Duration::from_millis(80))));
        registry.register(Arc::new(SleepTool::new("fast", Duration::from_millis(5))));

        let batch = calls(&[("tc1", "slow"), ("tc2", "fast"), ("tc3", "fast")]);
        let results = registry
            .execute_tool_calls(
                CancellationToken::new(),
                &batch,
                ExecuteToolCallsOptions::default(),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("tc1"));
        assert_eq!(results[1].tool_call_id.as_deref(), Some("tc2"));
        assert_eq!(results[2].tool_call_id.as_deref(), Some("tc3"));
        assert_eq!(results[0].content, "slow done");
    }

    #[tokio::test]
    async fn test_parallel_execution_is_concurrent() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SleepTool::new("s", Duration::from_millis(100))));

        let batch = calls(&[("tc1", "s"), ("tc2", "s"), ("tc3", "s")]);
        let start = Instant::now();
        let results = registry
            .execute_tool_calls(
                CancellationToken::new(),
                &batch,
                ExecuteToolCallsOptions::default(),
            )
            .await;
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 3);
        // Three 100ms tools in parallel must finish well under 280ms.
        assert!(elapsed < Duration::from_millis(280), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_in_flight() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SleepTool::with_counters(
            "s",
            Duration::from_millis(30),
            Arc::clone(&in_flight),
            Arc::clone(&max_seen),
        )));

        let batch = calls(&[("a", "s"), ("b", "s"), ("c", "s"), ("d", "s"), ("e", "s"), ("f", "s")]);
        let opts = ExecuteToolCallsOptions {
            max_parallel: 2,
            ..Default::default()
        };
        registry
            .execute_tool_calls(CancellationToken::new(), &batch, opts)
            .await;

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let registry = Arc::new(ToolRegistry::new());
        let batch = calls(&[("tc1", "missing")]);
        let results = registry
            .execute_tool_calls(
                CancellationToken::new(),
                &batch,
                ExecuteToolCallsOptions::default(),
            )
            .await;

        assert_eq!(results[0].tool_call_id.as_deref(), Some("tc1"));
        assert!(results[0].content.starts_with("Error: "));
        assert!(results[0].content.contains("tool not found"));
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(PanicTool));
        registry.register(Arc::new(SleepTool::new("ok", Duration::from_millis(5))));

        let batch = calls(&[("tc1", "boom"), ("tc2", "ok")]);
        let results = registry
            .execute_tool_calls(
                CancellationToken::new(),
                &batch,
                ExecuteToolCallsOptions::default(),
            )
            .await;

        assert!(results[0].content.contains("Error: tool boom panicked: kaboom"));
        assert_eq!(results[1].content, "ok done");
    }

    #[tokio::test]
    async fn test_panic_releases_semaphore_slot() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(PanicTool));
        registry.register(Arc::new(SleepTool::new("ok", Duration::from_millis(5))));

        // With max_parallel=1, the panicking tool must release its slot or
        // the second call would deadlock the batch.
        let batch = calls(&[("tc1", "boom"), ("tc2", "ok")]);
        let opts = ExecuteToolCallsOptions {
            max_parallel: 1,
            ..Default::default()
        };
        let results = tokio::time::timeout(
            Duration::from_secs(2),
            registry.execute_tool_calls(CancellationToken::new(), &batch, opts),
        )
        .await
        .expect("batch must not deadlock");

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].content, "ok done");
    }

    #[tokio::test]
    async fn test_timeout_produces_error_result() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SleepTool::new("slow", Duration::from_secs(10))));

        let batch = calls(&[("tc1", "slow")]);
        let opts = ExecuteToolCallsOptions {
            timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let results = registry
            .execute_tool_calls(CancellationToken::new(), &batch, opts)
            .await;

        assert!(results[0].content.contains("Error: tool slow timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_acquisition() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SleepTool::new("s", Duration::from_millis(5))));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = calls(&[("tc1", "s"), ("tc2", "s")]);
        let results = registry
            .execute_tool_calls(cancel, &batch, ExecuteToolCallsOptions::default())
            .await;

        assert_eq!(results.len(), 2);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.tool_call_id.as_deref(), Some(batch[i].id.as_str()));
            assert!(r.content.contains("Error: context cancelled"), "{}", r.content);
        }
    }

    #[tokio::test]
    async fn test_progress_callback_completion_order() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SleepTool::new("slow", Duration::from_millis(80))));
        registry.register(Arc::new(SleepTool::new("fast", Duration::from_millis(5))));

        let seen: Arc<std::sync::Mutex<Vec<(usize, usize, usize)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);

        let batch = calls(&[("tc1", "slow"), ("tc2", "fast")]);
        let opts = ExecuteToolCallsOptions {
            on_tool_complete: Some(Arc::new(move |completed, total, index, _call, _result| {
                seen_cb.lock().unwrap().push((completed, total, index));
            })),
            ..Default::default()
        };
        registry
            .execute_tool_calls(CancellationToken::new(), &batch, opts)
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        // fast (index 1) completes first; completed counts monotonically.
        assert_eq!(seen[0], (1, 2, 1));
        assert_eq!(seen[1], (2, 2, 0));
    }
}
