//! Streaming pipeline for chat turns.
//!
//! Each request gets a worker task running the tool-call loop and a
//! heartbeat task keeping the transport alive. Events flow through a
//! bounded channel to the consumer. The pipeline guarantees exactly one
//! terminal event (`final` or `error`) per request: a shared flag suppresses
//! double emission, and a supervisor emits a fallback error if the worker
//! dies without producing one. Full tool outputs never ride the stream;
//! they go to the out-of-band store and the terminal event carries the
//! request id to fetch them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::bridge::ToolBridge;
use crate::chat::{run_chat, ChatObserver, ChatTurn, ToolCallSummary};
use crate::llm::{ModelClient, UsageSummary};
use crate::metrics::{self, SharedMetrics};
use crate::outbox::ToolOutputStore;

pub const EVENT_BUFFER: usize = 64;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

/// Server-to-client stream event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        phase: String,
        message: String,
    },
    Token {
        text: String,
    },
    Final {
        response: String,
        request_id: Option<String>,
        tool_calls: Vec<ToolCallSummary>,
        tool_time_secs: f64,
        usage: UsageSummary,
    },
    Error {
        status: String,
        detail: String,
    },
    Ping {
        ts: i64,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Final { .. } | StreamEvent::Error { .. })
    }
}

/// Shared producer handle. Terminal emission is first-wins: once `final`
/// or `error` has been sent, later terminal attempts are dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    terminal_sent: Arc<AtomicBool>,
}

impl EventSink {
    fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            terminal_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    /// Send a non-terminal event. Returns false if the consumer is gone.
    async fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub async fn status(&self, phase: &str, message: &str) -> bool {
        self.send(StreamEvent::Status {
            phase: phase.to_string(),
            message: message.to_string(),
        })
        .await
    }

    pub async fn token(&self, text: &str) -> bool {
        self.send(StreamEvent::Token {
            text: text.to_string(),
        })
        .await
    }

    pub async fn ping(&self) -> bool {
        self.send(StreamEvent::Ping {
            ts: chrono::Utc::now().timestamp(),
        })
        .await
    }

    /// Attempt to emit a terminal event; returns true if this call won.
    async fn terminal(&self, event: StreamEvent) -> bool {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(event).await;
        true
    }

    pub async fn finish(
        &self,
        response: String,
        request_id: Option<String>,
        tool_calls: Vec<ToolCallSummary>,
        tool_time_secs: f64,
        usage: UsageSummary,
    ) -> bool {
        self.terminal(StreamEvent::Final {
            response,
            request_id,
            tool_calls,
            tool_time_secs,
            usage,
        })
        .await
    }

    pub async fn fail(&self, status: &str, detail: &str) -> bool {
        self.terminal(StreamEvent::Error {
            status: status.to_string(),
            detail: detail.to_string(),
        })
        .await
    }
}

#[async_trait]
impl ChatObserver for EventSink {
    async fn on_phase(&self, phase: &str, message: &str) {
        self.status(phase, message).await;
    }
}

/// Consumer side of one streaming request.
pub struct ChatStream {
    events: mpsc::Receiver<StreamEvent>,
    job: AbortHandle,
    worker: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl ChatStream {
    /// Next event, or `None` once the stream is fully drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Client disconnect: abort both tasks and await them.
    pub async fn cancel(self) {
        self.job.abort();
        self.heartbeat.abort();
        let _ = self.worker.await;
        let _ = self.heartbeat.await;
    }
}

/// Spawns the worker and heartbeat tasks for one chat turn.
pub struct ChatPipeline {
    model: Arc<dyn ModelClient>,
    outbox: Arc<ToolOutputStore>,
    deadline: Duration,
    metrics: SharedMetrics,
}

impl ChatPipeline {
    pub fn new(model: Arc<dyn ModelClient>, outbox: Arc<ToolOutputStore>) -> Self {
        Self {
            model,
            outbox,
            deadline: DEFAULT_DEADLINE,
            metrics: metrics::shared(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Report tool-call counters to an externally owned handle.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn spawn(&self, bridge: Arc<dyn ToolBridge>, turn: ChatTurn) -> ChatStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sink = EventSink::new(tx);

        let model = Arc::clone(&self.model);
        let outbox = Arc::clone(&self.outbox);
        let deadline = self.deadline;
        let turn_metrics = self.metrics.clone();
        let job_sink = sink.clone();
        let job = tokio::spawn(async move {
            run_turn(model, bridge, outbox, turn, deadline, turn_metrics, job_sink).await;
        });
        let job_abort = job.abort_handle();

        let heartbeat_sink = sink.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_sink.terminal_sent() {
                    break;
                }
                if !heartbeat_sink.ping().await {
                    break;
                }
            }
        });
        let heartbeat_abort = heartbeat.abort_handle();

        // Supervisor: a worker that panics or is aborted must still leave
        // the client with a terminal event (unless cancellation won). Stops
        // the heartbeat once the turn is over so the channel closes.
        let supervisor_sink = sink;
        let worker = tokio::spawn(async move {
            match job.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!("chat worker panicked");
                    supervisor_sink
                        .fail("error", "internal error while processing the request")
                        .await;
                }
                Err(_) => {}
            }
            heartbeat_abort.abort();
        });

        ChatStream {
            events: rx,
            job: job_abort,
            worker,
            heartbeat,
        }
    }
}

async fn run_turn(
    model: Arc<dyn ModelClient>,
    bridge: Arc<dyn ToolBridge>,
    outbox: Arc<ToolOutputStore>,
    turn: ChatTurn,
    deadline: Duration,
    metrics: SharedMetrics,
    sink: EventSink,
) {
    let model_name = turn.model.clone();
    let result = tokio::time::timeout(
        deadline,
        run_chat(model.as_ref(), bridge.as_ref(), turn, &sink),
    )
    .await;

    match result {
        Err(_) => {
            warn!(deadline_secs = deadline.as_secs(), "chat turn hit deadline");
            sink.fail(
                "timeout",
                &format!("request exceeded the {}s deadline", deadline.as_secs()),
            )
            .await;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "chat turn failed");
            sink.fail("error", &e.to_string()).await;
        }
        Ok(Ok(outcome)) => {
            {
                let mut m = metrics::lock(&metrics);
                for record in &outcome.tool_calls {
                    m.record_tool_call(record.error);
                }
            }
            let request_id = if outcome.tool_calls.is_empty() {
                None
            } else {
                Some(outbox.insert(outcome.tool_calls.clone()).await)
            };
            let summaries: Vec<ToolCallSummary> =
                outcome.tool_calls.iter().map(|r| r.summary()).collect();

            info!(
                tools = summaries.len(),
                tool_time_secs = outcome.tool_time_secs,
                "chat turn complete"
            );
            sink.token(&outcome.response_text).await;
            sink.finish(
                outcome.response_text,
                request_id,
                summaries,
                outcome.tool_time_secs,
                outcome.usage.summary(&model_name),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::{ScriptedBridge, ScriptedModel};
    use crate::llm::{LlmError, ModelRequest, ModelResponse};

    fn turn() -> ChatTurn {
        ChatTurn::new("how is spend?", "claude-sonnet-4-5-20250929")
    }

    /// Drain a stream to completion, returning all events.
    async fn drain(mut stream: ChatStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }
        events
    }

    fn terminal_count(events: &[StreamEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_success_emits_single_final_with_outbox_id() {
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_use_response("query_costs", serde_json::json!({"period": "7d"})),
            ScriptedModel::text_response("Spend is up 12%."),
        ]));
        let outbox = ToolOutputStore::new();
        let pipeline = ChatPipeline::new(model, Arc::clone(&outbox));

        let stream = pipeline.spawn(Arc::new(ScriptedBridge::new()), turn());
        let events = drain(stream).await;

        assert_eq!(terminal_count(&events), 1);
        let last = events.last().unwrap();
        match last {
            StreamEvent::Final {
                response,
                request_id,
                tool_calls,
                ..
            } => {
                assert_eq!(response, "Spend is up 12%.");
                assert_eq!(tool_calls.len(), 1);
                // Full output lives in the store, not on the stream.
                let id = request_id.clone().unwrap();
                let records = outbox.fetch(&id).await.unwrap();
                assert_eq!(records[0].output, "query_costs output");
            }
            other => panic!("expected final, got {other:?}"),
        }

        // Phase progress arrived before the terminal event.
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Status { phase, .. } if phase == "tool_call")));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Token { .. })));
    }

    #[tokio::test]
    async fn test_turn_without_tools_has_no_request_id() {
        let model: Arc<dyn ModelClient> =
            Arc::new(ScriptedModel::new(vec![ScriptedModel::text_response("Hi.")]));
        let outbox = ToolOutputStore::new();
        let pipeline = ChatPipeline::new(model, Arc::clone(&outbox));

        let events = drain(pipeline.spawn(Arc::new(ScriptedBridge::new()), turn())).await;
        match events.last().unwrap() {
            StreamEvent::Final { request_id, .. } => assert!(request_id.is_none()),
            other => panic!("expected final, got {other:?}"),
        }
        assert_eq!(outbox.len().await, 0);
    }

    #[tokio::test]
    async fn test_model_failure_emits_single_error() {
        // Empty script: the first completion fails.
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(vec![]));
        let pipeline = ChatPipeline::new(model, ToolOutputStore::new());

        let events = drain(pipeline.spawn(Arc::new(ScriptedBridge::new()), turn())).await;
        assert_eq!(terminal_count(&events), 1);
        match events.last().unwrap() {
            StreamEvent::Error { status, .. } => assert_eq!(status, "error"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_is_a_distinct_timeout() {
        struct StallingModel;

        #[async_trait]
        impl ModelClient for StallingModel {
            async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, LlmError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let pipeline = ChatPipeline::new(Arc::new(StallingModel), ToolOutputStore::new())
            .with_deadline(Duration::from_millis(50));

        let events = drain(pipeline.spawn(Arc::new(ScriptedBridge::new()), turn())).await;
        assert_eq!(terminal_count(&events), 1);
        match events.last().unwrap() {
            StreamEvent::Error { status, .. } => assert_eq!(status, "timeout"),
            other => panic!("expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_panic_still_yields_terminal_event() {
        struct PanickingModel;

        #[async_trait]
        impl ModelClient for PanickingModel {
            async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, LlmError> {
                panic!("boom");
            }
        }

        let pipeline = ChatPipeline::new(Arc::new(PanickingModel), ToolOutputStore::new());
        let events = drain(pipeline.spawn(Arc::new(ScriptedBridge::new()), turn())).await;

        assert_eq!(terminal_count(&events), 1);
        match events.last().unwrap() {
            StreamEvent::Error { status, detail } => {
                assert_eq!(status, "error");
                assert!(detail.contains("internal error"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_error_still_ends_in_final() {
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_use_response("query_costs", serde_json::json!({})),
            ScriptedModel::text_response("Could not fetch costs."),
        ]));
        let pipeline = ChatPipeline::new(model, ToolOutputStore::new());

        let events = drain(pipeline.spawn(
            Arc::new(ScriptedBridge::failing(&["query_costs"])),
            turn(),
        ))
        .await;

        assert_eq!(terminal_count(&events), 1);
        match events.last().unwrap() {
            StreamEvent::Final { tool_calls, .. } => {
                assert!(tool_calls[0].error);
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_call_counters_reach_shared_metrics() {
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_use_response("query_costs", serde_json::json!({})),
            ScriptedModel::tool_use_response("detect_anomalies", serde_json::json!({})),
            ScriptedModel::text_response("done"),
        ]));
        let shared = crate::metrics::shared();
        let pipeline = ChatPipeline::new(model, ToolOutputStore::new())
            .with_metrics(shared.clone());

        drain(pipeline.spawn(
            Arc::new(ScriptedBridge::failing(&["detect_anomalies"])),
            turn(),
        ))
        .await;

        let m = crate::metrics::lock(&shared);
        assert_eq!(m.tool_calls_total, 2);
        assert_eq!(m.tool_calls_failed, 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_awaits_tasks() {
        struct StallingModel;

        #[async_trait]
        impl ModelClient for StallingModel {
            async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, LlmError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let pipeline = ChatPipeline::new(Arc::new(StallingModel), ToolOutputStore::new());
        let mut stream = pipeline.spawn(Arc::new(ScriptedBridge::new()), turn());

        // Let the worker start and emit its first status.
        let first = stream.next_event().await.unwrap();
        assert!(matches!(first, StreamEvent::Status { .. }));

        // Returns only after both tasks have fully stopped.
        stream.cancel().await;
    }
}
