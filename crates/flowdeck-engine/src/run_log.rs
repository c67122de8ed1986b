use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowdeck_core::types::ExecutionEvent;

/// JSONL execution logger.
///
/// Consumes execution events and writes one JSON object per line. The file
/// is append-only and flushed per entry, so a crash loses at most the line
/// being written.
pub struct ExecutionLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    event_type: &'static str,
    execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl ExecutionLogger {
    /// Logs go to `{log_dir}/{YYYYmmdd_HHMMSS}.jsonl`.
    /// `level`: 1 = scenario/agent summary, 2 = + branches and joins,
    /// 3 = + every step.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events from `rx` until cancellation or until the bus closes.
    ///
    /// Takes an already-subscribed receiver so no event published after the
    /// caller subscribed is missed.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<ExecutionEvent>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "ExecutionLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ExecutionLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "ExecutionLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, ExecutionLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "ExecutionLogger finished");
    }

    /// Convert an event to a log entry (`None` if filtered by level).
    fn event_to_entry(&self, event: &ExecutionEvent) -> Option<LogEntry> {
        let (event_type, execution_id, detail) = match event {
            // L1: run summary
            ExecutionEvent::ScenarioStarted {
                execution_id,
                scenario_id,
                version_id,
            } => (
                "scenario_started",
                execution_id,
                Some(serde_json::json!({
                    "scenario_id": scenario_id,
                    "version_id": version_id,
                })),
            ),
            ExecutionEvent::ScenarioFinished {
                execution_id,
                status,
                duration_ms,
                error,
            } => (
                "scenario_finished",
                execution_id,
                Some(serde_json::json!({
                    "status": status.as_str(),
                    "duration_ms": duration_ms,
                    "error": error,
                })),
            ),
            ExecutionEvent::AgentStarted {
                execution_id,
                version_id,
                scenario_execution_id,
            } => (
                "agent_started",
                execution_id,
                Some(serde_json::json!({
                    "version_id": version_id,
                    "scenario_execution_id": scenario_execution_id,
                })),
            ),
            ExecutionEvent::AgentFinished {
                execution_id,
                status,
                duration_ms,
                error,
            } => (
                "agent_finished",
                execution_id,
                Some(serde_json::json!({
                    "status": status.as_str(),
                    "duration_ms": duration_ms,
                    "error": error,
                })),
            ),

            // L2: routing
            ExecutionEvent::BranchSelected {
                scenario_execution_id,
                node_id,
                branch_index,
                label,
            } if self.level >= 2 => (
                "branch_selected",
                scenario_execution_id,
                Some(serde_json::json!({
                    "node_id": node_id,
                    "branch_index": branch_index,
                    "label": label,
                })),
            ),
            ExecutionEvent::ParallelJoined {
                scenario_execution_id,
                node_id,
                succeeded,
                failed,
            } if self.level >= 2 => (
                "parallel_joined",
                scenario_execution_id,
                Some(serde_json::json!({
                    "node_id": node_id,
                    "succeeded": succeeded,
                    "failed": failed,
                })),
            ),
            ExecutionEvent::RecoveryVersionCreated {
                definition_id,
                version_id,
            } if self.level >= 2 => (
                "recovery_version_created",
                version_id,
                Some(serde_json::json!({ "definition_id": definition_id })),
            ),

            // L3: per-step
            ExecutionEvent::StepStarted {
                agent_execution_id,
                step_index,
                node_id,
                node_type,
            } if self.level >= 3 => (
                "step_started",
                agent_execution_id,
                Some(serde_json::json!({
                    "step_index": step_index,
                    "node_id": node_id,
                    "node_type": node_type,
                })),
            ),
            ExecutionEvent::StepFinished {
                agent_execution_id,
                step_index,
                node_id,
                status,
                duration_ms,
                error,
            } if self.level >= 3 => (
                "step_finished",
                agent_execution_id,
                Some(serde_json::json!({
                    "step_index": step_index,
                    "node_id": node_id,
                    "status": status.as_str(),
                    "duration_ms": duration_ms,
                    "error": error.as_deref().map(|e| truncate_str(e, 500)),
                })),
            ),

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            execution_id: execution_id.clone(),
            detail,
        })
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
