use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::EventBus;
use weft_core::types::{CorrelationId, EngineEvent};

/// Append-only JSONL log of one run.
///
/// Writes one line per engine event of the run to
/// `{log_dir}/{correlation_id}/{timestamp}.jsonl`, flushing after each line
/// so a crash leaves every earlier transition on disk.
pub struct RunLogger {
    log_dir: PathBuf,
    include_outputs: bool,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    correlation_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cycle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            include_outputs: false,
        }
    }

    /// Also record emitted output snapshots.
    pub fn with_outputs(mut self, include: bool) -> Self {
        self.include_outputs = include;
        self
    }

    /// Subscribe now and log in the background, so no event published after
    /// this call is missed.
    pub fn spawn(
        self,
        bus: &EventBus,
        correlation_id: CorrelationId,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, correlation_id, cancel))
    }

    /// Write events for `correlation_id` until the run finishes, the bus
    /// closes, or `cancel` fires. Returns the log file path.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<EngineEvent>,
        correlation_id: CorrelationId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let run_dir = self.log_dir.join(&correlation_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return None;
            }
        };

        info!(path = %log_path.display(), "Run log started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run log cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        if event.correlation_id() != &correlation_id {
                            continue;
                        }
                        let entry = self.entry(&event);
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write run log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush run log");
                            }
                        }
                        if matches!(event, EngineEvent::RunFinished { .. }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Run log lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed, run log stopping");
                        break;
                    }
                },
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Run log finished");
        Some(log_path)
    }

    fn entry(&self, event: &EngineEvent) -> LogEntry {
        let timestamp = Utc::now().to_rfc3339();
        let correlation_id = event.correlation_id().0.clone();
        match event {
            EngineEvent::RunStarted { nodes, .. } => LogEntry {
                timestamp,
                correlation_id,
                event_type: "run_started",
                node_id: None,
                cycle: None,
                detail: Some(serde_json::json!({ "nodes": nodes })),
            },
            EngineEvent::NodeState { event, .. } => {
                let mut detail = serde_json::Map::new();
                detail.insert("state".into(), serde_json::json!(event.state));
                if let Some(error) = &event.error {
                    detail.insert("error".into(), serde_json::json!(error));
                }
                if self.include_outputs {
                    if let Some(output) = &event.output {
                        detail.insert("output".into(), serde_json::json!(output));
                    }
                }
                LogEntry {
                    timestamp: event.timestamp.to_rfc3339(),
                    correlation_id,
                    event_type: "node_state",
                    node_id: Some(event.node_id.clone()),
                    cycle: Some(event.cycle),
                    detail: Some(serde_json::Value::Object(detail)),
                }
            }
            EngineEvent::RunFinished { outcome, .. } => LogEntry {
                timestamp,
                correlation_id,
                event_type: "run_finished",
                node_id: None,
                cycle: None,
                detail: Some(serde_json::json!({ "outcome": outcome })),
            },
        }
    }
}
