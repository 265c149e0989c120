use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowsmith_core::types::{LogLevel, RunEvent, RunId};

/// JSONL run journal.
///
/// Consumes the event bus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. One journal follows a run across its
/// suspensions, so decisions and their resolutions land in the same file. A
/// run restored after a restart appends to the existing file.
pub struct RunJournal {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct JournalEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunJournal {
    /// `level`: 1 = run lifecycle, 2 = + node lifecycle and decisions, 3 = every log entry.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn path_for(log_dir: &Path, run_id: &RunId) -> PathBuf {
        log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write events for `run_id` until the run ends or `cancel` fires.
    ///
    /// Takes a receiver subscribed before the run was started so the first
    /// events are not missed.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create journal directory");
            return;
        }
        let path = Self::path_for(&self.log_dir, &run_id);

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open journal file");
                return;
            }
        };

        debug!(path = %path.display(), "RunJournal started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunJournal cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write journal entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush journal");
                                    }
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            info!(run_id = %run_id, skipped = n, "RunJournal lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunJournal stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %path.display(), "RunJournal finished");
    }

    /// Convert an event to a journal line, or None when filtered by level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<JournalEntry> {
        let entry = |event_type: &'static str,
                     node_id: Option<&str>,
                     detail: Option<serde_json::Value>| JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type,
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            // L1: run lifecycle
            RunEvent::RunStarted { graph_id, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "graph_id": graph_id })),
            )),
            RunEvent::RunStatusChanged {
                status, last_error, ..
            } => Some(entry(
                "run_status",
                None,
                Some(serde_json::json!({ "status": status, "last_error": last_error })),
            )),

            // L2: nodes and decisions
            RunEvent::NodeStatusChanged {
                node_id, status, ..
            } if self.level >= 2 => Some(entry(
                "node_status",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "status": status })),
            )),
            RunEvent::ArtifactsMerged { node_id, paths, .. } if self.level >= 2 => Some(entry(
                "artifacts",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "paths": paths })),
            )),
            RunEvent::DecisionRequested { decision, .. } if self.level >= 2 => Some(entry(
                "decision_requested",
                Some(decision.node_id.as_str()),
                Some(serde_json::json!({ "options": decision.options, "prompt": decision.prompt })),
            )),
            RunEvent::DecisionResolved {
                node_id, option, ..
            } if self.level >= 2 => Some(entry(
                "decision_resolved",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "option": option })),
            )),
            // Warnings and errors are node lifecycle too
            RunEvent::LogAppended { entry: log, .. }
                if self.level >= 3 || (self.level >= 2 && log.level >= LogLevel::Warn) =>
            {
                Some(entry(
                    "log",
                    log.node_id.as_deref(),
                    Some(serde_json::json!({
                        "sequence": log.sequence,
                        "level": log.level,
                        "message": log.message,
                        "attempt": log.attempt,
                    })),
                ))
            }

            _ => None,
        }
    }
}
