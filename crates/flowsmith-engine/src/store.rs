use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use flowsmith_core::error::{FlowError, Result};
use flowsmith_core::types::{RunId, RunState, RunStatus};

use crate::graph::WorkflowGraph;

/// A persisted run together with the graph it executes.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub state: RunState,
    pub graph: WorkflowGraph,
}

/// One row of `RunStore::list`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub graph_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Run snapshots backed by SQLite.
///
/// The engine writes a row whenever a run suspends on a decision or reaches a
/// terminal status, which is enough to resume a waiting run after a restart.
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open or create the run database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| FlowError::Database(format!("Failed to open run store: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FlowError::Database(format!("Failed to open run store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 graph_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 graph_json TEXT NOT NULL,
                 last_sequence INTEGER NOT NULL DEFAULT 0,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);",
        )
        .map_err(|e| FlowError::Database(format!("Failed to initialize run schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Insert or replace the snapshot for a run.
    ///
    /// A snapshot whose log is shorter than the stored one is stale and is
    /// dropped; returns whether the row was written.
    pub fn save(&self, state: &RunState, graph: &WorkflowGraph) -> Result<bool> {
        let state_json = serde_json::to_string(state)?;
        let graph_json = serde_json::to_string(graph)?;
        let last_sequence = state.log.last().map(|e| e.sequence).unwrap_or(0) as i64;
        let written = self
            .conn()?
            .execute(
                "INSERT INTO runs (run_id, graph_id, status, state_json, graph_json, last_sequence, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id) DO UPDATE SET
                     graph_id = excluded.graph_id,
                     status = excluded.status,
                     state_json = excluded.state_json,
                     graph_json = excluded.graph_json,
                     last_sequence = excluded.last_sequence,
                     updated_at = excluded.updated_at
                 WHERE excluded.last_sequence >= runs.last_sequence",
                params![
                    state.run_id.as_str(),
                    state.graph_id,
                    state.status.to_string(),
                    state_json,
                    graph_json,
                    last_sequence,
                    state.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| FlowError::Database(format!("Failed to save run: {}", e)))?;
        Ok(written > 0)
    }

    pub fn load(&self, run_id: &RunId) -> Result<Option<StoredRun>> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT state_json, graph_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| FlowError::Database(format!("Failed to load run: {}", e)))?;

        match row {
            Some((state_json, graph_json)) => Ok(Some(StoredRun {
                state: serde_json::from_str(&state_json)?,
                graph: serde_json::from_str(&graph_json)?,
            })),
            None => Ok(None),
        }
    }

    /// All runs, most recently updated first.
    pub fn list(&self) -> Result<Vec<RunSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, graph_id, status, updated_at FROM runs ORDER BY updated_at DESC",
            )
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| {
                let ts: String = row.get(3)?;
                Ok(RunSummary {
                    run_id: row.get(0)?,
                    graph_id: row.get(1)?,
                    status: row.get(2)?,
                    updated_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| FlowError::Database(format!("Failed to list runs: {}", e)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FlowError::Database(format!("Failed to read run row: {}", e)))
    }

    /// Every run persisted while waiting on a decision.
    pub fn list_waiting(&self) -> Result<Vec<StoredRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state_json, graph_json FROM runs WHERE status = ?1 ORDER BY updated_at")
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![RunStatus::WaitingOnDecision.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| FlowError::Database(format!("Failed to list waiting runs: {}", e)))?;

        let mut runs = Vec::new();
        for row in rows {
            let (state_json, graph_json) =
                row.map_err(|e| FlowError::Database(format!("Failed to read run row: {}", e)))?;
            runs.push(StoredRun {
                state: serde_json::from_str(&state_json)?,
                graph: serde_json::from_str(&graph_json)?,
            });
        }
        Ok(runs)
    }

    pub fn delete(&self, run_id: &RunId) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.as_str()])
            .map_err(|e| FlowError::Database(format!("Failed to delete run: {}", e)))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flowsmith_core::event::EventBus;
    use flowsmith_core::types::{LogLevel, PendingDecision};

    use crate::graph::{Edge, Node};
    use crate::ledger::RunLedger;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new("g", "tiny")
            .with_node(Node::start("s"))
            .with_node(Node::end("e"))
            .with_edge(Edge::always("s", "e"))
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = RunStore::open_in_memory().unwrap();
        let mut state = RunState::new(RunId::from_string("r1"), "g", vec!["s".into(), "e".into()], "hi");
        store.save(&state, &graph()).unwrap();

        state.status = RunStatus::Completed;
        store.save(&state, &graph()).unwrap();

        let loaded = store.load(&RunId::from_string("r1")).unwrap().unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.graph.id, "g");
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.list().unwrap()[0].status, "completed");
        assert!(store.load(&RunId::from_string("nope")).unwrap().is_none());
    }

    #[test]
    fn test_stale_snapshot_does_not_overwrite_newer() {
        let store = RunStore::open_in_memory().unwrap();
        let ledger = RunLedger::new(
            RunState::new(RunId::from_string("r2"), "g", vec!["s".into(), "e".into()], ""),
            Arc::new(EventBus::default()),
        );

        ledger.log(None, LogLevel::Info, "waiting on decision");
        let mut parked = ledger.snapshot();
        parked.status = RunStatus::WaitingOnDecision;

        ledger.log(None, LogLevel::Info, "run completed");
        ledger.finish(RunStatus::Completed, None);
        let done = ledger.snapshot();

        assert!(store.save(&done, &graph()).unwrap());
        // The parked snapshot lands after the terminal one.
        assert!(!store.save(&parked, &graph()).unwrap());

        let loaded = store.load(&RunId::from_string("r2")).unwrap().unwrap();
        assert_eq!(loaded.state.status, RunStatus::Completed);
        assert!(store.list_waiting().unwrap().is_empty());
        assert_eq!(store.list().unwrap()[0].status, "completed");
    }

    #[test]
    fn test_list_waiting_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("nested").join("runs.db")).unwrap();

        let mut waiting = RunState::new(RunId::from_string("w"), "g", Vec::<String>::new(), "");
        waiting.status = RunStatus::WaitingOnDecision;
        waiting.pending_decision = Some(PendingDecision {
            node_id: "gate".into(),
            prompt: None,
            options: vec!["ok".into()],
        });
        let mut done = RunState::new(RunId::from_string("d"), "g", Vec::<String>::new(), "");
        done.status = RunStatus::Failed;

        store.save(&waiting, &graph()).unwrap();
        store.save(&done, &graph()).unwrap();

        let parked = store.list_waiting().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].state.run_id.as_str(), "w");

        assert!(store.delete(&RunId::from_string("w")).unwrap());
        assert!(!store.delete(&RunId::from_string("w")).unwrap());
        assert!(store.list_waiting().unwrap().is_empty());
    }
}
