//! Durable task scheduling: this module only persists task records — it
//! has no executor and advances no task through running/completed states
//! on its own. `record_task_run` exists so an out-of-process executor
//! can report back.
//!
//! Task identity has two modes. In dry-run mode the identity comes from
//! the task's own normalized content, so replaying the same schedule call
//! twice is naturally idempotent. In commit mode the caller supplies an
//! `idempotency_key` instead — content hashing a task meant to run
//! exactly once (e.g. "send this email") would make retries indistinguishable
//! from duplicates, which is exactly the failure mode a caller-chosen key
//! avoids.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::codec::{canonical_json, uuid5};
use crate::error::{EngineError, Result};
use crate::store::Store;

/// Resolve the next run timestamp for a task: an explicit `run_at` wins
/// outright; otherwise `reference_time + interval_seconds` is computed
/// (a malformed `reference_time` is `ERR_DETERMINISM`, since the result
/// would not be reproducible); if neither is usable, scheduling the task
/// has no well-defined trigger at all (`ERR_INVALID_SCHEDULE`).
fn resolve_next_run_at(run_at: Option<&str>, reference_time: Option<&str>, interval_seconds: Option<i64>) -> Result<String> {
    if let Some(run_at) = run_at {
        return Ok(run_at.to_string());
    }
    if let (Some(reference_time), Some(interval_seconds)) = (reference_time, interval_seconds) {
        let parsed = DateTime::parse_from_rfc3339(reference_time).map_err(|e| {
            EngineError::determinism(format!("reference_time {reference_time} is not RFC3339: {e}"))
        })?;
        let resolved = parsed.with_timezone(&Utc) + Duration::seconds(interval_seconds);
        return Ok(resolved.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
    }
    Err(EngineError::invalid_schedule(
        "schedule_task requires either run_at or both reference_time and interval_seconds",
    ))
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub title: String,
    pub action: String,
    pub payload: Value,
    pub next_run_at: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TaskRunRecord {
    pub run_id: String,
    pub task_id: String,
    pub status: String,
}

/// The normalized task's `title` is trim-only; its `action` is
/// lowercase+trim. Two titles differing only in case are distinct
/// identities, but two actions differing only in case collapse to one.
fn normalize_title(s: &str) -> String {
    s.trim().to_string()
}

fn normalize_action(s: &str) -> String {
    s.trim().to_lowercase()
}

pub struct Scheduler<'s> {
    store: &'s Store,
}

impl<'s> Scheduler<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn schedule_task(
        &self,
        dry_run: bool,
        title: &str,
        action: &str,
        payload: &Value,
        run_at: Option<&str>,
        reference_time: Option<&str>,
        interval_seconds: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> Result<TaskRecord> {
        let next_run_at = resolve_next_run_at(run_at, reference_time, interval_seconds)?;
        let next_run_at = next_run_at.as_str();
        let task_id = if dry_run {
            #[derive(serde::Serialize)]
            struct Schedule<'a> {
                next_run_at: &'a str,
            }
            #[derive(serde::Serialize)]
            struct Identity<'a> {
                title: &'a str,
                action: &'a str,
                payload: &'a Value,
                schedule: Schedule<'a>,
            }
            let normalized_title = normalize_title(title);
            let normalized_action = normalize_action(action);
            let identity_json = canonical_json(&Identity {
                title: &normalized_title,
                action: &normalized_action,
                payload,
                schedule: Schedule { next_run_at },
            });
            uuid5(&crate::codec::sha256_hex(identity_json.as_bytes())).to_string()
        } else {
            let key = idempotency_key.ok_or_else(|| {
                EngineError::idempotency_required("commit-mode schedule_task requires an idempotency_key")
            })?;
            uuid5(key).to_string()
        };

        let payload_json = serde_json::to_string(payload)?;

        self.store.transaction(|tx| {
            let existing: Option<(String, String, String, String)> = tx
                .query_row(
                    "SELECT title, action, payload_json, status FROM tasks WHERE task_id = ?1",
                    params![task_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            if let Some((existing_title, existing_action, existing_payload, _)) = &existing {
                if !dry_run && (existing_title != title || existing_action != action || existing_payload != &payload_json) {
                    return Err(EngineError::determinism(format!(
                        "idempotency_key {} already maps to a task with different content",
                        idempotency_key.unwrap_or("")
                    )));
                }
            } else {
                tx.execute(
                    "INSERT INTO tasks (task_id, title, action, payload_json, next_run_at, idempotency_key, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                    params![task_id, title, action, payload_json, next_run_at, idempotency_key, crate::domain::EPOCH],
                )?;
            }
            Ok(())
        })?;

        Ok(TaskRecord {
            task_id,
            title: title.to_string(),
            action: action.to_string(),
            payload: payload.clone(),
            next_run_at: next_run_at.to_string(),
            status: "pending".to_string(),
        })
    }

    /// Record a run attempt for an existing task. `run_id` is deterministic
    /// over `(task_id, started_at)` so replaying the same report twice is
    /// idempotent too.
    pub fn record_task_run(
        &self,
        task_id: &str,
        status: &str,
        result_hash: Option<&str>,
        started_at: &str,
        finished_at: Option<&str>,
    ) -> Result<TaskRunRecord> {
        if !matches!(status, "started" | "succeeded" | "failed") {
            return Err(EngineError::invalid_schedule(format!(
                "unknown task run status: {status}"
            )));
        }
        let run_id = uuid5(&canonical_json(&(task_id, started_at))).to_string();

        self.store.transaction(|tx| {
            let task_exists: Option<String> = tx
                .query_row("SELECT task_id FROM tasks WHERE task_id = ?1", params![task_id], |r| r.get(0))
                .optional()?;
            if task_exists.is_none() {
                return Err(EngineError::invalid_schedule(format!("unknown task {task_id}")));
            }

            tx.execute(
                "INSERT OR IGNORE INTO task_runs (run_id, task_id, status, result_hash, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, task_id, status, result_hash, started_at, finished_at],
            )?;

            if matches!(status, "succeeded" | "failed") {
                let new_status = if status == "succeeded" { "completed" } else { "failed" };
                tx.execute(
                    "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
                    params![new_status, task_id],
                )?;
            }
            Ok(())
        })?;

        Ok(TaskRunRecord {
            run_id,
            task_id: task_id.to_string(),
            status: status.to_string(),
        })
    }

    pub fn list_pending_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, title, action, payload_json, next_run_at, status
                 FROM tasks WHERE status = 'pending' ORDER BY next_run_at ASC, task_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let payload_json: String = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    payload_json,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (task_id, title, action, payload_json, next_run_at, status) = row?;
                let payload: Value = serde_json::from_str(&payload_json)?;
                out.push(TaskRecord {
                    task_id,
                    title,
                    action,
                    payload,
                    next_run_at,
                    status,
                });
            }
            Ok(out)
        })
    }
}
