//! The audit envelope wrapping every tool call: canonical-JSON hashes of
//! input and output, the result itself, and a best-effort log append that
//! must never block or discard the caller's actual reply. A broken audit
//! log is a degraded-observability problem; a tool call failing because
//! its audit write failed would be a correctness problem, which is
//! strictly worse.

use rusqlite::params;
use serde::Serialize;
use serde_json::Value;

use crate::codec::{canonical_json, sha256_hex, uuid5};
use crate::domain::EPOCH;
use crate::store::Store;

/// Engine version baked into every envelope, read from the crate's own
/// `Cargo.toml` at compile time. Every tool currently shares one version
/// with the server it runs inside, so `tool_version` and `server_version`
/// are the same constant today; they are kept as separate fields because
/// a future tool registry could version tools independently.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
pub struct AuditMetrics {
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEnvelope {
    pub request_id: String,
    pub tool_name: String,
    pub tool_version: &'static str,
    pub server_version: &'static str,
    pub inputs_hash: String,
    pub outputs_hash: String,
    pub result: Value,
    pub provenance: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub metrics: AuditMetrics,
}

impl AuditEnvelope {
    /// Build the envelope for a successful call. `outputs_hash` is
    /// computed over `result` alone, so two calls that produce the same
    /// result hash identically regardless of `request_id` or timestamp.
    pub fn success<I: Serialize, O: Serialize>(
        tool_name: &str,
        input: &I,
        output: &O,
        warnings: Vec<String>,
        provenance: Vec<String>,
    ) -> Self {
        let result = serde_json::to_value(output).unwrap_or(Value::Null);
        Self::build(tool_name, input, result, provenance, warnings, Vec::new())
    }

    /// Build the envelope for a failed call. `result` is `null`; the
    /// error's stable code and message land in `errors`.
    pub fn failure<I: Serialize>(tool_name: &str, input: &I, error: &crate::error::EngineError) -> Self {
        let errors = vec![format!("{}: {}", error.code().as_str(), error.message)];
        Self::build(tool_name, input, Value::Null, Vec::new(), Vec::new(), errors)
    }

    fn build<I: Serialize>(
        tool_name: &str,
        input: &I,
        result: Value,
        provenance: Vec<String>,
        warnings: Vec<String>,
        errors: Vec<String>,
    ) -> Self {
        let inputs_hash = sha256_hex(canonical_json(input).as_bytes());
        let outputs_hash = sha256_hex(canonical_json(&result).as_bytes());
        let request_id = uuid5(&format!("{tool_name}:{inputs_hash}:{outputs_hash}")).to_string();
        Self {
            request_id,
            tool_name: tool_name.to_string(),
            tool_version: ENGINE_VERSION,
            server_version: ENGINE_VERSION,
            inputs_hash,
            outputs_hash,
            result,
            provenance,
            warnings,
            errors,
            metrics: AuditMetrics {
                timestamp: EPOCH.to_string(),
            },
        }
    }

    /// Best-effort append: a storage failure here is logged to `tracing`
    /// and swallowed rather than surfaced, so the caller still gets the
    /// reply the tool call actually produced.
    pub fn append_to(&self, store: &Store) {
        let envelope_json = match serde_json::to_string(self) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit envelope");
                return;
            }
        };
        let result = store.transaction(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO audit_log (request_id, tool_name, envelope_json, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![self.request_id, self.tool_name, envelope_json, self.metrics.timestamp],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, tool = %self.tool_name, "failed to append audit log entry");
        }
    }
}

/// Fetch an envelope's raw JSON back out of the log, for callers
/// inspecting audit history. Not part of the tool surface itself.
pub fn lookup(store: &Store, request_id: &str) -> Option<Value> {
    store
        .read(|conn| {
            let envelope_json: String = conn.query_row(
                "SELECT envelope_json FROM audit_log WHERE request_id = ?1",
                params![request_id],
                |r| r.get(0),
            )?;
            serde_json::from_str(&envelope_json).map_err(crate::error::EngineError::from)
        })
        .ok()
}
