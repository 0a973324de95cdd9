//! Lineage and audit trail
//!
//! Lineage is an append-only event log per query (plan -> telemetry ->
//! fact -> review -> debate). The audit log keeps the final record for each
//! query together with an integrity hash. Both are best-effort
//! dependencies for the orchestrator.

use crate::error::OrchestrationError;
use crate::models::{
    AuditRecord, DataProvenance, DebateRecord, ExecutionTelemetry, FactSummary, PipelineFailure,
    PipelineStage, ReviewResult, TemporalViolation,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Content hash binding telemetry and facts to the exact code that ran
pub fn compute_fingerprint(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// SHA256 over the JSON form of a record
/// Streams serialization straight into the hasher
pub fn compute_record_hash<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//
// ================= Lineage =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LineageEvent {
    StageEntered {
        stage: PipelineStage,
    },
    PlanProduced {
        plan_id: Uuid,
        attempt: u32,
        code_fingerprint: String,
        data_requirements: Vec<String>,
    },
    DataResolved {
        provenance: DataProvenance,
    },
    TemporalAnalyzed {
        code_fingerprint: String,
        violations: Vec<TemporalViolation>,
        blocking: bool,
    },
    Telemetry {
        telemetry: ExecutionTelemetry,
    },
    FactExtracted {
        fact: FactSummary,
        execution_id: Uuid,
    },
    ExtractionRejected {
        execution_id: Uuid,
        reason: String,
    },
    Reviewed {
        fact_id: Uuid,
        review: ReviewResult,
    },
    Debated {
        fact_id: Uuid,
        debate: DebateRecord,
    },
    Failed {
        failure: PipelineFailure,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    pub entry_id: Uuid,
    pub query_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LineageEvent,
}

impl LineageEntry {
    pub fn new(query_id: Uuid, event: LineageEvent) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            query_id,
            recorded_at: Utc::now(),
            event,
        }
    }
}

/// Append-only lineage storage
#[async_trait::async_trait]
pub trait LineageStore: Send + Sync {
    async fn append(&self, entry: LineageEntry) -> Result<()>;
    async fn entries_for(&self, query_id: Uuid) -> Result<Vec<LineageEntry>>;
}

/// In-memory lineage for development and tests
#[derive(Default)]
pub struct InMemoryLineageStore {
    entries: Arc<RwLock<HashMap<Uuid, Vec<LineageEntry>>>>,
}

impl InMemoryLineageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LineageStore for InMemoryLineageStore {
    async fn append(&self, entry: LineageEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(entry.query_id).or_default().push(entry);
        Ok(())
    }

    async fn entries_for(&self, query_id: Uuid) -> Result<Vec<LineageEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&query_id).cloned().unwrap_or_default())
    }
}

//
// ================= Audit records =================
//

struct StoredRecord {
    record: AuditRecord,
    hash: String,
}

/// Final audit record per query
#[derive(Clone, Default)]
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, StoredRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the record for its query. A query is audited once.
    pub async fn record(&self, record: AuditRecord) -> Result<Uuid> {
        let query_id = record.query_id;
        let mut records = self.records.write().await;

        if records.contains_key(&query_id) {
            return Err(OrchestrationError::AuditError(format!(
                "audit record for query {} already exists",
                query_id
            )));
        }

        let hash = compute_record_hash(&record);
        records.insert(query_id, StoredRecord { record, hash });
        Ok(query_id)
    }

    pub async fn get(&self, query_id: Uuid) -> Result<Option<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&query_id).map(|s| s.record.clone()))
    }

    /// Query ids sorted by record creation time
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .iter()
            .map(|(id, stored)| (*id, stored.record.created_at))
            .collect();
        items.sort_by_key(|(_, created_at)| *created_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Recompute the stored record's hash and compare
    pub async fn verify_integrity(&self, query_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;
        Ok(records
            .get(&query_id)
            .map(|stored| compute_record_hash(&stored.record) == stored.hash)
            .unwrap_or(false))
    }
}
