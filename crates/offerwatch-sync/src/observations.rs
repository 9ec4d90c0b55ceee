//! Append-only observation log. Every fetch attempt becomes a snapshot row,
//! deduplicated per entity by a content hash over its stable parts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use offerwatch_core::{minute_bucket_key, ExtractedFields, IngestionEntity, NewSnapshot};
use offerwatch_extract::EXTRACTOR_VERSION;
use offerwatch_storage::{sha256_hex, stable_hash, FetchedDocument};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::reconcile::GateDecision;
use crate::store::{IngestionStore, StoreError};

/// Request/response facts recorded with each snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMetadata {
    pub requested_url: String,
    pub final_url: Option<String>,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub body_sha256: Option<String>,
    pub body_bytes: Option<usize>,
    pub truncated: bool,
    pub artifact_path: Option<String>,
    pub transport_error: Option<String>,
    pub elapsed_ms: Option<u64>,
}

impl RawMetadata {
    pub fn from_document(doc: &FetchedDocument, artifact_path: Option<String>) -> Self {
        Self {
            requested_url: doc.requested_url.clone(),
            final_url: Some(doc.final_url.clone()),
            status: Some(doc.status),
            content_type: doc.content_type.clone(),
            body_sha256: Some(sha256_hex(&doc.body)),
            body_bytes: Some(doc.body.len()),
            truncated: doc.truncated,
            artifact_path,
            transport_error: None,
            elapsed_ms: Some(doc.elapsed_ms),
        }
    }

    pub fn from_transport_error(requested_url: &str, error: impl ToString) -> Self {
        Self {
            requested_url: requested_url.to_string(),
            transport_error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Same facts without timing and archive location.
    fn without_volatile(&self) -> Self {
        Self {
            artifact_path: None,
            elapsed_ms: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub fetched_at: DateTime<Utc>,
    pub raw: RawMetadata,
    pub fields: ExtractedFields,
    pub decision: GateDecision,
}

impl Observation {
    pub fn content_hash(&self, entity_id: i64) -> serde_json::Result<String> {
        stable_hash(&json!({
            "entity_id": entity_id,
            "minute_bucket": minute_bucket_key(self.fetched_at),
            "raw": self.raw.without_volatile(),
            "extracted_fields": self.fields,
            "decision": self.decision,
        }))
    }

    pub fn to_snapshot(&self, entity_id: i64) -> serde_json::Result<NewSnapshot> {
        let raw_json = json!({
            "extractor": EXTRACTOR_VERSION,
            "request": self.raw,
            "decision": self.decision,
        });
        Ok(NewSnapshot {
            entity_id,
            fetched_at: self.fetched_at,
            http_status: self.raw.status,
            raw_json,
            extracted_fields: serde_json::to_value(&self.fields)?,
            content_hash: self.content_hash(entity_id)?,
        })
    }
}

#[derive(Clone)]
pub struct ObservationLog {
    store: Arc<dyn IngestionStore>,
}

impl ObservationLog {
    pub fn new(store: Arc<dyn IngestionStore>) -> Self {
        Self { store }
    }

    /// Returns the new snapshot id, or `None` when an identical observation
    /// was already logged in the same minute.
    pub async fn record(
        &self,
        entity: &IngestionEntity,
        observation: &Observation,
    ) -> Result<Option<i64>, StoreError> {
        let snapshot = observation.to_snapshot(entity.id)?;
        let inserted = self.store.insert_snapshot(&snapshot, Utc::now()).await?;
        if inserted.is_none() {
            debug!(entity_id = entity.id, hash = %snapshot.content_hash, "snapshot deduplicated");
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::TimeZone;
    use offerwatch_core::EntityType;

    fn document(fetched_at: DateTime<Utc>, elapsed_ms: u64) -> FetchedDocument {
        FetchedDocument {
            requested_url: "https://aquashop.example/p/1".into(),
            final_url: "https://aquashop.example/p/1".into(),
            status: 200,
            content_type: Some("text/html".into()),
            body: b"<html>same bytes</html>".to_vec(),
            truncated: false,
            fetched_at,
            elapsed_ms,
        }
    }

    fn observation(doc: &FetchedDocument, artifact: Option<String>) -> Observation {
        Observation {
            fetched_at: doc.fetched_at,
            raw: RawMetadata::from_document(doc, artifact),
            fields: ExtractedFields::default(),
            decision: GateDecision::transport_failure(),
        }
    }

    async fn entity(store: &MemoryStore) -> IngestionEntity {
        let source = store.ensure_source("aquashop", "Aqua Shop").await.unwrap();
        store
            .upsert_entity(source.id, EntityType::Offer, "1", Some("https://aquashop.example/p/1"), Utc::now())
            .await
            .unwrap()
    }

    #[test]
    fn hash_ignores_timing_and_artifact_path_within_a_minute() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 50).unwrap();
        let a = observation(&document(t0, 120), Some("20260301_120005/aquashop/x.html".into()));
        let b = observation(&document(t1, 480), Some("20260301_120050/aquashop/x.html".into()));
        assert_eq!(a.content_hash(1).unwrap(), b.content_hash(1).unwrap());
        assert_ne!(a.content_hash(1).unwrap(), a.content_hash(2).unwrap());

        let next_minute = Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap();
        let c = observation(&document(next_minute, 120), None);
        assert_ne!(a.content_hash(1).unwrap(), c.content_hash(1).unwrap());
    }

    #[tokio::test]
    async fn identical_fetch_in_same_minute_logs_one_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let log = ObservationLog::new(store.clone());
        let entity = entity(&store).await;
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 40).unwrap();

        let first = log.record(&entity, &observation(&document(t0, 90), None)).await.unwrap();
        let second = log.record(&entity, &observation(&document(t1, 300), None)).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.snapshot_count().await, 1);
    }

    #[tokio::test]
    async fn transport_failures_are_logged_with_error_text() {
        let store = Arc::new(MemoryStore::new());
        let log = ObservationLog::new(store.clone());
        let entity = entity(&store).await;
        let observation = Observation {
            fetched_at: Utc::now(),
            raw: RawMetadata::from_transport_error("https://aquashop.example/p/1", "connection refused"),
            fields: ExtractedFields::default(),
            decision: GateDecision::transport_failure(),
        };
        log.record(&entity, &observation).await.unwrap().unwrap();

        let rows = store.snapshots_for_entity(entity.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].http_status, None);
        assert_eq!(rows[0].raw_json["request"]["transport_error"], "connection refused");
        assert_eq!(rows[0].raw_json["decision"]["reason"]["code"], "transport_failure");
    }
}
