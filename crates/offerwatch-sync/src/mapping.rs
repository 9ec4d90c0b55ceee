use std::sync::Arc;

use chrono::Utc;
use offerwatch_core::{CanonicalMapping, CanonicalType};
use tracing::debug;

use crate::store::{IngestionStore, StoreError};

/// Links source entities to canonical records, one mapping per entity.
#[derive(Clone)]
pub struct CanonicalMapper {
    store: Arc<dyn IngestionStore>,
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

impl CanonicalMapper {
    pub fn new(store: Arc<dyn IngestionStore>) -> Self {
        Self { store }
    }

    pub async fn ensure_mapping(
        &self,
        entity_id: i64,
        canonical_type: CanonicalType,
        canonical_id: i64,
        match_method: &str,
        confidence: f64,
    ) -> Result<CanonicalMapping, StoreError> {
        let mapping = self
            .store
            .upsert_mapping(
                entity_id,
                canonical_type,
                canonical_id,
                match_method,
                clamp_confidence(confidence),
                Utc::now(),
            )
            .await?;
        debug!(entity_id, canonical_type = %canonical_type, canonical_id, "mapping ensured");
        Ok(mapping)
    }

    pub async fn mapping_for(&self, entity_id: i64) -> Result<Option<CanonicalMapping>, StoreError> {
        self.store.mapping_for(entity_id).await
    }
}
