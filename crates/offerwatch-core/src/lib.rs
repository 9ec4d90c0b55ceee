//! Core domain model for OfferWatch ingestion: entities, snapshots, mappings,
//! canonical offers, jobs and runs, plus trust annotations on extracted fields.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "offerwatch-core";

pub const JOB_KIND_OFFER_REFRESH: &str = "offer.refresh";
pub const JOB_KIND_REFRESH_STALE: &str = "offers.refresh_stale";
pub const JOB_KIND_HYDRATE_IMAGES: &str = "offers.hydrate_images";

/// Bulk kinds enqueued together by the freshness-refresh recovery action.
pub const FRESHNESS_REFRESH_KINDS: [&str; 2] = [JOB_KIND_REFRESH_STALE, JOB_KIND_HYDRATE_IMAGES];

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Plant,
    Offer,
}

string_enum!(EntityType, "entity type", {
    Product => "product",
    Plant => "plant",
    Offer => "offer",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalType {
    Product,
    Plant,
    Offer,
}

string_enum!(CanonicalType, "canonical type", {
    Product => "product",
    Plant => "plant",
    Offer => "offer",
});

/// Trust tier of an extracted signal. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

string_enum!(Confidence, "confidence", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Identity of the extractor that produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserId {
    JsonLd,
    MetaTags,
    SourceHeuristic,
    FreeText,
    HttpStatus,
    None,
}

string_enum!(ParserId, "parser", {
    JsonLd => "json_ld",
    MetaTags => "meta_tags",
    SourceHeuristic => "source_heuristic",
    FreeText => "free_text",
    HttpStatus => "http_status",
    None => "none",
});

impl ParserId {
    /// Fallback parsers may be logged but never mutate canonical state.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, Self::FreeText | Self::HttpStatus | Self::None)
    }
}

/// Provenance attached to an extracted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    pub parser: ParserId,
    pub confidence: Confidence,
    pub selector_or_pointer: String,
    pub snippet: String,
}

/// Extracted field wrapper with optional value + trust annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub trust: Option<Trust>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            trust: None,
        }
    }

    pub fn with_value_and_trust(value: T, trust: Trust) -> Self {
        Self {
            value: Some(value),
            trust: Some(trust),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Field set derived from one fetched document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub price_cents: Field<i64>,
    pub currency: Field<String>,
    pub in_stock: Field<bool>,
    pub image_url: Field<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSource {
    pub id: i64,
    pub slug: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionEntity {
    pub id: i64,
    pub source_id: i64,
    pub entity_type: EntityType,
    pub source_entity_id: String,
    pub url: Option<String>,
    pub active: bool,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Input for an observation-log insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub entity_id: i64,
    pub fetched_at: DateTime<Utc>,
    pub http_status: Option<u16>,
    pub raw_json: JsonValue,
    pub extracted_fields: JsonValue,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub entity_id: i64,
    pub fetched_at: DateTime<Utc>,
    pub http_status: Option<u16>,
    pub raw_json: JsonValue,
    pub extracted_fields: JsonValue,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMapping {
    pub entity_id: i64,
    pub canonical_type: CanonicalType,
    pub canonical_id: i64,
    pub match_method: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical offer owned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub source_slug: String,
    pub url: String,
    pub active: bool,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub in_stock: Option<bool>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub product_image_url: Option<String>,
}

/// Accepted observation values to merge into an offer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OfferPatch {
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub in_stock: Option<bool>,
    pub image_url: Option<String>,
}

impl OfferPatch {
    /// Field-level merge: observed commerce facts overwrite, images only
    /// hydrate an empty canonical image.
    pub fn merge_into(&self, offer: &Offer, checked_at: DateTime<Utc>) -> Offer {
        let mut next = offer.clone();
        if let Some(price) = self.price_cents {
            next.price_cents = Some(price);
        }
        if let Some(currency) = &self.currency {
            next.currency = Some(currency.clone());
        }
        if let Some(in_stock) = self.in_stock {
            next.in_stock = Some(in_stock);
        }
        let has_image = offer
            .product_image_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if !has_image {
            if let Some(image) = &self.image_url {
                next.product_image_url = Some(image.clone());
            }
        }
        next.last_checked_at = Some(checked_at);
        next
    }
}

/// Before/after pair returned by a reconciliation write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferChange {
    pub before: Offer,
    pub after: Offer,
}

impl OfferChange {
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.before.price_cents != self.after.price_cents {
            out.push("price_cents");
        }
        if self.before.currency != self.after.currency {
            out.push("currency");
        }
        if self.before.in_stock != self.after.in_stock {
            out.push("in_stock");
        }
        if self.before.product_image_url != self.after.product_image_url {
            out.push("product_image_url");
        }
        out
    }

    pub fn is_meaningful(&self) -> bool {
        !self.changed_fields().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

string_enum!(JobStatus, "job status", {
    Queued => "queued",
    Running => "running",
    Success => "success",
    Failed => "failed",
});

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [Self::Queued, Self::Running, Self::Success, Self::Failed];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: i64,
    pub kind: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: String,
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
    pub priority: i32,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            payload,
            idempotency_key: None,
            priority: 100,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: i64,
    pub deduped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

/// Per-sweep counters; `changed` counts meaningful canonical changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub scanned: i32,
    pub updated: i32,
    pub changed: i32,
    pub failed: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: i64,
    pub source_slug: String,
    pub job_kind: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub counters: RunCounters,
}

/// Truncates a timestamp to the start of its minute.
pub fn minute_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts)
}

/// Compact minute key used in idempotency keys, e.g. `202610191405`.
pub fn minute_bucket_key(ts: DateTime<Utc>) -> String {
    minute_bucket(ts).format("%Y%m%d%H%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn offer() -> Offer {
        Offer {
            id: 7,
            source_slug: "aquashop".into(),
            url: "https://aquashop.example/p/7".into(),
            active: true,
            price_cents: Some(1500),
            currency: Some("USD".into()),
            in_stock: Some(false),
            last_checked_at: None,
            product_image_url: Some("https://cdn.example/curated.jpg".into()),
        }
    }

    #[test]
    fn enum_strings_round_trip_through_from_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("plant".parse::<EntityType>().unwrap(), EntityType::Plant);
        assert!("bogus".parse::<ParserId>().is_err());
    }

    #[test]
    fn fallback_parsers_are_not_authoritative() {
        assert!(ParserId::JsonLd.is_authoritative());
        assert!(ParserId::SourceHeuristic.is_authoritative());
        assert!(!ParserId::FreeText.is_authoritative());
        assert!(!ParserId::HttpStatus.is_authoritative());
        assert!(!ParserId::None.is_authoritative());
        assert!(Confidence::High > Confidence::Medium);
    }

    #[test]
    fn merge_overwrites_commerce_fields_but_only_hydrates_images() {
        let checked = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let patch = OfferPatch {
            price_cents: Some(1999),
            currency: Some("USD".into()),
            in_stock: Some(true),
            image_url: Some("https://cdn.example/scraped.jpg".into()),
        };
        let merged = patch.merge_into(&offer(), checked);
        assert_eq!(merged.price_cents, Some(1999));
        assert_eq!(merged.in_stock, Some(true));
        assert_eq!(
            merged.product_image_url.as_deref(),
            Some("https://cdn.example/curated.jpg")
        );
        assert_eq!(merged.last_checked_at, Some(checked));

        let mut bare = offer();
        bare.product_image_url = None;
        let hydrated = patch.merge_into(&bare, checked);
        assert_eq!(
            hydrated.product_image_url.as_deref(),
            Some("https://cdn.example/scraped.jpg")
        );
    }

    #[test]
    fn change_diff_lists_fields() {
        let before = offer();
        let mut after = before.clone();
        after.price_cents = Some(1200);
        after.last_checked_at = Some(Utc::now());
        let change = OfferChange { before, after };
        assert_eq!(change.changed_fields(), vec!["price_cents"]);
        assert!(change.is_meaningful());
    }

    #[test]
    fn minute_bucket_truncates_seconds() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 19, 14, 5, 59).unwrap();
        assert_eq!(
            minute_bucket(ts),
            Utc.with_ymd_and_hms(2026, 10, 19, 14, 5, 0).unwrap()
        );
        assert_eq!(minute_bucket_key(ts), "202610191405");
    }
}
