//! Acceptance gate between an observation and the canonical offer row.

use std::fmt;

use chrono::{DateTime, Utc};
use offerwatch_core::{Confidence, OfferChange, OfferPatch, ParserId};
use offerwatch_extract::{find_block_marker, is_search_results_url, Extraction, SourceProfile};
use serde::{Deserialize, Serialize};

use crate::store::{IngestionStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    TransportFailure,
    SourceDisabled,
    BlockPage { marker: String },
    SearchResults,
    NoSignal,
    NonAuthoritativeParser,
    LowConfidence,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportFailure => f.write_str("transport failure"),
            Self::SourceDisabled => f.write_str("source is disabled"),
            Self::BlockPage { marker } => write!(f, "block page ({marker})"),
            Self::SearchResults => f.write_str("landing url is a search results page"),
            Self::NoSignal => f.write_str("no commerce signal"),
            Self::NonAuthoritativeParser => f.write_str("parser is not authoritative"),
            Self::LowConfidence => f.write_str("low confidence"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
    pub parser: ParserId,
    pub confidence: Confidence,
}

impl GateDecision {
    fn accept(extraction: &Extraction) -> Self {
        Self {
            accepted: true,
            reason: None,
            parser: extraction.parser,
            confidence: extraction.confidence,
        }
    }

    fn reject(reason: RejectReason, extraction: &Extraction) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            parser: extraction.parser,
            confidence: extraction.confidence,
        }
    }

    pub fn transport_failure() -> Self {
        Self::reject(RejectReason::TransportFailure, &Extraction::none())
    }

    pub fn source_disabled() -> Self {
        Self::reject(RejectReason::SourceDisabled, &Extraction::none())
    }
}

/// What the gate sees of a fetched page.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub landing_url: &'a str,
    pub body: &'a str,
    pub extraction: &'a Extraction,
}

/// Checks run in a fixed order and the first failing check names the reason.
pub fn evaluate(profile: &SourceProfile, input: GateInput<'_>) -> GateDecision {
    let extraction = input.extraction;
    if let Some(marker) = find_block_marker(input.body, &profile.block_markers) {
        return GateDecision::reject(
            RejectReason::BlockPage {
                marker: marker.to_string(),
            },
            extraction,
        );
    }
    if is_search_results_url(input.landing_url, &profile.search_url) {
        return GateDecision::reject(RejectReason::SearchResults, extraction);
    }
    if !extraction.has_commerce_signal() {
        return GateDecision::reject(RejectReason::NoSignal, extraction);
    }
    if !extraction.parser.is_authoritative() {
        return GateDecision::reject(RejectReason::NonAuthoritativeParser, extraction);
    }
    if extraction.confidence == Confidence::Low {
        return GateDecision::reject(RejectReason::LowConfidence, extraction);
    }
    GateDecision::accept(extraction)
}

pub fn patch_for(extraction: &Extraction) -> OfferPatch {
    let fields = &extraction.fields;
    OfferPatch {
        price_cents: fields.price_cents.value,
        currency: fields.currency.value.clone(),
        in_stock: fields.in_stock.value,
        image_url: fields.image_url.value.clone(),
    }
}

/// Writes an accepted observation into the canonical offer; rejected
/// decisions never touch the row.
pub async fn reconcile(
    store: &dyn IngestionStore,
    offer_id: i64,
    decision: &GateDecision,
    extraction: &Extraction,
    checked_at: DateTime<Utc>,
) -> Result<Option<OfferChange>, StoreError> {
    if !decision.accepted {
        return Ok(None);
    }
    store
        .apply_offer_patch(offer_id, &patch_for(extraction), checked_at)
        .await?
        .map(Some)
        .ok_or(StoreError::NotFound {
            entity: "offer",
            id: offer_id,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use offerwatch_core::{Field, Offer, Trust};

    fn profile() -> SourceProfile {
        let registry = offerwatch_extract::SourceRegistry::from_yaml_str(
            r#"
defaults:
  search_url:
    path_prefixes: ["/search"]
    query_params: ["q"]
  block_markers: ["Enter the characters you see below"]
sources:
  - slug: aquashop
    display_name: Aqua Shop
"#,
        )
        .unwrap();
        registry.profile("aquashop")
    }

    fn extraction(parser: ParserId, confidence: Confidence) -> Extraction {
        let trust = Trust {
            parser,
            confidence,
            selector_or_pointer: "ld+json[0].offers".into(),
            snippet: "19.99".into(),
        };
        let mut out = Extraction::none();
        out.parser = parser;
        out.confidence = confidence;
        out.fields.price_cents = Field::with_value_and_trust(1999, trust.clone());
        out.fields.currency = Field::with_value_and_trust("USD".into(), trust.clone());
        out.fields.in_stock = Field::with_value_and_trust(true, trust);
        out
    }

    fn input<'a>(url: &'a str, body: &'a str, extraction: &'a Extraction) -> GateInput<'a> {
        GateInput {
            landing_url: url,
            body,
            extraction,
        }
    }

    #[test]
    fn high_confidence_json_ld_is_accepted() {
        let ex = extraction(ParserId::JsonLd, Confidence::High);
        let decision = evaluate(&profile(), input("https://aquashop.example/p/1", "<html></html>", &ex));
        assert!(decision.accepted);
        assert_eq!(decision.reason, None);
    }

    #[test]
    fn block_marker_wins_over_search_shape() {
        let ex = extraction(ParserId::JsonLd, Confidence::High);
        let decision = evaluate(
            &profile(),
            input(
                "https://aquashop.example/search?q=fern",
                "<p>ENTER THE CHARACTERS YOU SEE BELOW</p>",
                &ex,
            ),
        );
        assert_eq!(
            decision.reason,
            Some(RejectReason::BlockPage {
                marker: "Enter the characters you see below".into()
            })
        );
    }

    #[test]
    fn search_landing_is_rejected() {
        let ex = extraction(ParserId::JsonLd, Confidence::High);
        let decision = evaluate(&profile(), input("https://aquashop.example/search?q=fern", "", &ex));
        assert_eq!(decision.reason, Some(RejectReason::SearchResults));
    }

    #[test]
    fn weak_parsers_are_rejected_in_order() {
        let p = profile();
        let none = Extraction::none();
        assert_eq!(
            evaluate(&p, input("https://aquashop.example/p/1", "", &none)).reason,
            Some(RejectReason::NoSignal)
        );
        let free_text = extraction(ParserId::FreeText, Confidence::Low);
        assert_eq!(
            evaluate(&p, input("https://aquashop.example/p/1", "", &free_text)).reason,
            Some(RejectReason::NonAuthoritativeParser)
        );
        let heuristic = extraction(ParserId::SourceHeuristic, Confidence::Low);
        assert_eq!(
            evaluate(&p, input("https://aquashop.example/p/1", "", &heuristic)).reason,
            Some(RejectReason::LowConfidence)
        );
    }

    #[test]
    fn reject_reason_serializes_with_code_tag() {
        let json = serde_json::to_value(RejectReason::BlockPage { marker: "captcha".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"code": "block_page", "marker": "captcha"}));
    }

    #[tokio::test]
    async fn rejected_decision_leaves_offer_untouched() {
        let store = MemoryStore::new();
        let offer = Offer {
            id: 9,
            source_slug: "aquashop".into(),
            url: "https://aquashop.example/p/9".into(),
            active: true,
            price_cents: Some(500),
            currency: Some("USD".into()),
            in_stock: Some(false),
            last_checked_at: None,
            product_image_url: None,
        };
        store.insert_offer(offer.clone()).await;

        let ex = extraction(ParserId::FreeText, Confidence::Low);
        let decision = evaluate(&profile(), input(&offer.url, "", &ex));
        let change = reconcile(&store, offer.id, &decision, &ex, Utc::now()).await.unwrap();
        assert!(change.is_none());
        assert_eq!(store.get_offer(9).await.unwrap().unwrap(), offer);
    }

    #[tokio::test]
    async fn accepted_decision_reports_meaningful_change() {
        let store = MemoryStore::new();
        store
            .insert_offer(Offer {
                id: 4,
                source_slug: "aquashop".into(),
                url: "https://aquashop.example/p/4".into(),
                active: true,
                price_cents: Some(2500),
                currency: Some("USD".into()),
                in_stock: Some(false),
                last_checked_at: None,
                product_image_url: None,
            })
            .await;

        let ex = extraction(ParserId::JsonLd, Confidence::High);
        let decision = evaluate(&profile(), input("https://aquashop.example/p/4", "", &ex));
        let change = reconcile(&store, 4, &decision, &ex, Utc::now()).await.unwrap().unwrap();
        assert_eq!(change.changed_fields(), vec!["price_cents", "in_stock"]);
        assert!(change.after.last_checked_at.is_some());
    }
}
