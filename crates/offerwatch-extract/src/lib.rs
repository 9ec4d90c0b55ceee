//! Confidence-ranked extraction chains for retailer offer pages: commerce
//! facts (price, currency, stock) and product images.

use std::cell::OnceCell;

use offerwatch_core::{Confidence, ExtractedFields, Field, ParserId, Trust};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub mod commerce;
pub mod fixtures;
pub mod images;
pub mod money;
pub mod profile;
pub mod signatures;

pub use fixtures::{load_fixture_case, FixtureCase};
pub use images::{normalize_image_url, ImageCandidate};
pub use profile::{ProfileDefaults, SearchUrlRules, SourceProfile, SourceRegistry};
pub use signatures::{find_block_marker, is_search_results_url};

pub const CRATE_NAME: &str = "offerwatch-extract";
pub const EXTRACTOR_VERSION: &str = "offerwatch-extract/1";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
}

pub(crate) fn compile_selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn compile_selectors(css: &[String]) -> Result<Vec<Selector>, ExtractError> {
    css.iter().map(|s| compile_selector(s)).collect()
}

/// A fetched document parsed once and shared by every extractor.
pub struct PageDocument {
    html: Html,
    base_url: Option<Url>,
    status: Option<u16>,
    json_ld: OnceCell<Vec<JsonValue>>,
}

impl PageDocument {
    pub fn parse(final_url: &str, status: Option<u16>, body: &str) -> Self {
        Self {
            html: Html::parse_document(body),
            base_url: Url::parse(final_url).ok(),
            status,
            json_ld: OnceCell::new(),
        }
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The document body is usable for extraction (a response below 400).
    pub fn is_available(&self) -> bool {
        matches!(self.status, Some(status) if status < 400)
    }

    /// Parsed JSON-LD blocks in document order; malformed blocks are skipped.
    pub fn json_ld_blocks(&self) -> &[JsonValue] {
        self.json_ld.get_or_init(|| {
            let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
                return Vec::new();
            };
            self.html
                .select(&selector)
                .enumerate()
                .filter_map(|(idx, node)| {
                    let text = node.text().collect::<String>();
                    match serde_json::from_str::<JsonValue>(text.trim()) {
                        Ok(value) => Some(value),
                        Err(err) => {
                            debug!(block = idx, error = %err, "skipping malformed json-ld block");
                            None
                        }
                    }
                })
                .collect()
        })
    }
}

/// One link in an ordered extraction chain.
pub trait Extractor: Send + Sync {
    type Output;

    fn parser(&self) -> ParserId;

    /// Whether this link needs a usable document body.
    fn requires_document(&self) -> bool {
        true
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<Self::Output>;
}

pub type CommerceExtractor = Box<dyn Extractor<Output = CommerceSignal>>;
pub type ImageExtractor = Box<dyn Extractor<Output = Vec<ImageCandidate>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommerceSignal {
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub in_stock: Option<bool>,
    pub confidence: Confidence,
    pub pointer: String,
    pub snippet: String,
}

impl CommerceSignal {
    pub fn is_signal(&self) -> bool {
        self.price_cents.is_some() || self.in_stock.is_some()
    }
}

/// Outcome of running both chains over one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub fields: ExtractedFields,
    pub parser: ParserId,
    pub confidence: Confidence,
    pub image_parser: Option<ParserId>,
}

impl Extraction {
    pub fn none() -> Self {
        Self {
            fields: ExtractedFields::default(),
            parser: ParserId::None,
            confidence: Confidence::Low,
            image_parser: None,
        }
    }

    pub fn has_commerce_signal(&self) -> bool {
        self.fields.price_cents.is_present() || self.fields.in_stock.is_present()
    }
}

pub struct ExtractionChain {
    commerce: Vec<CommerceExtractor>,
    images: Vec<ImageExtractor>,
}

impl ExtractionChain {
    /// Standard chain order with the source's own heuristics in third place,
    /// when the profile configures any.
    pub fn for_profile(profile: &SourceProfile) -> Result<Self, ExtractError> {
        let mut commerce: Vec<CommerceExtractor> = vec![
            Box::new(commerce::JsonLdOfferExtractor),
            Box::new(commerce::MetaTagExtractor::new()?),
        ];
        if profile.has_source_heuristics() {
            commerce.push(Box::new(commerce::SourceHeuristicExtractor::new(profile)?));
        }
        commerce.push(Box::new(commerce::FreeTextExtractor));
        commerce.push(Box::new(commerce::HttpStatusFallback));
        let images: Vec<ImageExtractor> = vec![
            Box::new(images::JsonLdImageExtractor),
            Box::new(images::MetaImageExtractor::new()?),
            Box::new(images::SourceDomImageExtractor::new(profile)?),
        ];
        Ok(Self { commerce, images })
    }

    pub fn run(&self, doc: &PageDocument) -> Extraction {
        let mut out = Extraction::none();

        for extractor in &self.commerce {
            if extractor.requires_document() && !doc.is_available() {
                continue;
            }
            let Some(signal) = extractor.try_extract(doc) else {
                continue;
            };
            if !signal.is_signal() {
                continue;
            }
            let trust = Trust {
                parser: extractor.parser(),
                confidence: signal.confidence,
                selector_or_pointer: signal.pointer.clone(),
                snippet: truncate_snippet(&signal.snippet),
            };
            out.fields.price_cents = field_with(signal.price_cents, &trust);
            out.fields.currency = field_with(signal.currency.clone(), &trust);
            out.fields.in_stock = field_with(signal.in_stock, &trust);
            out.parser = extractor.parser();
            out.confidence = signal.confidence;
            break;
        }

        if doc.is_available() {
            for extractor in &self.images {
                let candidates = extractor.try_extract(doc).unwrap_or_default();
                let accepted = candidates.into_iter().find_map(|candidate| {
                    normalize_image_url(&candidate.url, doc.base_url()).map(|url| (url, candidate))
                });
                if let Some((url, candidate)) = accepted {
                    let trust = Trust {
                        parser: extractor.parser(),
                        confidence: image_confidence(extractor.parser()),
                        selector_or_pointer: candidate.pointer,
                        snippet: truncate_snippet(&candidate.url),
                    };
                    out.fields.image_url = Field::with_value_and_trust(url, trust);
                    out.image_parser = Some(extractor.parser());
                    break;
                }
            }
        }

        out
    }
}

fn field_with<T>(value: Option<T>, trust: &Trust) -> Field<T> {
    match value {
        Some(value) => Field::with_value_and_trust(value, trust.clone()),
        None => Field::empty(),
    }
}

fn image_confidence(parser: ParserId) -> Confidence {
    match parser {
        ParserId::JsonLd => Confidence::High,
        ParserId::MetaTags | ParserId::SourceHeuristic => Confidence::Medium,
        _ => Confidence::Low,
    }
}

const SNIPPET_MAX_CHARS: usize = 240;

pub(crate) fn truncate_snippet(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SNIPPET_MAX_CHARS {
        collapsed
    } else {
        collapsed.chars().take(SNIPPET_MAX_CHARS).collect()
    }
}

/// Maps schema.org availability values and meta/keyword variants to a stock
/// flag.
pub fn availability_from_text(raw: &str) -> Option<bool> {
    let tail = raw.trim().rsplit('/').next().unwrap_or_default();
    let key: String = tail
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match key.as_str() {
        "instock" | "limitedavailability" | "onlineonly" | "instoreonly" | "preorder"
        | "presale" | "available" | "true" => Some(true),
        "outofstock" | "soldout" | "discontinued" | "backorder" | "unavailable" | "oos"
        | "false" => Some(false),
        _ => None,
    }
}
