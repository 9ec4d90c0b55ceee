//! Commerce extractors, strongest first: JSON-LD offers, meta/microdata tags,
//! per-source selectors, free text, and the HTTP status fallback.

use std::sync::LazyLock;

use offerwatch_core::{Confidence, ParserId};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

use crate::money::{detect_currency, json_price_to_cents, normalize_currency, parse_price_to_cents};
use crate::{
    availability_from_text, compile_selector, compile_selectors, CommerceSignal, ExtractError,
    Extractor, PageDocument, SourceProfile,
};

/// Flattens a JSON-LD value into candidate nodes, following arrays and
/// `@graph` containers.
pub(crate) fn ld_nodes(value: &JsonValue) -> Vec<&JsonValue> {
    let mut out = Vec::new();
    collect_ld_nodes(value, &mut out);
    out
}

fn collect_ld_nodes<'a>(value: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => items.iter().for_each(|item| collect_ld_nodes(item, out)),
        JsonValue::Object(map) => {
            out.push(value);
            if let Some(graph) = map.get("@graph") {
                collect_ld_nodes(graph, out);
            }
        }
        _ => {}
    }
}

pub(crate) fn ld_type_is(node: &JsonValue, wanted: &str) -> bool {
    match node.get("@type") {
        Some(JsonValue::String(t)) => t.eq_ignore_ascii_case(wanted),
        Some(JsonValue::Array(types)) => types
            .iter()
            .filter_map(JsonValue::as_str)
            .any(|t| t.eq_ignore_ascii_case(wanted)),
        _ => false,
    }
}

fn is_offer_node(node: &JsonValue) -> bool {
    ld_type_is(node, "Offer") || ld_type_is(node, "AggregateOffer")
}

/// Offer objects reachable from a product node (or the node itself when it
/// is an offer), with their JSON pointer suffix.
fn offer_candidates(node: &JsonValue) -> Vec<(String, &JsonValue)> {
    let mut out = Vec::new();
    if is_offer_node(node) {
        out.push((String::new(), node));
    }
    match node.get("offers") {
        Some(JsonValue::Array(items)) => {
            for (idx, item) in items.iter().enumerate() {
                out.push((format!(".offers[{idx}]"), item));
            }
        }
        Some(offer @ JsonValue::Object(_)) => {
            out.push((".offers".to_string(), offer));
            if let Some(JsonValue::Array(nested)) = offer.get("offers") {
                for (idx, item) in nested.iter().enumerate() {
                    out.push((format!(".offers.offers[{idx}]"), item));
                }
            }
        }
        _ => {}
    }
    out
}

fn first_of<'a>(value: Option<&'a JsonValue>) -> Option<&'a JsonValue> {
    match value? {
        JsonValue::Array(items) => items.first(),
        other => Some(other),
    }
}

fn offer_price(offer: &JsonValue) -> Option<i64> {
    ["price", "lowPrice"]
        .iter()
        .find_map(|key| offer.get(*key).and_then(json_price_to_cents))
        .or_else(|| {
            first_of(offer.get("priceSpecification"))
                .and_then(|spec| spec.get("price"))
                .and_then(json_price_to_cents)
        })
}

fn offer_currency(offer: &JsonValue) -> Option<String> {
    offer
        .get("priceCurrency")
        .and_then(JsonValue::as_str)
        .or_else(|| {
            first_of(offer.get("priceSpecification"))
                .and_then(|spec| spec.get("priceCurrency"))
                .and_then(JsonValue::as_str)
        })
        .and_then(normalize_currency)
}

pub struct JsonLdOfferExtractor;

impl Extractor for JsonLdOfferExtractor {
    type Output = CommerceSignal;

    fn parser(&self) -> ParserId {
        ParserId::JsonLd
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<CommerceSignal> {
        for (block_idx, block) in doc.json_ld_blocks().iter().enumerate() {
            for node in ld_nodes(block) {
                for (suffix, offer) in offer_candidates(node) {
                    let price_cents = offer_price(offer);
                    let in_stock = offer
                        .get("availability")
                        .and_then(JsonValue::as_str)
                        .and_then(availability_from_text);
                    if price_cents.is_none() && in_stock.is_none() {
                        continue;
                    }
                    return Some(CommerceSignal {
                        price_cents,
                        currency: offer_currency(offer),
                        in_stock,
                        confidence: Confidence::High,
                        pointer: format!("ld+json[{block_idx}]{suffix}"),
                        snippet: offer.to_string(),
                    });
                }
            }
        }
        None
    }
}

/// Open Graph / product meta tags and schema.org microdata attributes.
pub struct MetaTagExtractor {
    price: Vec<(&'static str, Selector)>,
    currency: Vec<(&'static str, Selector)>,
    availability: Vec<(&'static str, Selector)>,
}

const META_PRICE: [&str; 4] = [
    r#"meta[property="product:price:amount"]"#,
    r#"meta[property="og:price:amount"]"#,
    r#"meta[itemprop="price"]"#,
    r#"[itemprop="price"]"#,
];
const META_CURRENCY: [&str; 4] = [
    r#"meta[property="product:price:currency"]"#,
    r#"meta[property="og:price:currency"]"#,
    r#"meta[itemprop="priceCurrency"]"#,
    r#"[itemprop="priceCurrency"]"#,
];
const META_AVAILABILITY: [&str; 4] = [
    r#"meta[property="product:availability"]"#,
    r#"meta[property="og:availability"]"#,
    r#"link[itemprop="availability"]"#,
    r#"[itemprop="availability"]"#,
];

fn compile_static(list: &[&'static str]) -> Result<Vec<(&'static str, Selector)>, ExtractError> {
    list.iter()
        .map(|css| compile_selector(css).map(|sel| (*css, sel)))
        .collect()
}

/// `content`, then `href`, then element text.
fn element_value(el: ElementRef<'_>) -> Option<String> {
    let value = el
        .value()
        .attr("content")
        .or_else(|| el.value().attr("href"))
        .map(str::to_string)
        .unwrap_or_else(|| el.text().collect::<String>());
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn first_value<T>(
    html: &Html,
    selectors: &[(&'static str, Selector)],
    parse: impl Fn(&str) -> Option<T>,
) -> Option<(&'static str, String, T)> {
    selectors.iter().find_map(|(css, sel)| {
        html.select(sel).find_map(|el| {
            let raw = element_value(el)?;
            parse(&raw).map(|parsed| (*css, raw, parsed))
        })
    })
}

impl MetaTagExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            price: compile_static(&META_PRICE)?,
            currency: compile_static(&META_CURRENCY)?,
            availability: compile_static(&META_AVAILABILITY)?,
        })
    }
}

impl Extractor for MetaTagExtractor {
    type Output = CommerceSignal;

    fn parser(&self) -> ParserId {
        ParserId::MetaTags
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<CommerceSignal> {
        let html = doc.html();
        let price = first_value(html, &self.price, parse_price_to_cents);
        let stock = first_value(html, &self.availability, availability_from_text);
        if price.is_none() && stock.is_none() {
            return None;
        }
        let currency = first_value(html, &self.currency, normalize_currency)
            .map(|(_, _, code)| code)
            .or_else(|| price.as_ref().and_then(|(_, raw, _)| detect_currency(raw)));

        let pointer = [price.as_ref().map(|p| p.0), stock.as_ref().map(|s| s.0)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" | ");
        let snippet = [price.as_ref().map(|p| p.1.as_str()), stock.as_ref().map(|s| s.1.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        Some(CommerceSignal {
            price_cents: price.map(|(_, _, cents)| cents),
            currency,
            in_stock: stock.map(|(_, _, flag)| flag),
            confidence: Confidence::Medium,
            pointer,
            snippet,
        })
    }
}

/// CSS selectors configured per source in `sources.yaml`.
pub struct SourceHeuristicExtractor {
    default_currency: Option<String>,
    price: Vec<(String, Selector)>,
    stock_text: Vec<(String, Selector)>,
    in_stock: Vec<(String, Selector)>,
    out_of_stock: Vec<(String, Selector)>,
}

fn compile_named(css: &[String]) -> Result<Vec<(String, Selector)>, ExtractError> {
    Ok(css.iter().cloned().zip(compile_selectors(css)?).collect())
}

impl SourceHeuristicExtractor {
    pub fn new(profile: &SourceProfile) -> Result<Self, ExtractError> {
        Ok(Self {
            default_currency: profile.default_currency.as_deref().and_then(normalize_currency),
            price: compile_named(&profile.price_selectors)?,
            stock_text: compile_named(&profile.stock_selectors)?,
            in_stock: compile_named(&profile.in_stock_selectors)?,
            out_of_stock: compile_named(&profile.out_of_stock_selectors)?,
        })
    }

    fn stock(&self, html: &Html) -> Option<(String, String, bool)> {
        let present = |list: &[(String, Selector)], flag: bool| {
            list.iter().find_map(|(css, sel)| {
                html.select(sel)
                    .next()
                    .map(|el| (css.clone(), el.text().collect::<String>(), flag))
            })
        };
        present(&self.out_of_stock, false)
            .or_else(|| present(&self.in_stock, true))
            .or_else(|| {
                self.stock_text.iter().find_map(|(css, sel)| {
                    html.select(sel).find_map(|el| {
                        let text = el.text().collect::<String>();
                        stock_from_text(&text).map(|flag| (css.clone(), text, flag))
                    })
                })
            })
    }
}

impl Extractor for SourceHeuristicExtractor {
    type Output = CommerceSignal;

    fn parser(&self) -> ParserId {
        ParserId::SourceHeuristic
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<CommerceSignal> {
        let html = doc.html();
        let price = self.price.iter().find_map(|(css, sel)| {
            html.select(sel).find_map(|el| {
                let raw = element_value(el)?;
                parse_price_to_cents(&raw).map(|cents| (css.clone(), raw, cents))
            })
        });
        let stock = self.stock(html);
        if price.is_none() && stock.is_none() {
            return None;
        }

        let currency = price
            .as_ref()
            .and_then(|(_, raw, _)| detect_currency(raw))
            .or_else(|| self.default_currency.clone());
        let confidence = if price.is_some() {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        let pointer = [price.as_ref().map(|p| p.0.as_str()), stock.as_ref().map(|s| s.0.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" | ");
        let snippet = [price.as_ref().map(|p| p.1.as_str()), stock.as_ref().map(|s| s.1.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        Some(CommerceSignal {
            price_cents: price.map(|(_, _, cents)| cents),
            currency,
            in_stock: stock.map(|(_, _, flag)| flag),
            confidence,
            pointer,
            snippet,
        })
    }
}

const OUT_OF_STOCK_PHRASES: [&str; 7] = [
    "out of stock",
    "sold out",
    "currently unavailable",
    "temporarily unavailable",
    "no longer available",
    "discontinued",
    "not available",
];
const IN_STOCK_PHRASES: [&str; 4] = ["in stock", "add to cart", "add to basket", "buy now"];

/// Keyword stock detection; out-of-stock phrases win.
pub fn stock_from_text(text: &str) -> Option<bool> {
    let lower = text.to_lowercase();
    if OUT_OF_STOCK_PHRASES.iter().any(|p| lower.contains(p)) {
        Some(false)
    } else if IN_STOCK_PHRASES.iter().any(|p| lower.contains(p)) {
        Some(true)
    } else {
        None
    }
}

static TEXT_PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:USD|EUR|GBP|CAD|AUD|CA\$|C\$|A\$|[$€£])\s?\d[\d.,]*|\d[\d.,]*\s?(?:USD|EUR|GBP|€))")
        .expect("free text price regex")
});

const SKIPPED_TEXT_TAGS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Rendered text of the document, excluding script-like containers.
pub fn visible_text(html: &Html) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in html.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| SKIPPED_TEXT_TAGS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    parts.join(" ")
}

pub struct FreeTextExtractor;

impl Extractor for FreeTextExtractor {
    type Output = CommerceSignal;

    fn parser(&self) -> ParserId {
        ParserId::FreeText
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<CommerceSignal> {
        let text = visible_text(doc.html());
        let price = TEXT_PRICE
            .find_iter(&text)
            .find_map(|m| parse_price_to_cents(m.as_str()).map(|cents| (m.as_str().to_string(), cents)));
        let in_stock = stock_from_text(&text);
        if price.is_none() && in_stock.is_none() {
            return None;
        }
        let snippet = match &price {
            Some((raw, _)) => raw.clone(),
            None => text.chars().take(120).collect(),
        };
        Some(CommerceSignal {
            price_cents: price.as_ref().map(|(_, cents)| *cents),
            currency: price.as_ref().and_then(|(raw, _)| detect_currency(raw)),
            in_stock,
            confidence: Confidence::Low,
            pointer: "body:text".to_string(),
            snippet,
        })
    }
}

/// Last resort: a 404/410 response means the listing is gone.
pub struct HttpStatusFallback;

impl Extractor for HttpStatusFallback {
    type Output = CommerceSignal;

    fn parser(&self) -> ParserId {
        ParserId::HttpStatus
    }

    fn requires_document(&self) -> bool {
        false
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<CommerceSignal> {
        let status = doc.status()?;
        if !matches!(status, 404 | 410) {
            return None;
        }
        Some(CommerceSignal {
            price_cents: None,
            currency: None,
            in_stock: Some(false),
            confidence: Confidence::Low,
            pointer: "http.status".to_string(),
            snippet: status.to_string(),
        })
    }
}
