//! Product image candidates and URL hygiene.

use std::sync::LazyLock;

use offerwatch_core::ParserId;
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use crate::commerce::{ld_nodes, ld_type_is};
use crate::{compile_selector, compile_selectors, ExtractError, Extractor, PageDocument, SourceProfile};

const MAX_IMAGE_URL_LEN: usize = 2048;

const REJECTED_SCHEMES: [&str; 6] = ["data:", "blob:", "javascript:", "vbscript:", "file:", "about:"];

const PLACEHOLDER_PATTERNS: [&str; 8] = [
    "placeholder",
    "no-image",
    "noimage",
    "no_image",
    "image-coming-soon",
    "spacer.gif",
    "pixel.gif",
    "transparent.gif",
];

/// `1x1` only as a whole filename or path token, so `11x14.jpg` survives.
static TRACKING_PIXEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[/_.=-])1x1([/_.-]|$)").expect("tracking pixel regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub url: String,
    pub pointer: String,
}

impl ImageCandidate {
    fn new(url: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pointer: pointer.into(),
        }
    }
}

/// Rejects unsafe or placeholder values before any URL resolution.
fn sanitize_image_url(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_IMAGE_URL_LEN {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if REJECTED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
        return None;
    }
    if trimmed.chars().any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '"')) {
        return None;
    }
    if PLACEHOLDER_PATTERNS.iter().any(|p| lower.contains(p)) || TRACKING_PIXEL.is_match(&lower) {
        return None;
    }
    Some(trimmed)
}

/// Resolves `raw` against the page URL and returns an absolute http(s) URL
/// without fragment, or `None` when the value is unusable.
pub fn normalize_image_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let candidate = sanitize_image_url(raw)?;
    let mut url = match Url::parse(candidate) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(candidate).ok()?,
        Err(_) => return None,
    };
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    let out = url.to_string();
    (out.len() <= MAX_IMAGE_URL_LEN).then_some(out)
}

fn json_image_urls(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(s) => vec![s.clone()],
        JsonValue::Array(items) => items.iter().flat_map(json_image_urls).collect(),
        JsonValue::Object(map) => ["url", "contentUrl"]
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_str))
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub struct JsonLdImageExtractor;

impl Extractor for JsonLdImageExtractor {
    type Output = Vec<ImageCandidate>;

    fn parser(&self) -> ParserId {
        ParserId::JsonLd
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<Vec<ImageCandidate>> {
        let mut out = Vec::new();
        for (block_idx, block) in doc.json_ld_blocks().iter().enumerate() {
            for node in ld_nodes(block) {
                if !(ld_type_is(node, "Product") || node.get("offers").is_some()) {
                    continue;
                }
                if let Some(image) = node.get("image") {
                    out.extend(
                        json_image_urls(image)
                            .into_iter()
                            .map(|url| ImageCandidate::new(url, format!("ld+json[{block_idx}].image"))),
                    );
                }
            }
        }
        (!out.is_empty()).then_some(out)
    }
}

const META_IMAGE: [&str; 5] = [
    r#"meta[property="og:image:secure_url"]"#,
    r#"meta[property="og:image"]"#,
    r#"meta[name="twitter:image"]"#,
    r#"meta[itemprop="image"]"#,
    r#"link[rel="image_src"]"#,
];

pub struct MetaImageExtractor {
    selectors: Vec<(&'static str, Selector)>,
}

impl MetaImageExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        let selectors = META_IMAGE
            .iter()
            .map(|css| compile_selector(css).map(|sel| (*css, sel)))
            .collect::<Result<_, _>>()?;
        Ok(Self { selectors })
    }
}

impl Extractor for MetaImageExtractor {
    type Output = Vec<ImageCandidate>;

    fn parser(&self) -> ParserId {
        ParserId::MetaTags
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<Vec<ImageCandidate>> {
        let out: Vec<ImageCandidate> = self
            .selectors
            .iter()
            .flat_map(|(css, sel)| {
                doc.html().select(sel).filter_map(|el| {
                    el.value()
                        .attr("content")
                        .or_else(|| el.value().attr("href"))
                        .map(|url| ImageCandidate::new(url, *css))
                })
            })
            .collect();
        (!out.is_empty()).then_some(out)
    }
}

const IMAGE_ATTRIBUTES: [&str; 4] = ["data-old-hires", "data-zoom-image", "data-src", "src"];

/// Source-specific image DOM: dynamic image maps first, then selectors.
pub struct SourceDomImageExtractor {
    map_attributes: Vec<(String, Selector)>,
    selectors: Vec<(String, Selector)>,
}

impl SourceDomImageExtractor {
    pub fn new(profile: &SourceProfile) -> Result<Self, ExtractError> {
        let map_css: Vec<String> = profile
            .image_map_attributes
            .iter()
            .map(|attr| format!("[{attr}]"))
            .collect();
        let map_attributes = profile
            .image_map_attributes
            .iter()
            .cloned()
            .zip(compile_selectors(&map_css)?)
            .collect();
        let selectors = profile
            .image_selectors
            .iter()
            .cloned()
            .zip(compile_selectors(&profile.image_selectors)?)
            .collect();
        Ok(Self {
            map_attributes,
            selectors,
        })
    }
}

/// Picks the largest entry of a `{"url": [width, height]}` attribute map.
fn largest_from_image_map(raw: &str) -> Option<String> {
    let map: serde_json::Map<String, JsonValue> = serde_json::from_str(raw).ok()?;
    map.into_iter()
        .map(|(url, dims)| {
            let area = dims
                .as_array()
                .map(|d| d.iter().filter_map(JsonValue::as_u64).product::<u64>())
                .unwrap_or(0);
            (area, url)
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, url)| url)
}

/// Last (usually widest) entry of a `srcset` list.
fn last_srcset_url(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .filter_map(|entry| entry.split_whitespace().next())
        .last()
}

impl Extractor for SourceDomImageExtractor {
    type Output = Vec<ImageCandidate>;

    fn parser(&self) -> ParserId {
        ParserId::SourceHeuristic
    }

    fn try_extract(&self, doc: &PageDocument) -> Option<Vec<ImageCandidate>> {
        let html = doc.html();
        let mut out = Vec::new();

        for (attr, sel) in &self.map_attributes {
            for el in html.select(sel) {
                if let Some(url) = el.value().attr(attr).and_then(largest_from_image_map) {
                    out.push(ImageCandidate::new(url, format!("[{attr}]")));
                }
            }
        }

        for (css, sel) in &self.selectors {
            for el in html.select(sel) {
                for attr in IMAGE_ATTRIBUTES {
                    if let Some(url) = el.value().attr(attr) {
                        out.push(ImageCandidate::new(url, format!("{css}@{attr}")));
                    }
                }
                if let Some(url) = el.value().attr("srcset").and_then(last_srcset_url) {
                    out.push(ImageCandidate::new(url, format!("{css}@srcset")));
                }
            }
        }

        (!out.is_empty()).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://shop.example/p/java-fern").unwrap()
    }

    #[test]
    fn normalizes_relative_and_protocol_relative_urls() {
        assert_eq!(
            normalize_image_url("/img/fern.jpg#zoom", Some(&base())).as_deref(),
            Some("https://shop.example/img/fern.jpg")
        );
        assert_eq!(
            normalize_image_url("//cdn.example/fern.webp", Some(&base())).as_deref(),
            Some("https://cdn.example/fern.webp")
        );
        assert_eq!(normalize_image_url("/img/fern.jpg", None), None);
    }

    #[test]
    fn rejects_unsafe_and_placeholder_urls() {
        for raw in [
            "data:image/png;base64,AAAA",
            "javascript:alert(1)",
            "ftp://cdn.example/a.jpg",
            "https://cdn.example/a b.jpg",
            "https://cdn.example/<x>.jpg",
            "https://cdn.example/img/placeholder.png",
            "https://cdn.example/1x1.gif",
            "https://cdn.example/img/shim_1x1_white.png",
            "https://cdn.example/px-1x1-trans.png",
            "",
        ] {
            assert_eq!(normalize_image_url(raw, Some(&base())), None, "{raw}");
        }
        let long = format!("https://cdn.example/{}.jpg", "a".repeat(MAX_IMAGE_URL_LEN));
        assert_eq!(normalize_image_url(&long, Some(&base())), None);
    }

    #[test]
    fn dimension_like_filenames_are_not_tracking_pixels() {
        for raw in [
            "https://cdn.example/prints/11x14.jpg",
            "https://cdn.example/banner-21x10-hero.jpg",
            "https://cdn.example/tank_1x12.jpg",
        ] {
            assert_eq!(normalize_image_url(raw, Some(&base())).as_deref(), Some(raw), "{raw}");
        }
    }

    #[test]
    fn dynamic_image_map_prefers_largest_area() {
        let raw = r#"{"https://m.media.example/I/small.jpg":[200,200],"https://m.media.example/I/large.jpg":[1500,1000]}"#;
        assert_eq!(
            largest_from_image_map(raw).as_deref(),
            Some("https://m.media.example/I/large.jpg")
        );
        assert_eq!(largest_from_image_map("not json"), None);
    }

    #[test]
    fn srcset_takes_last_entry() {
        assert_eq!(last_srcset_url("a.jpg 1x, b.jpg 2x"), Some("b.jpg"));
    }

    #[test]
    fn json_ld_image_accepts_strings_arrays_and_objects() {
        let html = r#"<script type="application/ld+json">
            {"@type":"Product","image":[{"@type":"ImageObject","url":"https://cdn.example/a.jpg"},"https://cdn.example/b.jpg"]}
        </script>"#;
        let doc = PageDocument::parse("https://shop.example/p/1", Some(200), html);
        let urls: Vec<String> = JsonLdImageExtractor
            .try_extract(&doc)
            .unwrap()
            .into_iter()
            .map(|c| c.url)
            .collect();
        assert_eq!(urls, vec!["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"]);
    }
}
