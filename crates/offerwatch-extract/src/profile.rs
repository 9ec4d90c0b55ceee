//! Per-source extraction and trust-gate configuration loaded from
//! `sources.yaml`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchUrlRules {
    #[serde(default)]
    pub path_prefixes: Vec<String>,
    #[serde(default)]
    pub query_params: Vec<String>,
}

impl SearchUrlRules {
    fn extend(&mut self, other: &SearchUrlRules) {
        extend_unique(&mut self.path_prefixes, &other.path_prefixes);
        extend_unique(&mut self.query_params, &other.query_params);
    }
}

/// Markers shared by every source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDefaults {
    #[serde(default)]
    pub search_url: SearchUrlRules,
    #[serde(default)]
    pub block_markers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub slug: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub search_url: SearchUrlRules,
    #[serde(default)]
    pub block_markers: Vec<String>,
    #[serde(default)]
    pub price_selectors: Vec<String>,
    #[serde(default)]
    pub stock_selectors: Vec<String>,
    #[serde(default)]
    pub in_stock_selectors: Vec<String>,
    #[serde(default)]
    pub out_of_stock_selectors: Vec<String>,
    #[serde(default)]
    pub image_selectors: Vec<String>,
    #[serde(default)]
    pub image_map_attributes: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceProfile {
    /// Profile with no source-specific heuristics.
    pub fn generic(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            display_name: slug.to_string(),
            enabled: true,
            ..Self::default()
        }
    }

    pub fn has_source_heuristics(&self) -> bool {
        !(self.price_selectors.is_empty()
            && self.stock_selectors.is_empty()
            && self.in_stock_selectors.is_empty()
            && self.out_of_stock_selectors.is_empty())
    }

    fn with_defaults(mut self, defaults: &ProfileDefaults) -> Self {
        self.search_url.extend(&defaults.search_url);
        extend_unique(&mut self.block_markers, &defaults.block_markers);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub defaults: ProfileDefaults,
    #[serde(default)]
    pub sources: Vec<SourceProfile>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Resolved profile for `slug` with shared defaults merged in; unknown
    /// sources get a generic profile.
    pub fn profile(&self, slug: &str) -> SourceProfile {
        self.sources
            .iter()
            .find(|p| p.slug == slug)
            .cloned()
            .unwrap_or_else(|| SourceProfile::generic(slug))
            .with_defaults(&self.defaults)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceProfile> {
        self.sources.iter().filter(|p| p.enabled)
    }

    /// Slugs switched off with `enabled: false`.
    pub fn disabled_slugs(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|p| !p.enabled)
            .map(|p| p.slug.clone())
            .collect()
    }
}

fn extend_unique(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r##"
defaults:
  search_url:
    path_prefixes: ["/search"]
    query_params: ["q"]
  block_markers: ["Just a moment..."]
sources:
  - slug: amazon
    display_name: Amazon
    search_url:
      path_prefixes: ["/s"]
      query_params: ["k"]
    block_markers: ["Enter the characters you see below"]
    price_selectors: ["#corePrice_feature_div .a-offscreen"]
  - slug: retired
    enabled: false
"##;

    #[test]
    fn profile_merges_defaults() {
        let registry = SourceRegistry::from_yaml_str(YAML).unwrap();
        let amazon = registry.profile("amazon");
        assert_eq!(amazon.search_url.path_prefixes, vec!["/s", "/search"]);
        assert_eq!(amazon.search_url.query_params, vec!["k", "q"]);
        assert_eq!(amazon.block_markers.len(), 2);
        assert!(amazon.has_source_heuristics());
    }

    #[test]
    fn unknown_source_gets_generic_profile_with_defaults() {
        let registry = SourceRegistry::from_yaml_str(YAML).unwrap();
        let profile = registry.profile("aquashop");
        assert_eq!(profile.slug, "aquashop");
        assert!(!profile.has_source_heuristics());
        assert_eq!(profile.block_markers, vec!["Just a moment..."]);
        assert_eq!(registry.enabled_sources().count(), 1);
        assert_eq!(registry.disabled_slugs(), vec!["retired"]);
        assert!(!registry.profile("retired").enabled);
    }
}
