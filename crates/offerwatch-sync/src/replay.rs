//! Offline fetcher that answers from captured fixture pages.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use offerwatch_extract::{load_fixture_case, FixtureCase};
use offerwatch_storage::{FetchError, FetchedDocument, PageFetcher};

#[derive(Debug, Clone, Default)]
pub struct FixtureFetcher {
    pages: HashMap<String, FixtureCase>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `case` for requests to `url`; the case's `final_url` becomes
    /// the landing URL, so redirects can be replayed.
    pub fn with_case(mut self, url: impl Into<String>, case: FixtureCase) -> Self {
        self.pages.insert(url.into(), case);
        self
    }

    pub fn with_case_dir(self, url: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let case = load_fixture_case(dir).with_context(|| format!("loading fixture {}", dir.display()))?;
        Ok(self.with_case(url, case))
    }

    /// Loads every `<root>/<source>/<case>/` directory keyed by its final URL.
    pub fn from_fixtures_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut fetcher = Self::new();
        for source in std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
            let source = source?.path();
            if !source.is_dir() {
                continue;
            }
            for case_dir in std::fs::read_dir(&source)? {
                let case_dir = case_dir?.path();
                if !case_dir.join("case.json").exists() {
                    continue;
                }
                let case = load_fixture_case(&case_dir)?;
                fetcher = fetcher.with_case(case.final_url.clone(), case);
            }
        }
        Ok(fetcher)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch(&self, _source_slug: &str, url: &str, _timeout: Duration) -> Result<FetchedDocument, FetchError> {
        let case = self
            .pages
            .get(url)
            .ok_or_else(|| FetchError::NotRecorded { url: url.to_string() })?;
        Ok(FetchedDocument {
            requested_url: url.to_string(),
            final_url: case.final_url.clone(),
            status: case.status.unwrap_or(200),
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: case.body.clone().into_bytes(),
            truncated: false,
            fetched_at: Utc::now(),
            elapsed_ms: 0,
        })
    }
}
