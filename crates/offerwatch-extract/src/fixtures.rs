//! Captured pages under `fixtures/<source>/<case>/` used by golden tests and
//! offline replays.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::PageDocument;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureCase {
    pub source: String,
    pub final_url: String,
    pub status: Option<u16>,
    #[serde(skip)]
    pub body: String,
}

impl FixtureCase {
    pub fn document(&self) -> PageDocument {
        PageDocument::parse(&self.final_url, self.status, &self.body)
    }
}

/// Reads `case.json` and `page.html` from a fixture directory.
pub fn load_fixture_case(dir: impl AsRef<Path>) -> Result<FixtureCase> {
    let dir = dir.as_ref();
    let meta_path = dir.join("case.json");
    let text = fs::read_to_string(&meta_path)
        .with_context(|| format!("reading {}", meta_path.display()))?;
    let mut case: FixtureCase = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", meta_path.display()))?;
    let page_path = dir.join("page.html");
    case.body = fs::read_to_string(&page_path)
        .with_context(|| format!("reading {}", page_path.display()))?;
    Ok(case)
}
