//! Posting extraction from rendered career pages.
//!
//! A page is matched against a ranked list of selector strategies; the first strategy that
//! yields a usable posting wins. Host-specific adapters can be registered to replace the
//! heuristic for a single career site.

use std::collections::HashMap;
use std::sync::Arc;

use jobwatch_core::{CandidatePosting, WatchTarget};
use jobwatch_fetch::PageSnapshot;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "jobwatch-adapters";

/// Titles must be strictly longer than this to count as postings.
pub const MIN_TITLE_CHARS: usize = 5;
pub const MAX_CANDIDATES: usize = 50;

pub const DEFAULT_MATCHER_SELECTORS: [&str; 8] = [
    "[data-job-id] a",
    ".job-title a",
    ".job-listing a",
    ".position a",
    ".role a",
    r#"a[href*="job"]"#,
    r#"a[href*="career"]"#,
    r#"a[href*="position"]"#,
];

pub const BUILTIN_OVERRIDE_HOSTS: [&str; 3] = ["google.com", "microsoft.com", "apple.com"];

static CITY_STATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][a-zA-Z.'-]+(?: [A-Z][a-zA-Z.'-]+)*, *[A-Z]{2}\b")
        .expect("city/state pattern compiles")
});
static WORK_MODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(remote|hybrid)\b").expect("work mode pattern compiles"));
static LOCATION_CONTAINER: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div, li, tr").expect("container selector parses"));

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("snapshot of {url} has an empty body")]
    EmptySnapshot { url: String },
    #[error("source url {url:?} cannot be parsed: {source}")]
    SourceUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("matcher selector {selector:?} is invalid: {message}")]
    Selector { selector: String, message: String },
}

/// Per-page context shared by all matchers.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    pub base_url: &'a Url,
}

pub trait PostingMatcher: Send + Sync {
    fn name(&self) -> &str;
    fn match_candidates(&self, document: &Html, ctx: &MatchContext<'_>) -> Vec<CandidatePosting>;
}

/// Matches anchors by CSS selector.
#[derive(Debug, Clone)]
pub struct SelectorMatcher {
    css: String,
    selector: Selector,
}

impl SelectorMatcher {
    pub fn new(css: &str) -> Result<Self, ExtractionError> {
        let selector = Selector::parse(css).map_err(|e| ExtractionError::Selector {
            selector: css.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            css: css.to_string(),
            selector,
        })
    }
}

impl PostingMatcher for SelectorMatcher {
    fn name(&self) -> &str {
        &self.css
    }

    fn match_candidates(&self, document: &Html, ctx: &MatchContext<'_>) -> Vec<CandidatePosting> {
        document
            .select(&self.selector)
            .filter_map(|element| candidate_from_element(element, ctx.base_url))
            .collect()
    }
}

fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Builds a candidate from an anchor, or `None` when it cannot be a posting link.
pub fn candidate_from_element(element: ElementRef<'_>, base_url: &Url) -> Option<CandidatePosting> {
    let mut title = normalize_whitespace(&element.text().collect::<String>());
    if title.is_empty() {
        title = normalize_whitespace(element.value().attr("title").unwrap_or_default());
    }
    if title.chars().count() <= MIN_TITLE_CHARS {
        return None;
    }

    let href = element.value().attr("href").map(str::trim).unwrap_or_default();
    if href.is_empty() {
        return None;
    }
    let url = base_url.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let location = infer_location(element).unwrap_or_default();
    Some(CandidatePosting {
        title,
        location,
        url: url.to_string(),
    })
}

/// Location from the nearest `div`/`li`/`tr` around the anchor, falling back to a
/// location mentioned in the anchor text itself.
pub fn infer_location(anchor: ElementRef<'_>) -> Option<String> {
    let container = anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| LOCATION_CONTAINER.matches(el));

    if let Some(container) = container {
        let anchor_id = anchor.id();
        let surrounding = container
            .descendants()
            .filter(|node| !node.ancestors().any(|a| a.id() == anchor_id))
            .filter_map(|node| node.value().as_text().map(|t| normalize_whitespace(t)))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(found) = location_in_text(&surrounding) {
            return Some(found);
        }
    }

    let own = normalize_whitespace(&anchor.text().collect::<String>());
    location_in_text(&own)
}

/// Earliest "City, ST" or Remote/Hybrid token in `text`.
pub fn location_in_text(text: &str) -> Option<String> {
    let city = CITY_STATE_RE.find(text);
    let mode = WORK_MODE_RE.find(text);
    match (city, mode) {
        (Some(c), Some(m)) if m.start() < c.start() => Some(canonical_work_mode(m.as_str())),
        (Some(c), _) => Some(c.as_str().to_string()),
        (None, Some(m)) => Some(canonical_work_mode(m.as_str())),
        (None, None) => None,
    }
}

fn canonical_work_mode(raw: &str) -> String {
    if raw.eq_ignore_ascii_case("remote") {
        "Remote".to_string()
    } else {
        "Hybrid".to_string()
    }
}

pub trait ExtractionAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn extract(
        &self,
        snapshot: &PageSnapshot,
        target: &WatchTarget,
    ) -> Result<Vec<CandidatePosting>, ExtractionError>;
}

/// Ranked selector matching for arbitrary career pages.
pub struct HeuristicAdapter {
    matchers: Vec<Box<dyn PostingMatcher>>,
}

impl HeuristicAdapter {
    pub fn new() -> Result<Self, ExtractionError> {
        Self::with_selectors(&DEFAULT_MATCHER_SELECTORS)
    }

    pub fn with_selectors(selectors: &[&str]) -> Result<Self, ExtractionError> {
        let matchers = selectors
            .iter()
            .map(|css| SelectorMatcher::new(css).map(|m| Box::new(m) as Box<dyn PostingMatcher>))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matchers })
    }

    pub fn with_matchers(matchers: Vec<Box<dyn PostingMatcher>>) -> Self {
        Self { matchers }
    }

    pub fn matcher_names(&self) -> Vec<&str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }
}

impl ExtractionAdapter for HeuristicAdapter {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn extract(
        &self,
        snapshot: &PageSnapshot,
        target: &WatchTarget,
    ) -> Result<Vec<CandidatePosting>, ExtractionError> {
        if snapshot.html.trim().is_empty() {
            return Err(ExtractionError::EmptySnapshot {
                url: snapshot.requested_url.clone(),
            });
        }
        let base_url = Url::parse(&target.source_url).map_err(|source| ExtractionError::SourceUrl {
            url: target.source_url.clone(),
            source,
        })?;

        let document = Html::parse_document(&snapshot.html);
        let ctx = MatchContext {
            base_url: &base_url,
        };

        let Some((matcher, candidates)) = self
            .matchers
            .iter()
            .map(|m| (m.name(), m.match_candidates(&document, &ctx)))
            .find(|(_, found)| !found.is_empty())
        else {
            debug!(url = %target.source_url, "no matcher produced candidates");
            return Ok(Vec::new());
        };

        let total = candidates.len();
        let kept: Vec<CandidatePosting> = candidates
            .into_iter()
            .filter(|c| target.matches_keywords(&c.title))
            .take(MAX_CANDIDATES)
            .collect();
        debug!(
            url = %target.source_url,
            matcher,
            matched = total,
            kept = kept.len(),
            "extracted candidates"
        );
        Ok(kept)
    }
}

/// Site-specific hook for a single host; currently runs the heuristic.
pub struct HostOverrideAdapter {
    host: String,
    inner: HeuristicAdapter,
}

impl HostOverrideAdapter {
    pub fn new(host: impl Into<String>) -> Result<Self, ExtractionError> {
        Ok(Self {
            host: host.into(),
            inner: HeuristicAdapter::new()?,
        })
    }
}

impl ExtractionAdapter for HostOverrideAdapter {
    fn name(&self) -> &str {
        &self.host
    }

    fn extract(
        &self,
        snapshot: &PageSnapshot,
        target: &WatchTarget,
    ) -> Result<Vec<CandidatePosting>, ExtractionError> {
        self.inner.extract(snapshot, target)
    }
}

/// Exact-host dispatch to extraction adapters, falling back to the heuristic.
#[derive(Clone)]
pub struct AdapterRegistry {
    fallback: Arc<dyn ExtractionAdapter>,
    overrides: HashMap<String, Arc<dyn ExtractionAdapter>>,
}

impl AdapterRegistry {
    pub fn new(fallback: Arc<dyn ExtractionAdapter>) -> Self {
        Self {
            fallback,
            overrides: HashMap::new(),
        }
    }

    pub fn with_builtin_overrides() -> Result<Self, ExtractionError> {
        let mut registry = Self::new(Arc::new(HeuristicAdapter::new()?));
        for host in BUILTIN_OVERRIDE_HOSTS {
            registry.register(host, Arc::new(HostOverrideAdapter::new(host)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, host: impl Into<String>, adapter: Arc<dyn ExtractionAdapter>) {
        self.overrides.insert(host.into(), adapter);
    }

    pub fn adapter_for_url(&self, source_url: &str) -> Arc<dyn ExtractionAdapter> {
        Url::parse(source_url)
            .ok()
            .and_then(|url| url.host_str().and_then(|host| self.overrides.get(host).cloned()))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn extract(
        &self,
        snapshot: &PageSnapshot,
        target: &WatchTarget,
    ) -> Result<Vec<CandidatePosting>, ExtractionError> {
        let adapter = self.adapter_for_url(&target.source_url);
        debug!(adapter = adapter.name(), target_id = %target.id, "dispatching extraction");
        adapter.extract(snapshot, target)
    }
}
