use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use jobwatch_adapters::{AdapterRegistry, ExtractionAdapter, HeuristicAdapter};
use jobwatch_core::{CandidatePosting, WatchTarget};
use jobwatch_fetch::PageSnapshot;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_snapshot(fixture: &str, url: &str) -> PageSnapshot {
    let path = workspace_root().join("fixtures").join(fixture).join("listing.html");
    let html = fs::read_to_string(&path).expect("fixture html");
    assert!(jobwatch_fetch::has_job_structure(&html), "{} lacks job structure", path.display());
    PageSnapshot {
        requested_url: url.to_string(),
        final_url: url.to_string(),
        html,
        fetched_at: Utc::now(),
        renderer: "fixture",
    }
}

fn extract(fixture: &str, url: &str, keywords: &[&str]) -> Vec<CandidatePosting> {
    let target = WatchTarget::new(url, "Acme", "alerts@example.com").with_keywords(keywords.iter().copied());
    HeuristicAdapter::new()
        .unwrap()
        .extract(&fixture_snapshot(fixture, url), &target)
        .unwrap()
}

#[test]
fn acme_careers_uses_data_job_id_matcher() {
    let found = extract("acme-careers", "https://acme.com/careers", &[]);
    let titles: Vec<&str> = found.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "Senior Backend Engineer",
            "UX Designer",
            "Site Reliability Engineer",
            "Data Platform Engineer",
        ]
    );

    assert_eq!(found[0].url, "https://acme.com/jobs/42");
    assert_eq!(found[0].location, "San Francisco, CA");
    assert_eq!(found[1].location, "Remote");
    assert_eq!(found[2].url, "https://jobs.acme-partner.com/postings/44");
    assert_eq!(found[2].location, "Hybrid");
    assert_eq!(found[3].url, "https://acme.com/positions/45");
    assert_eq!(found[3].location, "");
}

#[test]
fn acme_careers_keyword_filter() {
    let found = extract("acme-careers", "https://acme.com/careers", &["ENGINEER"]);
    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|c| c.title.to_lowercase().contains("engineer")));
}

#[test]
fn generic_board_falls_back_to_href_matcher() {
    let found = extract("generic-board", "https://globex.example/careers", &[]);
    let urls: Vec<&str> = found.iter().map(|c| c.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://globex.example/job/1001",
            "https://globex.example/job/1002",
            "https://globex.example/job/1004",
        ]
    );
    assert_eq!(found[0].title, "Platform Engineer, Kubernetes");
    assert_eq!(found[0].location, "Portland, OR");
    assert_eq!(found[1].location, "Remote");
    assert_eq!(found[2].location, "");
}

#[test]
fn page_without_listings_yields_nothing() {
    assert!(extract("no-listings", "https://initech.example/careers", &[]).is_empty());
}

#[test]
fn builtin_override_hosts_match_heuristic_output() {
    let registry = AdapterRegistry::with_builtin_overrides().unwrap();
    let url = "https://apple.com/careers";
    let target = WatchTarget::new(url, "Apple", "alerts@example.com");
    let snapshot = fixture_snapshot("acme-careers", url);

    assert_eq!(registry.adapter_for_url(url).name(), "apple.com");
    let via_override = registry.extract(&snapshot, &target).unwrap();
    let via_heuristic = HeuristicAdapter::new().unwrap().extract(&snapshot, &target).unwrap();
    assert_eq!(via_override, via_heuristic);
}
