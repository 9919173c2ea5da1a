//! Page rendering for jobwatch: one disposable rendering context per call, DOM snapshot out.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobwatch-fetch";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Structural markers that suggest a page has rendered its job listings.
pub const JOB_STRUCTURE_PROBE: &str =
    r#"a[href*="job"], a[href*="career"], a[href*="position"], .job, .position, .role"#;

static JOB_STRUCTURE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(JOB_STRUCTURE_PROBE).expect("job structure probe is a valid selector"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub requested_url: String,
    pub final_url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub renderer: &'static str,
}

impl PageSnapshot {
    pub fn has_job_structure(&self) -> bool {
        has_job_structure(&self.html)
    }
}

pub fn has_job_structure(html: &str) -> bool {
    Html::parse_document(html)
        .select(&JOB_STRUCTURE_SELECTOR)
        .next()
        .is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderBudget {
    /// Upper bound for loading the page and letting network activity settle.
    pub navigation: Duration,
    /// How long script-driven content may run before the DOM is captured.
    pub settle: Duration,
    /// Extra time allowed for job markup to appear once navigation is done.
    pub selector_wait: Duration,
}

impl Default for RenderBudget {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(30),
            settle: Duration::from_secs(5),
            selector_wait: Duration::from_secs(10),
        }
    }
}

impl RenderBudget {
    pub fn total(&self) -> Duration {
        self.navigation + self.selector_wait
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rendering {url} timed out after {elapsed:?}")]
    Timeout { url: String, elapsed: Duration },
    #[error("no job listing markup found at {url}")]
    NoJobStructure { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("renderer failed: {0}")]
    Render(String),
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, url: &str, budget: &RenderBudget) -> Result<PageSnapshot, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Plain HTTP renderer: no script execution, a fresh client (and cookie state) per call.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    user_agent: String,
    backoff: BackoffPolicy,
}

impl HttpRenderer {
    pub fn new(user_agent: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            user_agent: user_agent.into(),
            backoff,
        }
    }

    async fn fetch_with_retries(&self, url: &str, budget: &RenderBudget) -> Result<PageSnapshot, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(budget.navigation)
            .user_agent(self.user_agent.clone())
            .build()?;

        let mut attempt = 0usize;
        loop {
            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let html = resp.text().await?;
                        return Ok(PageSnapshot {
                            requested_url: url.to_string(),
                            final_url,
                            html,
                            fetched_at: Utc::now(),
                            renderer: self.name(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retryable status; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retryable request error; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

impl Default for HttpRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENT, BackoffPolicy::default())
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn render(&self, url: &str, budget: &RenderBudget) -> Result<PageSnapshot, FetchError> {
        let started = Instant::now();
        let span = info_span!("render", renderer = self.name(), url);
        let snapshot = match tokio::time::timeout(budget.total(), self.fetch_with_retries(url, budget))
            .instrument(span)
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        };

        if !snapshot.has_job_structure() {
            return Err(FetchError::NoJobStructure {
                url: url.to_string(),
            });
        }
        Ok(snapshot)
    }
}

/// A running headless browser with its private profile directory.
///
/// Dropping the session at any point kills the browser process and removes the profile.
struct RenderSession {
    child: Child,
    profile: TempDir,
}

impl RenderSession {
    fn launch(binary: &Path, user_agent: &str, virtual_budget: Duration, url: &str) -> Result<Self, FetchError> {
        let profile = tempfile::Builder::new()
            .prefix("jobwatch-profile-")
            .tempdir()
            .map_err(|e| FetchError::Render(format!("creating browser profile dir: {e}")))?;

        let child = Command::new(binary)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--disable-extensions")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg(format!("--user-agent={user_agent}"))
            .arg(format!("--virtual-time-budget={}", virtual_budget.as_millis()))
            .arg("--dump-dom")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::Render(format!("launching {}: {e}", binary.display())))?;

        Ok(Self { child, profile })
    }

    async fn dump_dom(self, url: &str, deadline: Instant, started: Instant) -> Result<String, FetchError> {
        let RenderSession { child, profile } = self;
        let waited = tokio::time::timeout_at(deadline, child.wait_with_output()).await;
        drop(profile);

        let output = match waited {
            Ok(output) => output.map_err(|e| FetchError::Render(format!("waiting for browser: {e}")))?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Render(format!(
                "browser exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let html = String::from_utf8_lossy(&output.stdout).into_owned();
        if html.trim().is_empty() {
            return Err(FetchError::Render(format!("browser returned an empty DOM for {url}")));
        }
        Ok(html)
    }
}

/// Renders script-driven pages with a headless Chromium binary, one process per call.
#[derive(Debug, Clone)]
pub struct HeadlessChromeRenderer {
    binary: PathBuf,
    user_agent: String,
}

impl HeadlessChromeRenderer {
    pub fn new(binary: impl Into<PathBuf>, user_agent: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            user_agent: user_agent.into(),
        }
    }

    async fn pass(
        &self,
        url: &str,
        virtual_budget: Duration,
        deadline: Instant,
        started: Instant,
    ) -> Result<String, FetchError> {
        RenderSession::launch(&self.binary, &self.user_agent, virtual_budget, url)?
            .dump_dom(url, deadline, started)
            .await
    }
}

#[async_trait]
impl PageRenderer for HeadlessChromeRenderer {
    fn name(&self) -> &'static str {
        "headless-chrome"
    }

    async fn render(&self, url: &str, budget: &RenderBudget) -> Result<PageSnapshot, FetchError> {
        let span = info_span!("render", renderer = self.name(), url);
        async {
            let started = Instant::now();
            let mut html = self
                .pass(url, budget.settle, started + budget.navigation, started)
                .await?;

            if !has_job_structure(&html) {
                debug!("no job markup after settle; re-rendering with selector wait");
                html = self
                    .pass(
                        url,
                        budget.settle + budget.selector_wait,
                        started + budget.total(),
                        started,
                    )
                    .await?;
                if !has_job_structure(&html) {
                    return Err(FetchError::NoJobStructure {
                        url: url.to_string(),
                    });
                }
            }

            Ok(PageSnapshot {
                requested_url: url.to_string(),
                final_url: url.to_string(),
                html,
                fetched_at: Utc::now(),
                renderer: self.name(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOBS_HTML: &str = r#"<html><body><ul><li><a href="/jobs/42">Senior Backend Engineer</a></li></ul></body></html>"#;
    const NO_JOBS_HTML: &str = r#"<html><body><p>Loading...</p></body></html>"#;

    fn quick_budget() -> RenderBudget {
        RenderBudget {
            navigation: Duration::from_secs(5),
            settle: Duration::from_millis(100),
            selector_wait: Duration::from_secs(1),
        }
    }

    fn quick_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn job_structure_probe_matches_links_and_containers() {
        assert!(has_job_structure(JOBS_HTML));
        assert!(has_job_structure(r#"<div class="position">Engineer</div>"#));
        assert!(has_job_structure(r#"<a href="/careers/open">Open roles</a>"#));
        assert!(!has_job_structure(NO_JOBS_HTML));
    }

    #[tokio::test]
    async fn http_renderer_returns_snapshot_with_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/careers")
            .match_header("user-agent", "jobwatch-test/1.0")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(JOBS_HTML)
            .create_async()
            .await;

        let renderer = HttpRenderer::new("jobwatch-test/1.0", quick_backoff(0));
        let url = format!("{}/careers", server.url());
        let snapshot = renderer.render(&url, &quick_budget()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(snapshot.requested_url, url);
        assert_eq!(snapshot.renderer, "http");
        assert!(snapshot.html.contains("Senior Backend Engineer"));
    }

    #[tokio::test]
    async fn http_renderer_rejects_pages_without_job_markup() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/careers")
            .with_status(200)
            .with_body(NO_JOBS_HTML)
            .create_async()
            .await;

        let renderer = HttpRenderer::new(DEFAULT_USER_AGENT, quick_backoff(0));
        let err = renderer
            .render(&format!("{}/careers", server.url()), &quick_budget())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoJobStructure { .. }));
    }

    #[tokio::test]
    async fn http_renderer_retries_server_errors_then_gives_up() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/careers")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let renderer = HttpRenderer::new(DEFAULT_USER_AGENT, quick_backoff(2));
        let err = renderer
            .render(&format!("{}/careers", server.url()), &quick_budget())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn http_renderer_does_not_retry_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/careers")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let renderer = HttpRenderer::new(DEFAULT_USER_AGENT, quick_backoff(3));
        let err = renderer
            .render(&format!("{}/careers", server.url()), &quick_budget())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[cfg(unix)]
    mod headless {
        use super::*;
        use tokio_util::sync::CancellationToken;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Writes a stand-in browser that records its arguments and runs `body`.
        fn fake_browser(dir: &Path, body: &str) -> PathBuf {
            let script = dir.join("fake-chrome");
            let args_file = dir.join("args.txt");
            let calls_file = dir.join("calls.txt");
            let text = format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\necho call >> '{}'\n{}\n",
                args_file.display(),
                calls_file.display(),
                body
            );
            std::fs::write(&script, text).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            script
        }

        fn recorded_profile_dir(dir: &Path) -> PathBuf {
            let args = std::fs::read_to_string(dir.join("args.txt")).unwrap();
            let line = args
                .lines()
                .find_map(|l| l.strip_prefix("--user-data-dir="))
                .unwrap();
            PathBuf::from(line)
        }

        fn recorded_calls(dir: &Path) -> usize {
            std::fs::read_to_string(dir.join("calls.txt")).unwrap().lines().count()
        }

        #[tokio::test]
        async fn renders_and_removes_profile() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!("echo '{JOBS_HTML}'");
            let renderer = HeadlessChromeRenderer::new(fake_browser(dir.path(), &body), "jobwatch-test/1.0");

            let snapshot = renderer
                .render("https://acme.com/careers", &quick_budget())
                .await
                .unwrap();

            assert_eq!(snapshot.renderer, "headless-chrome");
            assert!(snapshot.html.contains("/jobs/42"));
            let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
            assert!(args.lines().any(|l| l == "--user-agent=jobwatch-test/1.0"));
            assert!(args.lines().any(|l| l == "--dump-dom"));
            assert!(args.lines().any(|l| l == "https://acme.com/careers"));
            assert!(!recorded_profile_dir(dir.path()).exists());
            assert_eq!(recorded_calls(dir.path()), 1);
        }

        #[tokio::test]
        async fn second_pass_then_no_structure_error() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!("echo '{NO_JOBS_HTML}'");
            let renderer = HeadlessChromeRenderer::new(fake_browser(dir.path(), &body), DEFAULT_USER_AGENT);

            let err = renderer
                .render("https://acme.com/careers", &quick_budget())
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::NoJobStructure { .. }));
            assert_eq!(recorded_calls(dir.path()), 2);
            assert!(!recorded_profile_dir(dir.path()).exists());
        }

        #[tokio::test]
        async fn timeout_tears_down_session() {
            let dir = tempfile::tempdir().unwrap();
            let renderer = HeadlessChromeRenderer::new(fake_browser(dir.path(), "exec sleep 10"), DEFAULT_USER_AGENT);
            let budget = RenderBudget {
                navigation: Duration::from_millis(300),
                settle: Duration::from_millis(50),
                selector_wait: Duration::from_millis(100),
            };

            let err = renderer.render("https://acme.com/careers", &budget).await.unwrap_err();

            assert!(matches!(err, FetchError::Timeout { .. }));
            assert!(!recorded_profile_dir(dir.path()).exists());
        }

        /// Live and not yet a zombie.
        #[cfg(target_os = "linux")]
        fn process_running(pid: u32) -> bool {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
                Err(_) => false,
            }
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn cancelled_render_kills_browser_and_removes_profile() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("pid.txt");
            let body = format!("echo $$ > '{}'\nexec sleep 30", pid_file.display());
            let renderer = HeadlessChromeRenderer::new(fake_browser(dir.path(), &body), DEFAULT_USER_AGENT);
            let budget = RenderBudget {
                navigation: Duration::from_secs(60),
                settle: Duration::from_millis(50),
                selector_wait: Duration::from_secs(1),
            };

            let read_pid = {
                let pid_file = pid_file.clone();
                move || {
                    std::fs::read_to_string(&pid_file)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok())
                }
            };
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let started = read_pid.clone();
            tokio::spawn(async move {
                while started().is_none() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                trigger.cancel();
            });

            let rendered = tokio::select! {
                _ = cancel.cancelled() => None,
                result = renderer.render("https://acme.com/careers", &budget) => Some(result),
            };
            assert!(rendered.is_none());
            assert!(!recorded_profile_dir(dir.path()).exists());

            let pid = read_pid().unwrap();
            let mut running = process_running(pid);
            for _ in 0..100 {
                if !running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                running = process_running(pid);
            }
            assert!(!running, "browser process {pid} outlived its render");
        }

        #[tokio::test]
        async fn failing_browser_surfaces_render_error() {
            let dir = tempfile::tempdir().unwrap();
            let renderer = HeadlessChromeRenderer::new(
                fake_browser(dir.path(), "echo 'net::ERR_NAME_NOT_RESOLVED' >&2\nexit 1"),
                DEFAULT_USER_AGENT,
            );

            let err = renderer
                .render("https://acme.invalid/careers", &quick_budget())
                .await
                .unwrap_err();

            match err {
                FetchError::Render(message) => assert!(message.contains("ERR_NAME_NOT_RESOLVED")),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
