//! Delivery of new-posting alerts.

use std::fmt::Write as _;

use async_trait::async_trait;
use jobwatch_core::Posting;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Result of one delivery attempt. A failed delivery never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotifyOutcome {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<(), NotificationError>> for NotifyOutcome {
    fn from(result: Result<(), NotificationError>) -> Self {
        match result {
            Ok(()) => Self::delivered(),
            Err(err) => Self::failed(err),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, destination: &str, postings: &[Posting], organization: &str) -> NotifyOutcome;
}

pub fn alert_subject(count: usize, organization: &str) -> String {
    let noun = if count == 1 { "position" } else { "positions" };
    format!("New Job Alert: {count} new {noun} at {organization}")
}

pub fn alert_body(postings: &[Posting], organization: &str) -> String {
    let mut body = format!(
        "{} new position(s) were posted at {organization}.\n\n",
        postings.len()
    );
    for posting in postings {
        let _ = writeln!(body, "{}", posting.title);
        if !posting.location.is_empty() {
            let _ = writeln!(body, "  Location: {}", posting.location);
        }
        let _ = writeln!(body, "  Link: {}", posting.url);
        let _ = writeln!(body, "  Discovered: {}", posting.discovered_at.format("%Y-%m-%d"));
        body.push('\n');
    }
    body
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub user: String,
    pub pass: String,
    pub from: String,
}

/// Plain-text alerts over authenticated SMTP.
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotificationError> {
        let from = parse_mailbox(&settings.from)?;
        let creds = Credentials::new(settings.user.clone(), settings.pass.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?
            .credentials(creds)
            .build();
        Ok(Self { mailer, from })
    }

    async fn send(&self, destination: &str, postings: &[Posting], organization: &str) -> Result<(), NotificationError> {
        let msg = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(destination)?)
            .subject(alert_subject(postings.len(), organization))
            .header(header::ContentType::TEXT_PLAIN)
            .body(alert_body(postings, organization))?;
        self.mailer.send(msg).await?;
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotificationError> {
    address.parse().map_err(|source| NotificationError::Address {
        address: address.to_string(),
        source,
    })
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn notify(&self, destination: &str, postings: &[Posting], organization: &str) -> NotifyOutcome {
        let outcome = NotifyOutcome::from(self.send(destination, postings, organization).await);
        if let Some(err) = &outcome.error {
            warn!(%destination, organization, error = %err, "alert email not sent");
        }
        outcome
    }
}

/// Writes alerts to the log; used when no SMTP relay is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, destination: &str, postings: &[Posting], organization: &str) -> NotifyOutcome {
        info!(
            %destination,
            organization,
            subject = %alert_subject(postings.len(), organization),
            "alert"
        );
        for posting in postings {
            info!(title = %posting.title, location = %posting.location, url = %posting.url, "alert posting");
        }
        NotifyOutcome::delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobwatch_core::{CandidatePosting, WatchTarget};

    fn postings() -> Vec<Posting> {
        let target = WatchTarget::new("https://acme.com/careers", "Acme", "a@example.com");
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().unwrap();
        vec![
            Posting::from_candidate(
                &target,
                CandidatePosting {
                    title: "Backend Engineer".into(),
                    location: "Remote".into(),
                    url: "https://acme.com/jobs/1".into(),
                },
                at,
            ),
            Posting::from_candidate(
                &target,
                CandidatePosting {
                    title: "Data Analyst".into(),
                    location: String::new(),
                    url: "https://acme.com/jobs/2".into(),
                },
                at,
            ),
        ]
    }

    #[test]
    fn subject_pluralizes() {
        assert_eq!(alert_subject(1, "Acme"), "New Job Alert: 1 new position at Acme");
        assert_eq!(alert_subject(3, "Acme"), "New Job Alert: 3 new positions at Acme");
    }

    #[test]
    fn body_lists_each_posting() {
        let body = alert_body(&postings(), "Acme");
        assert!(body.starts_with("2 new position(s) were posted at Acme."));
        assert!(body.contains("Backend Engineer\n  Location: Remote\n  Link: https://acme.com/jobs/1\n  Discovered: 2026-05-04"));
        assert!(body.contains("Data Analyst\n  Link: https://acme.com/jobs/2"));
    }

    #[test]
    fn outcome_from_error_carries_message() {
        let err = parse_mailbox("not an address").unwrap_err();
        let outcome = NotifyOutcome::from(Err(err));
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not an address"));
    }

    #[test]
    fn email_notifier_rejects_bad_sender() {
        let settings = SmtpSettings {
            host: "smtp.example.com".into(),
            user: "user".into(),
            pass: "pass".into(),
            from: "nope".into(),
        };
        assert!(matches!(
            EmailNotifier::new(&settings),
            Err(NotificationError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn email_to_invalid_destination_is_a_soft_failure() {
        let settings = SmtpSettings {
            host: "smtp.example.com".into(),
            user: "user".into(),
            pass: "pass".into(),
            from: "alerts@example.com".into(),
        };
        let notifier = EmailNotifier::new(&settings).unwrap();
        let outcome = notifier.notify("definitely not an address", &postings(), "Acme").await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn log_notifier_always_delivers() {
        let outcome = LogNotifier.notify("a@example.com", &postings(), "Acme").await;
        assert_eq!(outcome, NotifyOutcome::delivered());
    }
}
