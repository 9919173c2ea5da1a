//! Persistence for watch targets and discovered postings.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{FingerprintId, Posting, SeenHistory, WatchTarget};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("target {0} not found")]
    UnknownTarget(Uuid),
    #[error("stored {column} is invalid: {message}")]
    Decode { column: &'static str, message: String },
    #[error("targets file {path}: {source}")]
    TargetsFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("targets file {path} is not valid yaml: {source}")]
    TargetsFileYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// State written back after a successful check of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUpdate {
    pub last_checked: DateTime<Utc>,
    pub history: SeenHistory,
}

impl TargetUpdate {
    pub fn from_target(target: &WatchTarget, fallback: DateTime<Utc>) -> Self {
        Self {
            last_checked: target.last_checked.unwrap_or(fallback),
            history: target.history.clone(),
        }
    }
}

/// Each call is atomic on its own; there is no cross-call transaction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn load_active_targets(&self) -> Result<Vec<WatchTarget>, PersistenceError>;

    async fn load_target(&self, id: Uuid) -> Result<Option<WatchTarget>, PersistenceError>;

    /// Inserts postings, ignoring any already stored for the same target and fingerprint.
    /// Returns how many rows were written.
    async fn save_new_postings(&self, postings: &[Posting]) -> Result<usize, PersistenceError>;

    async fn update_target(&self, id: Uuid, update: TargetUpdate) -> Result<(), PersistenceError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TargetsFile {
    targets: Vec<WatchTarget>,
}

/// Process-local store, seeded from a YAML targets file or built directly in tests.
///
/// When loaded with [`MemoryAlertStore::from_yaml_file`], every target update rewrites
/// that file so seen history survives restarts. Postings themselves stay in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    targets: RwLock<Vec<WatchTarget>>,
    postings: RwLock<Vec<Posting>>,
    backing_file: Option<PathBuf>,
}

impl MemoryAlertStore {
    pub fn new(targets: Vec<WatchTarget>) -> Self {
        Self {
            targets: RwLock::new(targets),
            postings: RwLock::new(Vec::new()),
            backing_file: None,
        }
    }

    pub fn from_yaml_str(yaml: &str, origin: &Path) -> Result<Self, PersistenceError> {
        let parsed: TargetsFile =
            serde_yaml::from_str(yaml).map_err(|source| PersistenceError::TargetsFileYaml {
                path: origin.to_path_buf(),
                source,
            })?;
        Ok(Self::new(parsed.targets))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| PersistenceError::TargetsFileIo {
            path: path.to_path_buf(),
            source,
        })?;
        let mut store = Self::from_yaml_str(&yaml, path)?;
        store.backing_file = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn backing_file(&self) -> Option<&Path> {
        self.backing_file.as_deref()
    }

    pub async fn targets(&self) -> Vec<WatchTarget> {
        self.targets.read().await.clone()
    }

    pub async fn target(&self, id: Uuid) -> Option<WatchTarget> {
        self.targets.read().await.iter().find(|t| t.id == id).cloned()
    }

    pub async fn postings(&self) -> Vec<Posting> {
        self.postings.read().await.clone()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn load_active_targets(&self) -> Result<Vec<WatchTarget>, PersistenceError> {
        Ok(self
            .targets
            .read()
            .await
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect())
    }

    async fn load_target(&self, id: Uuid) -> Result<Option<WatchTarget>, PersistenceError> {
        Ok(self.target(id).await)
    }

    async fn save_new_postings(&self, postings: &[Posting]) -> Result<usize, PersistenceError> {
        let mut stored = self.postings.write().await;
        let mut inserted = 0;
        for posting in postings {
            let duplicate = stored
                .iter()
                .any(|p| p.target_id == posting.target_id && p.fingerprint == posting.fingerprint);
            if !duplicate {
                stored.push(posting.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn update_target(&self, id: Uuid, update: TargetUpdate) -> Result<(), PersistenceError> {
        let mut targets = self.targets.write().await;
        let target = targets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(PersistenceError::UnknownTarget(id))?;
        target.last_checked = Some(update.last_checked);
        target.history = update.history;

        if let Some(path) = &self.backing_file {
            write_targets_file(path, &targets).await?;
        }
        Ok(())
    }
}

/// Replaces `path` through a sibling temp file so a crash never leaves it half written.
async fn write_targets_file(path: &Path, targets: &[WatchTarget]) -> Result<(), PersistenceError> {
    let yaml = serde_yaml::to_string(&TargetsFile {
        targets: targets.to_vec(),
    })
    .map_err(|source| PersistenceError::TargetsFileYaml {
        path: path.to_path_buf(),
        source,
    })?;
    let io_err = |source| PersistenceError::TargetsFileIo {
        path: path.to_path_buf(),
        source,
    };
    let staging = path.with_extension("yaml.tmp");
    tokio::fs::write(&staging, yaml).await.map_err(io_err)?;
    tokio::fs::rename(&staging, path).await.map_err(io_err)
}

const TARGET_COLUMNS: &str =
    "id, source_url, organization, keywords, cadence, status, last_checked, history, destination";

/// Postgres-backed store over the `watch_targets` and `postings` tables.
#[derive(Debug, Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or replaces a target's configuration. History and `last_checked` are kept
    /// when the target already exists.
    pub async fn upsert_target(&self, target: &WatchTarget) -> Result<(), PersistenceError> {
        let history: Vec<String> = target.history.iter().map(|f| f.as_str().to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO watch_targets
                (id, source_url, organization, keywords, cadence, status, last_checked, history, destination)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
               SET source_url = EXCLUDED.source_url,
                   organization = EXCLUDED.organization,
                   keywords = EXCLUDED.keywords,
                   cadence = EXCLUDED.cadence,
                   status = EXCLUDED.status,
                   destination = EXCLUDED.destination
            "#,
        )
        .bind(target.id)
        .bind(&target.source_url)
        .bind(&target.organization)
        .bind(&target.keywords)
        .bind(target.cadence.as_str())
        .bind(target.status.as_str())
        .bind(target.last_checked)
        .bind(&history)
        .bind(&target.destination)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn target_from_row(row: &PgRow) -> Result<WatchTarget, PersistenceError> {
    let cadence: String = row.try_get("cadence")?;
    let status: String = row.try_get("status")?;
    let history: Vec<String> = row.try_get("history")?;
    Ok(WatchTarget {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        organization: row.try_get("organization")?,
        keywords: row.try_get("keywords")?,
        cadence: cadence.parse().map_err(|e: jobwatch_core::ParseEnumError| {
            PersistenceError::Decode {
                column: "cadence",
                message: e.to_string(),
            }
        })?,
        status: status.parse().map_err(|e: jobwatch_core::ParseEnumError| {
            PersistenceError::Decode {
                column: "status",
                message: e.to_string(),
            }
        })?,
        last_checked: row.try_get("last_checked")?,
        history: history.into_iter().map(FingerprintId::from_hex).collect(),
        destination: row.try_get("destination")?,
    })
}

/// Drops target rows that fail to decode, logging each one by id.
fn keep_decoded(
    rows: impl IntoIterator<Item = (Option<Uuid>, Result<WatchTarget, PersistenceError>)>,
) -> Vec<WatchTarget> {
    rows.into_iter()
        .filter_map(|(id, decoded)| match decoded {
            Ok(target) => Some(target),
            Err(err) => {
                error!(target_id = ?id, error = %err, "skipping undecodable target row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn load_active_targets(&self) -> Result<Vec<WatchTarget>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM watch_targets WHERE status = 'active' ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(keep_decoded(
            rows.iter().map(|row| (row.try_get::<Uuid, _>("id").ok(), target_from_row(row))),
        ))
    }

    async fn load_target(&self, id: Uuid) -> Result<Option<WatchTarget>, PersistenceError> {
        let row = sqlx::query(&format!("SELECT {TARGET_COLUMNS} FROM watch_targets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(target_from_row).transpose()
    }

    async fn save_new_postings(&self, postings: &[Posting]) -> Result<usize, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for posting in postings {
            let result = sqlx::query(
                r#"
                INSERT INTO postings
                    (id, target_id, title, organization, location, url, discovered_at, fingerprint)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (target_id, fingerprint) DO NOTHING
                "#,
            )
            .bind(posting.id)
            .bind(posting.target_id)
            .bind(&posting.title)
            .bind(&posting.organization)
            .bind(&posting.location)
            .bind(&posting.url)
            .bind(posting.discovered_at)
            .bind(posting.fingerprint.as_str())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted as usize)
    }

    async fn update_target(&self, id: Uuid, update: TargetUpdate) -> Result<(), PersistenceError> {
        let history: Vec<String> = update.history.iter().map(|f| f.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE watch_targets
               SET last_checked = $2,
                   history = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.last_checked)
        .bind(&history)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::UnknownTarget(id));
        }
        Ok(())
    }
}
