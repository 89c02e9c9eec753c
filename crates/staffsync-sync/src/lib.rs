//! Sync pipeline orchestration: fetch the roster, persist it, reconcile bios.

pub mod config;
pub mod reconcile;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use staffsync_canvas::{CanvasRosterSource, CanvasSettings, FetchContext, RosterSource};
use staffsync_core::Person;
use staffsync_storage::{
    BiosLoad, FetchError, HttpClientConfig, HttpFetcher, PersistError, StaffDataStore,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use config::{ConfigError, EnvSource, SyncConfig};
pub use reconcile::{reconcile_bios, Reconciliation};

pub const CRATE_NAME: &str = "staffsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("fetching roster: {0}")]
    Fetch(#[from] FetchError),
    #[error("persisting staff data: {0}")]
    Persist(#[from] PersistError),
    #[error("no roster file at {}; run a sync first", path.display())]
    NoRoster { path: PathBuf },
    #[error("reading roster: {0:#}")]
    RosterRead(anyhow::Error),
}

impl SyncError {
    /// Fetch and persist failures leave the last good files in place, so the
    /// site build can carry on with them.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Fetch(_) | SyncError::Persist(_))
    }
}

/// What reconciliation did to the bios file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BiosOutcome {
    pub appended: Vec<String>,
    pub written: bool,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub course_name: String,
    pub instructors: usize,
    pub tas: usize,
    pub tutors: usize,
    pub roster_path: PathBuf,
    pub bios_path: PathBuf,
    pub bios: BiosOutcome,
}

/// Loads the bios file, appends placeholders for unknown instructors and
/// writes it back only when something was appended.
pub async fn reconcile_store(
    store: &StaffDataStore,
    instructors: &[Person],
) -> Result<BiosOutcome, PersistError> {
    let load = store.load_bios().await;
    let unparsable = load.is_unparsable();
    if let BiosLoad::Unparsable { reason } = &load {
        warn!(%reason, "bios file unreadable; starting from an empty record");
    }

    let result = reconcile_bios(instructors, load.into_record());
    if !result.changed() {
        info!("bios file: all instructors already have entries");
        return Ok(BiosOutcome::default());
    }

    let backup = if unparsable {
        let path = store.backup_bios().await?;
        warn!(backup = %path.display(), "kept a copy of the unreadable bios file");
        Some(path)
    } else {
        None
    };

    let path = store.save_bios(&result.record).await?;
    for name in &result.appended {
        info!(%name, "added bio entry for new instructor");
    }
    info!(
        added = result.appended_count(),
        path = %path.display(),
        "updated bios file"
    );

    Ok(BiosOutcome {
        appended: result.appended,
        written: true,
        backup,
    })
}

/// Re-runs reconciliation against the roster already on disk.
pub async fn reconcile_from_disk(store: &StaffDataStore) -> Result<BiosOutcome, SyncError> {
    let roster = store
        .load_roster()
        .await
        .map_err(SyncError::RosterRead)?
        .ok_or_else(|| SyncError::NoRoster {
            path: store.roster_path(),
        })?;
    Ok(reconcile_store(store, &roster.instructors).await?)
}

pub struct SyncPipeline {
    store: StaffDataStore,
    source: Box<dyn RosterSource>,
}

impl SyncPipeline {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            bearer_token: Some(config.token.clone()),
            ..Default::default()
        })?;
        let source = CanvasRosterSource::new(
            http,
            CanvasSettings {
                base_url: config.server.clone(),
                course: config.course.clone(),
                skip_email: config.skip_email,
                email_concurrency: config.email_concurrency,
            },
        );
        Ok(Self::with_source(
            StaffDataStore::new(config.data_dir.clone()),
            Box::new(source),
        ))
    }

    pub fn with_source(store: StaffDataStore, source: Box<dyn RosterSource>) -> Self {
        Self { store, source }
    }

    pub fn store(&self) -> &StaffDataStore {
        &self.store
    }

    /// Nothing is written unless the whole roster was fetched.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = FetchContext { run_id };

        let roster = self.source.fetch_roster(&ctx).await?;

        let roster_path = self.store.save_roster(&roster).await?;
        info!(
            %run_id,
            source = self.source.source_id(),
            path = %roster_path.display(),
            instructors = roster.instructors.len(),
            tas = roster.tas.len(),
            tutors = roster.tutors.len(),
            "staff data saved"
        );

        let bios = reconcile_store(&self.store, &roster.instructors).await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            course_name: roster.course_name.clone(),
            instructors: roster.instructors.len(),
            tas: roster.tas.len(),
            tutors: roster.tutors.len(),
            roster_path,
            bios_path: self.store.bios_path(),
            bios,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(&config)?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use staffsync_core::{BioEntry, BiosRecord, FALLBACK_BIO};
    use tempfile::tempdir;

    #[tokio::test]
    async fn unchanged_bios_file_is_not_rewritten() {
        let dir = tempdir().unwrap();
        let store = StaffDataStore::new(dir.path());
        let original = b"{\"instructor_bios\":[{\"name\":\"Ada Lovelace\",\"bio\":\"Custom\"}]}";
        std::fs::write(store.bios_path(), original).unwrap();

        let outcome = reconcile_store(&store, &[Person::new(" ada lovelace", "", "1")])
            .await
            .unwrap();

        assert!(!outcome.written);
        assert_eq!(std::fs::read(store.bios_path()).unwrap(), original);
    }

    #[tokio::test]
    async fn unparsable_bios_file_is_backed_up_before_replacement() {
        let dir = tempdir().unwrap();
        let store = StaffDataStore::new(dir.path());
        std::fs::write(store.bios_path(), b"{\"instructor_bios\": [").unwrap();

        let outcome = reconcile_store(&store, &[Person::new("Alan Turing", "", "2")])
            .await
            .unwrap();

        assert!(outcome.written);
        assert_eq!(
            std::fs::read(outcome.backup.unwrap()).unwrap(),
            b"{\"instructor_bios\": ["
        );
        let text = std::fs::read_to_string(store.bios_path()).unwrap();
        let record: BiosRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(record.entries, vec![BioEntry::placeholder("Alan Turing")]);
        assert_eq!(record.entries[0].bio(), Some(FALLBACK_BIO));
    }

    #[tokio::test]
    async fn off_schema_entry_for_current_instructor_is_left_alone() {
        let dir = tempdir().unwrap();
        let store = StaffDataStore::new(dir.path());
        let original = br#"{"instructor_bios":[{"name":"Ada Lovelace","title":5,"bio":["para one","para two"]}]}"#;
        std::fs::write(store.bios_path(), original).unwrap();

        let outcome = reconcile_store(&store, &[Person::new("Ada Lovelace", "", "1")])
            .await
            .unwrap();

        assert!(outcome.appended.is_empty());
        assert!(!outcome.written);
        assert_eq!(std::fs::read(store.bios_path()).unwrap(), original);
        assert!(!store.bios_backup_path().exists());
    }

    #[tokio::test]
    async fn rewrite_keeps_prior_entries_byte_for_byte() {
        let dir = tempdir().unwrap();
        let store = StaffDataStore::new(dir.path());
        std::fs::write(
            store.bios_path(),
            br#"{"instructor_bios":[{"bio":"Custom","name":"Ada Lovelace","title":null},{"name":"Grace Hopper","bio":["para one","para two"],"title":5}]}"#,
        )
        .unwrap();

        let outcome = reconcile_store(
            &store,
            &[
                Person::new("Ada Lovelace", "", "1"),
                Person::new("Grace Hopper", "", "3"),
                Person::new("Alan Turing", "", "2"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.appended, vec!["Alan Turing"]);
        assert!(outcome.written);
        assert!(outcome.backup.is_none());
        let text = std::fs::read_to_string(store.bios_path()).unwrap();
        assert_eq!(
            text,
            r#"{
  "instructor_bios": [
    {
      "bio": "Custom",
      "name": "Ada Lovelace",
      "title": null
    },
    {
      "name": "Grace Hopper",
      "bio": [
        "para one",
        "para two"
      ],
      "title": 5
    },
    {
      "name": "Alan Turing",
      "bio": "Bio not available for this instructor."
    }
  ]
}"#
        );
    }

    #[tokio::test]
    async fn offline_reconcile_needs_a_roster() {
        let dir = tempdir().unwrap();
        let store = StaffDataStore::new(dir.path());
        let err = reconcile_from_disk(&store).await.unwrap_err();
        assert!(matches!(err, SyncError::NoRoster { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn offline_reconcile_reads_legacy_roster_shape() {
        let dir = tempdir().unwrap();
        let store = StaffDataStore::new(dir.path());
        std::fs::write(
            store.roster_path(),
            br#"{"course_name":"CSE 140","instructor":{"name":"Ada Lovelace","email":"","id":"1"},"tas":[],"tutors":[]}"#,
        )
        .unwrap();

        let outcome = reconcile_from_disk(&store).await.unwrap();
        assert_eq!(outcome.appended, vec!["Ada Lovelace"]);
        assert!(outcome.written);
    }
}
