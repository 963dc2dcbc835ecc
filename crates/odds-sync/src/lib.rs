//! Import pipeline: load the message batch, merge it in memory, then persist the
//! canonical events concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use odds_core::{decode_messages, EventMerger, Message};
use odds_storage::{
    connect_pool, ensure_schema, BackoffPolicy, EventStore, PgEventStore, StoreError,
    DEFAULT_MAX_PARAMETERS_PER_STATEMENT,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

mod coordinator;

pub use coordinator::{EventOutcome, PersistState, PersistSummary, PersistenceCoordinator};

pub const CRATE_NAME: &str = "odds-sync";

pub const CONNECTION_STRING_ENV: &str = "DB_CONNECTION_STRING";
pub const DEFAULT_SOURCE_PATH: &str = "zdrojovy_dokument.json";
pub const APP_SETTINGS_FILE: &str = "appsettings.json";

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub max_concurrent_persists: usize,
    pub max_parameters_per_statement: usize,
    pub max_retries: u32,
    pub retry_backoff_base: f64,
    pub retry_backoff_unit: Duration,
    /// Upper bound of the random wait before each event; `None` disables it.
    pub simulated_delay_max: Option<Duration>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_concurrent_persists: 10,
            max_parameters_per_statement: DEFAULT_MAX_PARAMETERS_PER_STATEMENT,
            max_retries: 3,
            retry_backoff_base: 3.0,
            retry_backoff_unit: Duration::from_secs(1),
            simulated_delay_max: None,
        }
    }
}

impl PersistConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base: self.retry_backoff_base,
            unit: self.retry_backoff_unit,
            ..BackoffPolicy::default()
        }
    }

    fn from_env() -> Self {
        let defaults = Self::default();
        let simulated_delay_ms: u64 = env_parse("ODDS_SIMULATED_DELAY_MAX_MS", 0);
        Self {
            max_concurrent_persists: env_parse(
                "ODDS_MAX_CONCURRENT_PERSISTS",
                defaults.max_concurrent_persists,
            ),
            max_parameters_per_statement: env_parse(
                "ODDS_MAX_PARAMETERS_PER_STATEMENT",
                defaults.max_parameters_per_statement,
            ),
            max_retries: env_parse("ODDS_MAX_RETRIES", defaults.max_retries),
            retry_backoff_base: env_parse("ODDS_RETRY_BACKOFF_BASE", defaults.retry_backoff_base),
            retry_backoff_unit: Duration::from_millis(env_parse("ODDS_RETRY_BACKOFF_UNIT_MS", 1000)),
            simulated_delay_max: (simulated_delay_ms > 0)
                .then(|| Duration::from_millis(simulated_delay_ms)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub source_path: PathBuf,
    pub create_schema: bool,
    pub workspace_root: PathBuf,
    pub persist: PersistConfig,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let workspace_root = PathBuf::from(".");
        Self {
            database_url: resolve_database_url(&workspace_root),
            source_path: std::env::var("ODDS_SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOURCE_PATH)),
            create_schema: std::env::var("ODDS_CREATE_SCHEMA")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            workspace_root,
            persist: PersistConfig::from_env(),
        }
    }

    /// The configured URL, else `ConnectionStrings.DefaultConnection` from the
    /// settings file under `workspace_root`.
    pub fn require_database_url(&self) -> Result<String> {
        let configured = self
            .database_url
            .clone()
            .filter(|url| !url.trim().is_empty());
        match configured.or_else(|| read_app_settings_connection(&self.workspace_root.join(APP_SETTINGS_FILE))) {
            Some(url) => Ok(url),
            None => bail!(
                "no connection string: set {CONNECTION_STRING_ENV} or ConnectionStrings.DefaultConnection in {APP_SETTINGS_FILE}"
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct AppSettings {
    #[serde(rename = "ConnectionStrings", default)]
    connection_strings: Option<ConnectionStrings>,
}

#[derive(Debug, Deserialize)]
struct ConnectionStrings {
    #[serde(rename = "DefaultConnection")]
    default_connection: Option<String>,
}

/// `DB_CONNECTION_STRING`, then `DATABASE_URL`, then the optional settings file.
pub fn resolve_database_url(workspace_root: &Path) -> Option<String> {
    [CONNECTION_STRING_ENV, "DATABASE_URL"]
        .into_iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|v| !v.trim().is_empty())
        .or_else(|| read_app_settings_connection(&workspace_root.join(APP_SETTINGS_FILE)))
}

fn read_app_settings_connection(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let settings: AppSettings = match serde_json::from_str(&text) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable settings file");
            return None;
        }
    };
    settings
        .connection_strings?
        .default_connection
        .filter(|v| !v.trim().is_empty())
}

/// Observer for persistence progress. Implementations must be cheap; they are
/// called from the persist tasks.
pub trait ProgressReporter: Send + Sync {
    fn event_persisted(&self, provider_event_id: i64, succeeded: usize, total: usize);

    fn retry_scheduled(&self, _provider_event_id: i64, _attempt: u32, _delay: Duration, _error: &StoreError) {}

    fn event_failed(&self, _provider_event_id: i64, _attempts: u32, _error: &StoreError) {}

    fn run_finished(&self, _succeeded: usize, _total: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn event_persisted(&self, provider_event_id: i64, succeeded: usize, total: usize) {
        info!(
            provider_event_id,
            remaining = total - succeeded,
            total,
            "event persisted"
        );
    }

    fn event_failed(&self, provider_event_id: i64, attempts: u32, error: &StoreError) {
        error!(provider_event_id, attempts, %error, "event could not be persisted");
    }

    fn run_finished(&self, succeeded: usize, total: usize) {
        info!(succeeded, total, "persisted {succeeded} / {total} events");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub messages: usize,
    pub merged_events: usize,
    pub persist: PersistSummary,
}

impl ImportSummary {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub async fn load_messages(path: &Path) -> Result<Vec<Message>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    decode_messages(&bytes).with_context(|| format!("decoding {}", path.display()))
}

/// Merge `messages` and persist the result through `store`.
pub async fn import_messages(
    messages: &[Message],
    store: Arc<dyn EventStore>,
    config: &PersistConfig,
    reporter: Arc<dyn ProgressReporter>,
) -> ImportSummary {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let mut merger = EventMerger::new();
    merger.extend(messages);
    let events = merger.into_events();
    let merged_events = events.len();
    info!(%run_id, messages = messages.len(), merged_events, "batch merged in memory");

    let persist = PersistenceCoordinator::new(store, config.clone())
        .with_reporter(reporter)
        .persist_all(events)
        .await;

    ImportSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        messages: messages.len(),
        merged_events,
        persist,
    }
}

pub struct ImportPipeline {
    config: ImportConfig,
    reporter: Arc<dyn ProgressReporter>,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig) -> Self {
        Self {
            config,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    async fn check_source(&self) -> Result<()> {
        let path = &self.config.source_path;
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !exists {
            bail!("source file {} not found", path.display());
        }
        Ok(())
    }

    /// Full run against Postgres. Configuration and decode errors abort before
    /// anything is written; per-event persistence failures only show up in the summary.
    pub async fn run_once(&self) -> Result<ImportSummary> {
        let database_url = self.config.require_database_url()?;
        self.check_source().await?;

        let pool = connect_pool(&database_url, self.pool_size())
            .await
            .context("connecting to the database")?;
        if self.config.create_schema {
            ensure_schema(&pool).await.context("creating tables")?;
            info!("events and odds tables are in place");
        }

        let messages = load_messages(&self.config.source_path).await?;
        let store = PgEventStore::new(pool, self.config.persist.max_parameters_per_statement);
        Ok(import_messages(&messages, Arc::new(store), &self.config.persist, Arc::clone(&self.reporter)).await)
    }

    /// Same merge and persist path, but into `store` instead of Postgres.
    pub async fn run_with_store(&self, store: Arc<dyn EventStore>) -> Result<ImportSummary> {
        self.check_source().await?;
        let messages = load_messages(&self.config.source_path).await?;
        Ok(import_messages(&messages, store, &self.config.persist, Arc::clone(&self.reporter)).await)
    }

    /// Create the schema only.
    pub async fn migrate(&self) -> Result<()> {
        let pool = connect_pool(&self.config.require_database_url()?, 1)
            .await
            .context("connecting to the database")?;
        ensure_schema(&pool).await.context("creating tables")
    }

    fn pool_size(&self) -> u32 {
        u32::try_from(self.config.persist.max_concurrent_persists.max(1)).unwrap_or(u32::MAX)
    }
}

pub async fn run_import_from_env() -> Result<ImportSummary> {
    ImportPipeline::new(ImportConfig::from_env()).run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use odds_storage::MemoryEventStore;
    use tempfile::tempdir;

    const BATCH: &str = r#"[
        {
            "MessageID": "0f8fad5b-d9cb-469f-a165-70867728950e",
            "GeneratedDate": "2026-03-01T10:00:00+01:00",
            "Event": {
                "ProviderEventID": 100,
                "EventName": "Derby",
                "EventDate": "2026-03-07T15:00:00",
                "OddsList": [
                    {"ProviderOddsID": 1, "OddsName": "Home", "OddsRate": 1.8, "Status": "Open"}
                ]
            }
        },
        {
            "MessageID": "7c9e6679-7425-40de-944b-e07fc1f90ae7",
            "GeneratedDate": "2026-03-01T10:01:00+01:00"
        },
        {
            "MessageID": "16fd2706-8baf-433b-82eb-8c7fada847da",
            "GeneratedDate": "2026-03-01T10:02:00+01:00",
            "Event": {
                "ProviderEventID": 100,
                "EventName": "Derby FT",
                "EventDate": "2026-03-07T15:00:00",
                "OddsList": [
                    {"ProviderOddsID": 1, "OddsName": "Home", "OddsRate": 1.5, "Status": "Suspended"},
                    {"ProviderOddsID": 2, "OddsName": "Draw", "OddsRate": 3.2, "Status": "Open"}
                ]
            }
        },
        {
            "MessageID": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
            "GeneratedDate": "2026-03-01T10:03:00+01:00",
            "Event": {
                "ProviderEventID": 200,
                "EventName": "Clasico",
                "EventDate": "2026-03-08T20:00:00"
            }
        }
    ]"#;

    fn config_for(source_path: PathBuf, database_url: Option<String>) -> ImportConfig {
        let workspace_root = source_path.parent().map(PathBuf::from).unwrap_or_default();
        ImportConfig {
            database_url,
            source_path,
            create_schema: false,
            workspace_root,
            persist: PersistConfig::default(),
        }
    }

    #[tokio::test]
    async fn file_batch_is_merged_and_persisted() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("batch.json");
        std::fs::write(&path, BATCH).expect("write batch");

        let store = Arc::new(MemoryEventStore::new());
        let summary = ImportPipeline::new(config_for(path, None))
            .run_with_store(store.clone())
            .await
            .expect("import");

        assert_eq!(summary.messages, 4);
        assert_eq!(summary.merged_events, 2);
        assert_eq!(summary.persist.succeeded, 2);
        assert_eq!(summary.persist.failed(), 0);
        assert!(summary.elapsed() >= chrono::Duration::zero());

        let derby = store.event(100).await.expect("derby");
        assert_eq!(derby.event_name, "Derby FT");
        assert_eq!(store.odds_for_event(100).await.len(), 2);
        assert!(store.odds_for_event(200).await.is_empty());
    }

    #[tokio::test]
    async fn missing_source_file_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let err = ImportPipeline::new(config_for(dir.path().join("absent.json"), None))
            .run_with_store(Arc::new(MemoryEventStore::new()))
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn malformed_batch_aborts_before_persisting() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"[{"MessageID": "nope"}"#).expect("write batch");

        let store = Arc::new(MemoryEventStore::new());
        let err = ImportPipeline::new(config_for(path, None))
            .run_with_store(store.clone())
            .await
            .expect_err("decode");
        assert!(format!("{err:#}").contains("malformed message batch"));
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn missing_connection_string_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("batch.json");
        std::fs::write(&path, BATCH).expect("write batch");

        let err = ImportPipeline::new(config_for(path, Some("   ".into())))
            .run_once()
            .await
            .expect_err("no connection string");
        assert!(err.to_string().contains(CONNECTION_STRING_ENV));
    }

    #[test]
    fn app_settings_connection_string_is_read() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(APP_SETTINGS_FILE);
        std::fs::write(
            &path,
            r#"{"ConnectionStrings": {"DefaultConnection": "postgres://odds@localhost/odds"}, "Logging": {}}"#,
        )
        .expect("write settings");
        assert_eq!(
            read_app_settings_connection(&path).as_deref(),
            Some("postgres://odds@localhost/odds")
        );

        std::fs::write(&path, r#"{"ConnectionStrings": {}}"#).expect("write settings");
        assert_eq!(read_app_settings_connection(&path), None);
        assert_eq!(read_app_settings_connection(&dir.path().join("absent.json")), None);
    }

    #[test]
    fn settings_file_under_workspace_root_supplies_the_connection_string() {
        let dir = tempdir().expect("tempdir");
        let mut config = config_for(dir.path().join("batch.json"), None);
        assert!(config.require_database_url().is_err());

        std::fs::write(
            dir.path().join(APP_SETTINGS_FILE),
            r#"{"ConnectionStrings": {"DefaultConnection": "postgres://odds@db/odds"}}"#,
        )
        .expect("write settings");
        assert_eq!(
            config.require_database_url().expect("from settings"),
            "postgres://odds@db/odds"
        );

        config.database_url = Some("postgres://odds@override/odds".into());
        assert_eq!(
            config.require_database_url().expect("explicit"),
            "postgres://odds@override/odds"
        );
    }

    #[test]
    fn persist_defaults_match_documented_values() {
        let config = PersistConfig::default();
        assert_eq!(config.max_concurrent_persists, 10);
        assert_eq!(config.max_parameters_per_statement, 1800);
        let backoff = config.backoff();
        assert_eq!(backoff.max_retries, 3);
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(9));
        assert!(config.simulated_delay_max.is_none());
    }
}
