//! Storage seam for canonical events: the transactional Postgres upsert, the
//! in-memory store, and the retry classification the persistence loop relies on.

use std::time::Duration;

use async_trait::async_trait;
use odds_core::CanonicalEvent;
use thiserror::Error;

mod memory;
mod pg;

pub use memory::{MemoryEventStore, StoredEvent, StoredOdd};
pub use pg::{connect_pool, ensure_schema, odds_upsert_query, PgEventStore, UPSERT_EVENT_SQL};

pub const CRATE_NAME: &str = "odds-storage";

/// Bound parameters in one odds row: external id, parent link, name, rate, status.
pub const PARAMS_PER_ODD_ROW: usize = 5;

pub const DEFAULT_MAX_PARAMETERS_PER_STATEMENT: usize = 1800;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),
    #[error("event {provider_event_id} rejected: {reason}")]
    Integrity {
        provider_event_id: i64,
        reason: String,
    },
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Database(err) => classify_sqlx_error(err),
            StoreError::Schema(_) | StoreError::Integrity { .. } => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(RetryDisposition::NonRetryable),
        _ => RetryDisposition::NonRetryable,
    }
}

/// Serialization failures, deadlocks, lock and statement timeouts, connection
/// loss, resource exhaustion and admin shutdowns are worth another attempt;
/// data and constraint errors are not.
pub fn classify_sqlstate(code: &str) -> RetryDisposition {
    let retryable = matches!(code, "40001" | "40P01" | "55P03" | "57014")
        || code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P");
    if retryable {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: the wait after failed attempt `n` (1-based) is `unit * base^n`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base: f64,
    pub unit: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: 3.0,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.base.max(0.0).powi(exponent);
        if !factor.is_finite() {
            return self.max_delay;
        }
        let max_factor = self.max_delay.as_secs_f64() / self.unit.as_secs_f64().max(f64::MIN_POSITIVE);
        if factor >= max_factor {
            return self.max_delay;
        }
        self.unit.mul_f64(factor).min(self.max_delay)
    }
}

/// Odds rows per statement so that `rows * PARAMS_PER_ODD_ROW <= max_parameters`.
/// Never zero: ceilings below one row's worth degrade to single-row statements.
pub fn odds_batch_size(max_parameters_per_statement: usize) -> usize {
    (max_parameters_per_statement / PARAMS_PER_ODD_ROW).max(1)
}

/// Checks that must hold before any storage work for an event starts.
/// Violations are data errors, never retried.
pub fn validate_event(event: &CanonicalEvent) -> Result<(), StoreError> {
    if let Some(odd) = event.odds.iter().find(|odd| odd.name.is_none()) {
        return Err(StoreError::Integrity {
            provider_event_id: event.provider_event_id,
            reason: format!("odds line {} has no display name", odd.provider_odds_id),
        });
    }
    Ok(())
}

/// Atomic, idempotent write of one canonical event and all of its odds lines.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert_event(&self, event: &CanonicalEvent) -> Result<(), StoreError>;
}
