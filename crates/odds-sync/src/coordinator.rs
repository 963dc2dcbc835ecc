use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use odds_core::CanonicalEvent;
use odds_storage::{BackoffPolicy, EventStore, RetryDisposition, StoreError};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{PersistConfig, ProgressReporter, TracingReporter};

/// Lifecycle of one event's persistence task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PersistState {
    Pending,
    Attempting(u32),
    Succeeded,
    Failed,
}

impl PersistState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PersistState::Succeeded | PersistState::Failed)
    }

    pub fn start(self) -> PersistState {
        match self {
            PersistState::Pending => PersistState::Attempting(1),
            other => other,
        }
    }

    /// Next state once the current attempt has returned.
    pub fn advance(self, result: &Result<(), StoreError>, max_attempts: u32) -> PersistState {
        let PersistState::Attempting(attempt) = self else {
            return self;
        };
        match result {
            Ok(()) => PersistState::Succeeded,
            Err(err)
                if err.disposition() == RetryDisposition::Retryable && attempt < max_attempts =>
            {
                PersistState::Attempting(attempt + 1)
            }
            Err(_) => PersistState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub provider_event_id: i64,
    pub state: PersistState,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistSummary {
    pub total: usize,
    pub succeeded: usize,
    pub outcomes: Vec<EventOutcome>,
}

impl PersistSummary {
    pub fn failed(&self) -> usize {
        self.total - self.succeeded
    }

    pub fn failed_event_ids(&self) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter(|o| o.state != PersistState::Succeeded)
            .map(|o| o.provider_event_id)
            .collect()
    }
}

/// Fans canonical events out to the store, one task per event, with at most
/// `max_concurrent_persists` writes in flight. One event's failure never
/// stops the others.
pub struct PersistenceCoordinator {
    store: Arc<dyn EventStore>,
    config: PersistConfig,
    reporter: Arc<dyn ProgressReporter>,
}

impl PersistenceCoordinator {
    pub fn new(store: Arc<dyn EventStore>, config: PersistConfig) -> Self {
        Self {
            store,
            config,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub async fn persist_all(&self, events: Vec<CanonicalEvent>) -> PersistSummary {
        let total = events.len();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_persists.max(1)));
        let succeeded = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total);
        for event in events {
            let provider_event_id = event.provider_event_id;
            let task = EventTask {
                store: Arc::clone(&self.store),
                reporter: Arc::clone(&self.reporter),
                permits: Arc::clone(&permits),
                succeeded: Arc::clone(&succeeded),
                backoff: self.config.backoff(),
                simulated_delay_max: self.config.simulated_delay_max,
                total,
            };
            let span = info_span!("persist_event", provider_event_id);
            handles.push((provider_event_id, tokio::spawn(task.run(event).instrument(span))));
        }

        let mut outcomes = Vec::with_capacity(total);
        for (provider_event_id, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(provider_event_id, error = %err, "persist task aborted");
                    outcomes.push(EventOutcome {
                        provider_event_id,
                        state: PersistState::Failed,
                        attempts: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let summary = PersistSummary {
            total,
            succeeded: succeeded.load(Ordering::SeqCst),
            outcomes,
        };
        self.reporter.run_finished(summary.succeeded, summary.total);
        summary
    }
}

struct EventTask {
    store: Arc<dyn EventStore>,
    reporter: Arc<dyn ProgressReporter>,
    permits: Arc<Semaphore>,
    succeeded: Arc<AtomicUsize>,
    backoff: BackoffPolicy,
    simulated_delay_max: Option<Duration>,
    total: usize,
}

impl EventTask {
    async fn run(self, event: CanonicalEvent) -> EventOutcome {
        let provider_event_id = event.provider_event_id;

        // Stands in for a rate-limited upstream call; does not hold a permit.
        if let Some(max) = self.simulated_delay_max {
            let delay = random_delay(max);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        // Released on drop, whichever way this function returns or unwinds.
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                return EventOutcome {
                    provider_event_id,
                    state: PersistState::Failed,
                    attempts: 0,
                    error: Some(err.to_string()),
                };
            }
        };

        let max_attempts = self.backoff.max_retries.max(1);
        let mut state = PersistState::Pending.start();
        let mut attempts = 0;
        let mut last_error = None;

        while let PersistState::Attempting(attempt) = state {
            attempts = attempt;
            let result = self.store.upsert_event(&event).await;
            state = state.advance(&result, max_attempts);

            match (result, state) {
                (Ok(()), _) => {
                    let done = self.succeeded.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(attempt, "event persisted");
                    self.reporter.event_persisted(provider_event_id, done, self.total);
                }
                (Err(err), PersistState::Attempting(_)) => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "upsert failed; retrying");
                    self.reporter.retry_scheduled(provider_event_id, attempt, delay, &err);
                    tokio::time::sleep(delay).await;
                }
                (Err(err), _) => {
                    error!(attempt, error = %err, "upsert failed; giving up");
                    self.reporter.event_failed(provider_event_id, attempt, &err);
                    last_error = Some(err.to_string());
                }
            }
        }

        EventOutcome {
            provider_event_id,
            state,
            attempts,
            error: last_error,
        }
    }
}

fn random_delay(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
