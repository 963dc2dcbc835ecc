use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use odds_core::CanonicalEvent;
use tokio::sync::Mutex;

use crate::{validate_event, EventStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    pub provider_event_id: i64,
    pub event_name: String,
    pub event_date: NaiveDateTime,
    pub last_updated: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredOdd {
    pub id: i64,
    pub provider_odds_id: i64,
    pub event_id: i64,
    pub odds_name: String,
    pub odds_rate: f64,
    pub status: String,
    pub last_updated: NaiveDateTime,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    events: BTreeMap<i64, StoredEvent>,
    odds: BTreeMap<i64, StoredOdd>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store with the same natural-key upsert semantics as the Postgres tables,
/// used for dry runs and tests. Each upsert holds the lock for its whole
/// duration, which makes it atomic with respect to other writers.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    tables: Mutex<Tables>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<StoredEvent> {
        self.tables.lock().await.events.values().cloned().collect()
    }

    pub async fn event(&self, provider_event_id: i64) -> Option<StoredEvent> {
        self.tables.lock().await.events.get(&provider_event_id).cloned()
    }

    pub async fn odds(&self) -> Vec<StoredOdd> {
        self.tables.lock().await.odds.values().cloned().collect()
    }

    pub async fn odds_for_event(&self, provider_event_id: i64) -> Vec<StoredOdd> {
        let tables = self.tables.lock().await;
        let Some(event) = tables.events.get(&provider_event_id) else {
            return Vec::new();
        };
        tables
            .odds
            .values()
            .filter(|odd| odd.event_id == event.id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_event(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        validate_event(event)?;

        let now = Utc::now().naive_utc();
        let mut tables = self.tables.lock().await;

        let event_row_id = match tables.events.get_mut(&event.provider_event_id) {
            Some(row) => {
                row.event_name.clone_from(&event.name);
                row.event_date = event.date;
                row.last_updated = now;
                row.id
            }
            None => {
                let id = tables.next_id();
                tables.events.insert(
                    event.provider_event_id,
                    StoredEvent {
                        id,
                        provider_event_id: event.provider_event_id,
                        event_name: event.name.clone(),
                        event_date: event.date,
                        last_updated: now,
                    },
                );
                id
            }
        };

        for odd in &event.odds {
            if let Some(row) = tables.odds.get_mut(&odd.provider_odds_id) {
                row.odds_rate = odd.rate;
                row.status.clone_from(&odd.status);
                row.last_updated = now;
                continue;
            }
            let id = tables.next_id();
            tables.odds.insert(
                odd.provider_odds_id,
                StoredOdd {
                    id,
                    provider_odds_id: odd.provider_odds_id,
                    event_id: event_row_id,
                    odds_name: odd.name.clone().unwrap_or_default(),
                    odds_rate: odd.rate,
                    status: odd.status.clone(),
                    last_updated: now,
                },
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use odds_core::CanonicalOdd;

    fn derby(name: &str, odds: Vec<CanonicalOdd>) -> CanonicalEvent {
        CanonicalEvent {
            provider_event_id: 100,
            name: name.into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 7)
                .and_then(|d| d.and_hms_opt(15, 0, 0))
                .expect("date"),
            odds,
        }
    }

    fn odd(id: i64, name: &str, rate: f64, status: &str) -> CanonicalOdd {
        CanonicalOdd {
            provider_odds_id: id,
            name: Some(name.into()),
            rate,
            status: status.into(),
        }
    }

    #[tokio::test]
    async fn repeated_upserts_converge() {
        let store = MemoryEventStore::new();
        let event = derby("Derby", vec![odd(1, "Home", 1.8, "Open"), odd(2, "Draw", 3.2, "Open")]);

        store.upsert_event(&event).await.expect("first");
        let events_once = store.events().await;
        let odds_once = store.odds().await;
        store.upsert_event(&event).await.expect("second");

        let events = store.events().await;
        let odds = store.odds().await;
        assert_eq!(events.len(), 1);
        assert_eq!(odds.len(), 2);
        assert_eq!(events[0].id, events_once[0].id);
        assert_eq!(
            odds.iter().map(|o| (o.id, o.odds_rate)).collect::<Vec<_>>(),
            odds_once.iter().map(|o| (o.id, o.odds_rate)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn matched_odd_keeps_stored_name() {
        let store = MemoryEventStore::new();
        store
            .upsert_event(&derby("Derby", vec![odd(1, "Home", 1.8, "Open")]))
            .await
            .expect("first");
        store
            .upsert_event(&derby("Derby FT", vec![odd(1, "Renamed", 1.5, "Suspended")]))
            .await
            .expect("second");

        let stored = store.odds_for_event(100).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].odds_name, "Home");
        assert_eq!(stored[0].odds_rate, 1.5);
        assert_eq!(stored[0].status, "Suspended");
        assert_eq!(store.event(100).await.expect("event").event_name, "Derby FT");
    }

    #[tokio::test]
    async fn rejected_event_leaves_no_rows() {
        let store = MemoryEventStore::new();
        let mut nameless = odd(2, "x", 2.0, "Open");
        nameless.name = None;
        let err = store
            .upsert_event(&derby("Derby", vec![odd(1, "Home", 1.8, "Open"), nameless]))
            .await
            .expect_err("integrity");
        assert!(matches!(err, StoreError::Integrity { .. }));
        assert!(store.events().await.is_empty());
        assert!(store.odds().await.is_empty());
    }
}
