//! Core domain model for the odds importer: decoded update messages, the
//! canonical merged records, and the merge engine that folds one into the other.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "odds-core";

/// One element of the provider's message batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "MessageID")]
    pub message_id: Uuid,
    #[serde(rename = "GeneratedDate")]
    pub generated_date: DateTime<FixedOffset>,
    #[serde(rename = "Event", default)]
    pub event: Option<EventUpdate>,
}

/// Snapshot of a sporting event as carried by a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventUpdate {
    #[serde(rename = "ProviderEventID")]
    pub provider_event_id: i64,
    /// Required. A missing or `null` name rejects the whole batch at decode,
    /// unlike `OddsName`, which follow-up updates legitimately omit.
    #[serde(rename = "EventName")]
    pub event_name: String,
    #[serde(rename = "EventDate", deserialize_with = "deserialize_event_date")]
    pub event_date: NaiveDateTime,
    #[serde(rename = "OddsList", default)]
    pub odds_list: Option<Vec<OddUpdate>>,
}

/// Odds line as carried by a single message. Follow-up updates may omit the name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddUpdate {
    #[serde(rename = "ProviderOddsID")]
    pub provider_odds_id: i64,
    #[serde(rename = "OddsName", default)]
    pub odds_name: Option<String>,
    #[serde(rename = "OddsRate")]
    pub odds_rate: f64,
    /// Required on every update; `null` is a decode error like `EventName`.
    #[serde(rename = "Status")]
    pub status: String,
}

/// Merged state of one event, the unit written by a single storage transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub provider_event_id: i64,
    pub name: String,
    pub date: NaiveDateTime,
    /// First-sighting order, unique by `provider_odds_id`.
    pub odds: Vec<CanonicalOdd>,
}

/// Merged state of one odds line. `name` is fixed by the update that introduced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOdd {
    pub provider_odds_id: i64,
    pub name: Option<String>,
    pub rate: f64,
    pub status: String,
}

impl CanonicalEvent {
    pub fn odd(&self, provider_odds_id: i64) -> Option<&CanonicalOdd> {
        self.odds
            .iter()
            .find(|odd| odd.provider_odds_id == provider_odds_id)
    }
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message batch is empty")]
    Empty,
    #[error("malformed message batch at line {line}, column {column}: {source}")]
    Malformed {
        line: usize,
        column: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a JSON array of messages. Unknown fields and a leading UTF-8 BOM are ignored.
pub fn decode_messages(bytes: &[u8]) -> Result<Vec<Message>, DecodeError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    serde_json::from_slice(bytes).map_err(|source| DecodeError::Malformed {
        line: source.line(),
        column: source.column(),
        source,
    })
}

fn deserialize_event_date<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_event_date(&raw).map_err(serde::de::Error::custom)
}

/// Accepts offset-less timestamps as-is and normalises offset-bearing ones to UTC.
pub fn parse_event_date(raw: &str) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();
    if let Ok(naive) = raw.parse::<NaiveDateTime>() {
        return Ok(naive);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .map_err(|err| format!("invalid event date {raw:?}: {err}"))
}

#[derive(Debug, Clone)]
struct MergeSlot {
    event: CanonicalEvent,
    odds_index: HashMap<i64, usize>,
}

/// Folds update messages into one canonical record per `ProviderEventID`.
///
/// Event name and date are last-write-wins. A known odds line only takes the
/// incoming rate and status; an unknown one is inserted whole.
#[derive(Debug, Clone, Default)]
pub struct EventMerger {
    slots: Vec<MergeSlot>,
    index: HashMap<i64, usize>,
}

impl EventMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &Message) {
        let Some(incoming) = &message.event else {
            return;
        };

        let slot_idx = match self.index.get(&incoming.provider_event_id) {
            Some(&idx) => idx,
            None => {
                let idx = self.slots.len();
                self.slots.push(MergeSlot {
                    event: CanonicalEvent {
                        provider_event_id: incoming.provider_event_id,
                        name: incoming.event_name.clone(),
                        date: incoming.event_date,
                        odds: Vec::new(),
                    },
                    odds_index: HashMap::new(),
                });
                self.index.insert(incoming.provider_event_id, idx);
                idx
            }
        };

        let slot = &mut self.slots[slot_idx];
        slot.event.name.clone_from(&incoming.event_name);
        slot.event.date = incoming.event_date;

        let Some(odds) = &incoming.odds_list else {
            return;
        };

        for odd in odds {
            match slot.odds_index.get(&odd.provider_odds_id) {
                Some(&pos) => {
                    let current = &mut slot.event.odds[pos];
                    current.rate = odd.odds_rate;
                    current.status.clone_from(&odd.status);
                }
                None => {
                    slot.odds_index
                        .insert(odd.provider_odds_id, slot.event.odds.len());
                    slot.event.odds.push(CanonicalOdd {
                        provider_odds_id: odd.provider_odds_id,
                        name: odd.odds_name.clone(),
                        rate: odd.odds_rate,
                        status: odd.status.clone(),
                    });
                }
            }
        }
    }

    pub fn extend<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) {
        for message in messages {
            self.apply(message);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Events in first-sighting order.
    pub fn events(&self) -> impl Iterator<Item = &CanonicalEvent> {
        self.slots.iter().map(|slot| &slot.event)
    }

    pub fn into_events(self) -> Vec<CanonicalEvent> {
        self.slots.into_iter().map(|slot| slot.event).collect()
    }
}

pub fn merge_messages(messages: &[Message]) -> Vec<CanonicalEvent> {
    let mut merger = EventMerger::new();
    merger.extend(messages);
    merger.into_events()
}
