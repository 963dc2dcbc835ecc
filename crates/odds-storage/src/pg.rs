use async_trait::async_trait;
use odds_core::{CanonicalEvent, CanonicalOdd};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::{odds_batch_size, validate_event, EventStore, StoreError};

pub const UPSERT_EVENT_SQL: &str = r#"
    INSERT INTO events (provider_event_id, event_name, event_date)
    VALUES ($1, $2, $3)
    ON CONFLICT (provider_event_id) DO UPDATE
       SET event_name = EXCLUDED.event_name,
           event_date = EXCLUDED.event_date,
           last_updated = (now() AT TIME ZONE 'utc')
    RETURNING id
"#;

/// Every task draws its own connection from the pool for the lifetime of one
/// transaction; `max_connections` should match the persist concurrency.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Create the `events` and `odds` tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// One multi-row upsert for a batch of odds belonging to `event_row_id`.
/// A matching `provider_odds_id` only takes the new rate and status.
pub fn odds_upsert_query(event_row_id: i64, batch: &[CanonicalOdd]) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(
        "INSERT INTO odds (provider_odds_id, event_id, odds_name, odds_rate, status) ",
    );
    builder.push_values(batch, |mut row, odd| {
        row.push_bind(odd.provider_odds_id)
            .push_bind(event_row_id)
            .push_bind(odd.name.as_deref())
            .push_bind(odd.rate)
            .push_bind(odd.status.as_str());
    });
    builder.push(
        " ON CONFLICT (provider_odds_id) DO UPDATE \
         SET odds_rate = EXCLUDED.odds_rate, \
             status = EXCLUDED.status, \
             last_updated = (now() AT TIME ZONE 'utc')",
    );
    builder
}

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    max_parameters_per_statement: usize,
}

impl PgEventStore {
    pub fn new(pool: PgPool, max_parameters_per_statement: usize) -> Self {
        Self {
            pool,
            max_parameters_per_statement,
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_event(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        validate_event(event)?;

        // Dropping `tx` on any early return rolls the whole event back.
        let mut tx = self.pool.begin().await?;

        let event_row_id: i64 = sqlx::query_scalar(UPSERT_EVENT_SQL)
            .bind(event.provider_event_id)
            .bind(&event.name)
            .bind(event.date)
            .fetch_one(&mut *tx)
            .await?;

        let batch_size = odds_batch_size(self.max_parameters_per_statement);
        for (batch_no, batch) in event.odds.chunks(batch_size).enumerate() {
            let mut query = odds_upsert_query(event_row_id, batch);
            query.build().execute(&mut *tx).await?;
            debug!(
                provider_event_id = event.provider_event_id,
                batch_no,
                rows = batch.len(),
                "odds batch upserted"
            );
        }

        tx.commit().await?;
        Ok(())
    }
}
