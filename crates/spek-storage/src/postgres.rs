use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spek_core::{Listing, Query, QueryId, SearchParams};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};

use crate::{QueryRegistry, ResultLedger, StorageError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct QueryRow {
    id: String,
    query: String,
    category: Option<i32>,
    sub_category: Option<i32>,
    postcode: String,
    distance_meters: Option<i32>,
    attributes_by_id: Vec<i32>,
    include_commercials: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<QueryRow> for Query {
    type Error = StorageError;

    fn try_from(row: QueryRow) -> Result<Self, Self::Error> {
        Ok(Query {
            id: QueryId::from(row.id),
            params: SearchParams {
                query: row.query,
                category: row.category.map(|v| from_column("category", v)).transpose()?,
                sub_category: row
                    .sub_category
                    .map(|v| from_column("sub_category", v))
                    .transpose()?,
                postcode: row.postcode,
                distance_meters: row
                    .distance_meters
                    .map(|v| from_column("distance_meters", v))
                    .transpose()?,
                attributes_by_id: row
                    .attributes_by_id
                    .into_iter()
                    .map(|v| from_column("attributes_by_id", v))
                    .collect::<Result<_, _>>()?,
                include_commercials: row.include_commercials,
            },
            created_at: row.created_at,
        })
    }
}

fn from_column(column: &'static str, value: i32) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::OutOfRange {
        column,
        value: value.into(),
    })
}

fn to_column(column: &'static str, value: u32) -> Result<i32, StorageError> {
    i32::try_from(value).map_err(|_| StorageError::OutOfRange {
        column,
        value: value.into(),
    })
}

#[async_trait]
impl QueryRegistry for PgStore {
    async fn create(&self, params: SearchParams) -> Result<Query, StorageError> {
        let query = Query::new(params);
        let p = &query.params;
        let attributes = p
            .attributes_by_id
            .iter()
            .map(|v| to_column("attributes_by_id", *v))
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query(
            r#"
            INSERT INTO query (id, query, category, sub_category, postcode, distance_meters,
                               attributes_by_id, include_commercials, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(query.id.as_str())
        .bind(&p.query)
        .bind(p.category.map(|v| to_column("category", v)).transpose()?)
        .bind(p.sub_category.map(|v| to_column("sub_category", v)).transpose()?)
        .bind(&p.postcode)
        .bind(
            p.distance_meters
                .map(|v| to_column("distance_meters", v))
                .transpose()?,
        )
        .bind(attributes)
        .bind(p.include_commercials)
        .bind(query.created_at)
        .execute(&self.pool)
        .await?;

        debug!(query_id = %query.id, "query registered");
        Ok(query)
    }

    async fn get(&self, id: &QueryId) -> Result<Query, StorageError> {
        let row = sqlx::query_as::<_, QueryRow>(
            r#"
            SELECT id, query, category, sub_category, postcode, distance_meters,
                   attributes_by_id, include_commercials, created_at
              FROM query
             WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StorageError::NotFound(id.clone()))?
            .try_into()
    }

    async fn list(&self) -> Result<Vec<Query>, StorageError> {
        let rows = sqlx::query_as::<_, QueryRow>(
            r#"
            SELECT id, query, category, sub_category, postcode, distance_meters,
                   attributes_by_id, include_commercials, created_at
              FROM query
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Query::try_from).collect()
    }

    async fn delete(&self, id: &QueryId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let results = sqlx::query("DELETE FROM query_result WHERE query_id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM query WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(query_id = %id, ledger_rows = results.rows_affected(), "query deleted");
        Ok(())
    }
}

#[async_trait]
impl ResultLedger for PgStore {
    async fn announced(&self, query_id: &QueryId) -> Result<HashSet<String>, StorageError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT result_id FROM query_result WHERE query_id = $1")
                .bind(query_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn mark_announced(
        &self,
        query_id: &QueryId,
        listings: &[Listing],
    ) -> Result<Vec<String>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(listings.len());

        // Any error drops `tx` before commit, which rolls back every row.
        for listing in listings {
            let result = sqlx::query(
                r#"
                INSERT INTO query_result (query_id, result_id, title, city, url,
                                          price_in_cents, image_urls)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (query_id, result_id) DO NOTHING
                "#,
            )
            .bind(query_id.as_str())
            .bind(&listing.id)
            .bind(&listing.title)
            .bind(&listing.location.city_name)
            .bind(&listing.url)
            .bind(listing.price.price_cents)
            .bind(&listing.image_urls)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                inserted.push(listing.id.clone());
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
