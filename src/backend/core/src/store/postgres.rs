//! PostgreSQL authoritative source.

use async_trait::async_trait;
use metrics::{counter, histogram};
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use super::AuthoritativeSource;
use crate::aggregate::{AggregateRecord, EntityId};
use crate::config::DatabaseConfig;
use crate::error::{Result, RollupError};

static IDENTIFIER: OnceLock<Option<Regex>> = OnceLock::new();

fn identifier_pattern() -> Option<&'static Regex> {
    IDENTIFIER
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").ok())
        .as_ref()
}

/// Quote a column or table name; `schema.table` is quoted per part.
fn quote_identifier(raw: &str) -> Result<String> {
    let pattern = identifier_pattern()
        .ok_or_else(|| RollupError::internal("identifier pattern failed to compile"))?;

    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| !pattern.is_match(p)) {
        return Err(RollupError::configuration(format!(
            "invalid SQL identifier {:?}",
            raw
        )));
    }

    Ok(parts
        .iter()
        .map(|p| format!("\"{}\"", p))
        .collect::<Vec<_>>()
        .join("."))
}

/// The exact aggregation query, built once from validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    sql: String,
}

impl AggregateQuery {
    pub fn new(table: &str, entity_column: &str, value_column: &str, id_column: &str) -> Result<Self> {
        let sql = format!(
            "SELECT COALESCE(AVG({value}), 0)::float8 AS mean, COUNT({id}) AS count FROM {table} WHERE {entity} = $1",
            value = quote_identifier(value_column)?,
            id = quote_identifier(id_column)?,
            table = quote_identifier(table)?,
            entity = quote_identifier(entity_column)?,
        );
        Ok(Self { sql })
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::new(
            &config.table,
            &config.entity_column,
            &config.value_column,
            &config.id_column,
        )
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Recomputes aggregates with one `AVG`/`COUNT` query per entity.
#[derive(Clone)]
pub struct PgAuthoritativeSource {
    pool: PgPool,
    query: AggregateQuery,
}

impl PgAuthoritativeSource {
    pub fn new(pool: PgPool, query: AggregateQuery) -> Self {
        Self { pool, query }
    }

    /// Create the connection pool and the query from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let query = AggregateQuery::from_config(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            table = %config.table,
            "Connected to authoritative database"
        );
        Ok(Self::new(pool, query))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuthoritativeSource for PgAuthoritativeSource {
    async fn recompute(&self, entity: EntityId) -> Result<AggregateRecord> {
        let started = Instant::now();
        let (mean, count): (Option<f64>, Option<i64>) = sqlx::query_as(self.query.sql())
            .bind(entity.0)
            .fetch_one(&self.pool)
            .await?;

        histogram!("rollup_authoritative_query_seconds").record(started.elapsed().as_secs_f64());
        counter!("rollup_authoritative_queries_total").increment(1);

        let count = count.unwrap_or(0).max(0) as u64;
        let record = AggregateRecord::new(mean.unwrap_or(0.0), count);
        tracing::debug!(entity_id = %entity, %record, "Recomputed aggregate from database");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_default_query() {
        let query = AggregateQuery::from_config(&DatabaseConfig::default()).unwrap();
        assert_eq!(
            query.sql(),
            r#"SELECT COALESCE(AVG("rating"), 0)::float8 AS mean, COUNT("id") AS count FROM "review" WHERE "productId" = $1"#
        );
    }

    #[test]
    fn test_schema_qualified_table() {
        let query = AggregateQuery::new("shop.review", "product_id", "stars", "id").unwrap();
        assert!(query.sql().contains(r#"FROM "shop"."review""#));
    }

    #[test]
    fn test_rejects_injection() {
        let err = AggregateQuery::new("review; DROP TABLE review", "productId", "rating", "id")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert!(AggregateQuery::new("review", "product\"Id", "rating", "id").is_err());
        assert!(AggregateQuery::new("a.b.c", "productId", "rating", "id").is_err());
        assert!(AggregateQuery::new("review", "", "rating", "id").is_err());
    }
}
