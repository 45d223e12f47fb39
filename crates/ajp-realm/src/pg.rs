// SPDX-License-Identifier: AGPL-3.0-only
//! PostgreSQL data source: a fresh connection per lookup, no pooling.

use crate::datasource::{DataSource, DbConnection, Row};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::{Column, Connection, Row as _};

#[derive(Clone)]
pub struct PgDataSource {
    url: String,
}

impl PgDataSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl std::fmt::Debug for PgDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the URL may carry a password
        f.debug_struct("PgDataSource").finish_non_exhaustive()
    }
}

struct PgDbConnection {
    conn: PgConnection,
}

#[async_trait]
impl DataSource for PgDataSource {
    async fn connect(&self) -> Result<Box<dyn DbConnection>> {
        let conn = PgConnection::connect(&self.url)
            .await
            .context("connecting to PostgreSQL")?;
        Ok(Box::new(PgDbConnection { conn }))
    }
}

#[async_trait]
impl DbConnection for PgDbConnection {
    async fn query(&mut self, sql: &str, param: &str) -> Result<Vec<Row>> {
        let rows = sqlx::query(sql)
            .bind(param)
            .fetch_all(&mut self.conn)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.columns().len());
            for column in row.columns() {
                let value: Option<String> = row
                    .try_get(column.ordinal())
                    .with_context(|| format!("column {} is not text", column.name()))?;
                values.push((column.name().to_string(), value));
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}
