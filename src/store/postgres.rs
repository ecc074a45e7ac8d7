//! PostgreSQL storage driver.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::{debug, info};

use crate::cdr::Cdr;
use crate::config::DatabaseConfig;

use super::{CdrStore, StoreError};

/// Columns carrying a btree index.
const INDEXED_COLUMNS: [&str; 5] = ["code_used", "dst_num", "in_trunk", "src_num", "vdn"];

/// PostgreSQL store backed by a `sqlx` pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    insert: String,
}

impl PostgresStore {
    /// Connect using the database section of the configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(PgSslMode::Disable);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.name,
            table = %config.table,
            "connected to PostgreSQL"
        );

        Ok(Self::with_pool(pool, &config.table))
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            insert: insert_statement(table),
        }
    }
}

#[async_trait]
impl CdrStore for PostgresStore {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        for statement in schema_statements(&self.table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::CreateTable {
                    table: self.table.clone(),
                    reason: e.to_string(),
                })?;
        }

        info!(table = %self.table, "CDR table ready");
        Ok(())
    }

    async fn persist(&self, cdr: &Cdr) -> Result<(), StoreError> {
        let result = sqlx::query(&self.insert)
            .bind(&cdr.source)
            .bind(cdr.timestamp.naive_local())
            .bind(int4(cdr.duration))
            .bind(cdr.cond_code.to_string())
            .bind(&cdr.code_dial)
            .bind(&cdr.code_used)
            .bind(&cdr.dialed_num)
            .bind(&cdr.calling_num)
            .bind(&cdr.acct_code)
            .bind(int4(cdr.ppm))
            .bind(int4(cdr.in_trk_s))
            .bind(int4(cdr.out_trk_s))
            .bind(&cdr.in_trk)
            .bind(&cdr.vdn)
            .bind(cdr.feat_flag.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolClosed => StoreError::Closed,
                e => StoreError::Insert(e.to_string()),
            })?;

        match result.rows_affected() {
            1 => {
                debug!(source = %cdr.source, "CDR inserted");
                Ok(())
            }
            n => Err(StoreError::RowsAffected(n)),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(table = %self.table, "PostgreSQL pool closed");
    }
}

fn int4(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn schema_statements(table: &str) -> Vec<String> {
    let mut statements = vec![format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id serial primary key,
            host varchar(45) not null,
            datetime timestamp,
            duration int4,
            cond_code bpchar(1),
            code_dial bpchar(4),
            code_used bpchar(4),
            dst_num varchar(23) not null,
            src_num varchar(15),
            acct_code varchar(15),
            ppm int4,
            in_trunk_ts int4,
            out_trunk_ts int4,
            in_trunk bpchar(4),
            vdn varchar(7),
            feat_flag bpchar(1)
        )
        "#
    )];

    for column in INDEXED_COLUMNS {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {table}_{column}_idx ON {table} USING btree ({column})"
        ));
    }
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {table}_datetime_idx ON {table} USING brin (datetime)"
    ));

    statements
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (host, datetime, duration, cond_code, code_dial, code_used, \
         dst_num, src_num, acct_code, ppm, in_trunk_ts, out_trunk_ts, in_trunk, vdn, feat_flag) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements() {
        let statements = schema_statements("avaya_cdr");
        assert_eq!(statements.len(), 7);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS avaya_cdr"));
        assert!(statements[0].contains("host varchar(45) not null"));
        assert!(statements[1].contains("avaya_cdr_code_used_idx"));
        assert!(statements[6].contains("USING brin (datetime)"));
    }

    #[test]
    fn test_insert_statement_uses_table() {
        let sql = insert_statement("calls");
        assert!(sql.starts_with("INSERT INTO calls (host, datetime"));
        assert!(sql.ends_with("$15)"));
    }

    #[test]
    fn test_int4_saturates() {
        assert_eq!(int4(60), 60);
        assert_eq!(int4(u32::MAX), i32::MAX);
    }
}
