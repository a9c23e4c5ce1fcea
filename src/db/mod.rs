//! SQLite-backed client and subscription records.
//!
//! Usage accounting runs in one transaction per served request:
//! subscription totals bump, the per-user rows upsert, the requesting
//! IP is recorded once, and the distinct-IP counters recompute from
//! the recorded IPs.

use crate::error::DbError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, SqlitePool};
use std::net::IpAddr;
use std::str::FromStr;

/// A gateway client looked up by UUID.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub is_blocked: bool,
}

/// One upstream subscription source.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub link: String,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema exists.
    pub async fn connect(path: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub async fn connect_memory() -> Result<Self, DbError> {
        // One connection so every query sees the same memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Direct pool access for admin tooling and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL DEFAULT '',
                is_blocked INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                link TEXT NOT NULL,
                total_subs INTEGER NOT NULL DEFAULT 0,
                created_by INTEGER
            );
            CREATE TABLE IF NOT EXISTS user_subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                subscription_id INTEGER NOT NULL,
                sub_count INTEGER NOT NULL DEFAULT 0,
                unique_ip_count INTEGER NOT NULL DEFAULT 0,
                last_used TEXT,
                UNIQUE(user_id, subscription_id)
            );
            CREATE TABLE IF NOT EXISTS user_ips (
                user_id INTEGER NOT NULL,
                subscription_id INTEGER NOT NULL,
                ip_address TEXT NOT NULL,
                UNIQUE(user_id, subscription_id, ip_address)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_user_by_uuid(&self, uuid: &str) -> Result<Option<User>, DbError> {
        let user = sqlx::query_as::<_, User>("SELECT id, is_blocked FROM users WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn all_subscription_ids(&self) -> Result<Vec<i64>, DbError> {
        let rows = sqlx::query("SELECT id FROM subscriptions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>(0)).collect())
    }

    pub async fn single_subscription(&self, id: i64) -> Result<Option<Subscription>, DbError> {
        let sub =
            sqlx::query_as::<_, Subscription>("SELECT id, link FROM subscriptions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sub)
    }

    /// Links for the given subscription ids, in id order. Unknown ids
    /// are silently absent from the result.
    pub async fn subscription_links(&self, ids: &[i64]) -> Result<Vec<String>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::new("SELECT link FROM subscriptions WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY id");
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    /// Account one served aggregation for `user_id` over `ids` from
    /// `ip`.
    pub async fn record_usage(
        &self,
        user_id: i64,
        ids: &[i64],
        ip: IpAddr,
    ) -> Result<(), DbError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ip = ip.to_string();
        let mut tx = self.pool.begin().await?;

        let mut builder =
            QueryBuilder::new("UPDATE subscriptions SET total_subs = total_subs + 1 WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        builder.build().execute(&mut *tx).await?;

        for id in ids {
            sqlx::query(
                r#"
                INSERT INTO user_subscriptions (user_id, subscription_id, sub_count, last_used)
                VALUES (?, ?, 1, datetime('now'))
                ON CONFLICT(user_id, subscription_id)
                DO UPDATE SET sub_count = sub_count + 1, last_used = datetime('now')
                "#,
            )
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT OR IGNORE INTO user_ips (user_id, subscription_id, ip_address) VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(id)
            .bind(&ip)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE user_subscriptions
                SET unique_ip_count = (
                    SELECT COUNT(DISTINCT ip_address) FROM user_ips
                    WHERE user_id = ? AND subscription_id = ?
                )
                WHERE user_id = ? AND subscription_id = ?
                "#,
            )
            .bind(user_id)
            .bind(id)
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
