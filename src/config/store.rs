use arc_swap::ArcSwap;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::ClientConfig;
use crate::error::{AppError, Result};
use crate::session::PersistedSession;

/// Configuration and session store backed by SQLite
///
/// Uses `ArcSwap` for lock-free reads of the configuration. The persisted
/// session (display name and last rooms) lives in its own table so it can be
/// written on every confirmed join without touching the configuration.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<ClientConfig>>,
}

impl ConfigStore {
    /// Open (or create) the store at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            // One reader, one writer is plenty for a single client
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        let config = Self::load_config(&pool).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        Ok(Self { pool, cache })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                name TEXT,
                current_room TEXT,
                desired_room TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_config(pool: &Pool<Sqlite>) -> Result<ClientConfig> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config WHERE key = 'client_config'")
                .fetch_optional(pool)
                .await?;

        match row {
            Some((json,)) => {
                serde_json::from_str(&json).map_err(|e| AppError::Config(e.to_string()))
            }
            None => {
                let config = ClientConfig::default();
                Self::save_config_to_db(pool, &config).await?;
                Ok(config)
            }
        }
    }

    async fn save_config_to_db(pool: &Pool<Sqlite>, config: &ClientConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;

        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES ('client_config', ?1, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = ?1, updated_at = datetime('now')
            "#,
        )
        .bind(&json)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Current configuration (lock-free)
    pub fn get(&self) -> Arc<ClientConfig> {
        self.cache.load_full()
    }

    /// Read-modify-write the configuration; last writer wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ClientConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        Self::save_config_to_db(&self.pool, &config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }

    /// Load the persisted session, empty if nothing was saved yet
    pub async fn load_session(&self) -> Result<PersistedSession> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT name, current_room, desired_room FROM session_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((name, current_room, desired_room)) => PersistedSession {
                name,
                current_room,
                desired_room,
            },
            None => PersistedSession::default(),
        })
    }

    /// Persist the session
    pub async fn save_session(&self, session: &PersistedSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_state (id, name, current_room, desired_room, updated_at)
            VALUES (1, ?1, ?2, ?3, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                name = ?1, current_room = ?2, desired_room = ?3, updated_at = datetime('now')
            "#,
        )
        .bind(&session.name)
        .bind(&session.current_room)
        .bind(&session.desired_room)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
