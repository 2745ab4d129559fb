//! Persistence for the progression state.
//!
//! The whole [`ProgressionState`] is stored as one JSON document in a
//! key-value table, so a restart resumes with the same rosters, baselines
//! and archive.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::types::ProgressionState;

/// Key the progression document is stored under.
pub const PROGRESSION_STATE_KEY: &str = "token_progression_state";

/// Contract for loading and saving progression state.
#[async_trait]
pub trait ProgressionStore: Send + Sync {
    /// Last saved state, or `None` if nothing has been saved yet.
    async fn load(&self) -> Result<Option<ProgressionState>>;

    /// Replace the saved state.
    async fn save(&self, state: &ProgressionState) -> Result<()>;

    /// Forget the saved state.
    async fn clear(&self) -> Result<()>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;
}

/// Load saved state, falling back to an empty state when nothing is saved
/// or the saved document cannot be read.
pub async fn load_or_empty(store: &dyn ProgressionStore) -> ProgressionState {
    match store.load().await {
        Ok(Some(state)) => {
            info!(
                "Restored progression state: {} tracked, {} archived",
                state.total_tracked(),
                state.archive.len()
            );
            state
        }
        Ok(None) => {
            info!("No saved progression state, starting empty");
            ProgressionState::default()
        }
        Err(e) => {
            warn!("Failed to load progression state, starting empty: {:#}", e);
            ProgressionState::default()
        }
    }
}

/// SQLite implementation of [`ProgressionStore`].
pub struct SqliteProgressionStore {
    pool: Pool<Sqlite>,
}

impl SqliteProgressionStore {
    /// Open (or create) the database file at `path`.
    pub async fn new(path: &str) -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}?mode=rwc", path))
            .await
            .with_context(|| format!("Failed to connect to SQLite database at {}", path))?;

        let store = Self { pool };
        store.create_schema().await?;
        info!("SqliteProgressionStore initialized at {}", path);

        Ok(Arc::new(store))
    }

    /// Private in-memory database. A single connection that never expires
    /// keeps the data alive for the life of the pool.
    pub async fn in_memory() -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.create_schema().await?;

        Ok(Arc::new(store))
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create kv_store table")?;

        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl ProgressionStore for SqliteProgressionStore {
    async fn load(&self) -> Result<Option<ProgressionState>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(PROGRESSION_STATE_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read progression state")?;

        match row {
            Some((json,)) => {
                let state = serde_json::from_str(&json).context("Failed to decode progression state")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ProgressionState) -> Result<()> {
        let json = serde_json::to_string(state).context("Failed to encode progression state")?;
        debug!("Saving progression state ({} bytes)", json.len());

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at;
            "#,
        )
        .bind(PROGRESSION_STATE_KEY)
        .bind(json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to write progression state")?;

        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(PROGRESSION_STATE_KEY)
            .execute(&self.pool)
            .await
            .context("Failed to clear progression state")?;

        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
