use crate::models::Trade;
use crate::risk::RiskState;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::{timeout, Duration};

const REDIS_SNAPSHOT_KEY: &str = "metalsbot:snapshot";

/// Everything needed to resume after a restart without re-entering open
/// positions or double-counting drawdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub risk: RiskState,
    pub open_trades: Vec<Trade>,
    pub last_tick: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when nothing has been saved yet
    async fn load(&self) -> Result<Option<EngineSnapshot>>;

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// JSON snapshot on local disk
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: EngineSnapshot = serde_json::from_str(&raw)?;
        tracing::info!(
            "Loaded snapshot from {} ({} open trades)",
            self.path.display(),
            snapshot.open_trades.len()
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        tracing::debug!("Saved snapshot to {}", self.path.display());
        Ok(())
    }
}

/// Snapshot stored as a single JSON value in Redis
pub struct RedisStateStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisStateStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: REDIS_SNAPSHOT_KEY.to_string(),
        })
    }

    /// Use a different key, e.g. one per challenge account
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        // ConnectionManager is a cheap handle over a shared connection
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&self.key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(snapshot)?;
        conn.set::<_, _, ()>(&self.key, value).await?;
        tracing::debug!("Saved snapshot to Redis key {}", self.key);
        Ok(())
    }
}

/// In-process store, used by the paper mode and tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: tokio::sync::RwLock<Option<EngineSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }
}
