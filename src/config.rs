use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::{
    backend::BackendConfig, content_store::IngestLimits, reclamation::ReclamationPolicy,
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub max_upload_bytes: usize,
    pub min_image_dimension: u32,
    pub max_image_dimension: u32,
    pub retention_days: i64,
    pub reclaim_hour: u32,
    pub reclaim_enabled: bool,
    pub backend_url: String,
    pub backend_submit_timeout_secs: u64,
    pub backend_health_timeout_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Avatar generation store with deduplicated uploads")]
pub struct Args {
    /// Host to bind to (overrides AVATAR_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides AVATAR_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded blobs are stored (overrides AVATAR_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides AVATAR_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Days a zero-reference blob may sit idle before reclamation
    /// (overrides AVATAR_STORE_RETENTION_DAYS)
    #[arg(long)]
    pub retention_days: Option<i64>,

    /// UTC hour of the daily reclamation sweep (overrides AVATAR_STORE_RECLAIM_HOUR)
    #[arg(long)]
    pub reclaim_hour: Option<u32>,

    /// Disable the daily reclamation sweep
    #[arg(long)]
    pub no_reclaim: bool,

    /// Synthesis backend base URL (overrides AVATAR_STORE_BACKEND_URL)
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge parsed arguments over environment values and defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        let env_reclaim_enabled = env_or("AVATAR_STORE_RECLAIM_ENABLED", true)?;

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("AVATAR_STORE_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_or("AVATAR_STORE_PORT", 8000)?,
            },
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_string("AVATAR_STORE_STORAGE_DIR", "./storage/uploads")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_string(
                    "AVATAR_STORE_DATABASE_URL",
                    "sqlite://./storage/avatar_store.db",
                )
            }),
            max_upload_bytes: env_or("AVATAR_STORE_MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            min_image_dimension: env_or("AVATAR_STORE_MIN_IMAGE_DIMENSION", 64)?,
            max_image_dimension: env_or("AVATAR_STORE_MAX_IMAGE_DIMENSION", 4096)?,
            retention_days: match args.retention_days {
                Some(days) => days,
                None => env_or("AVATAR_STORE_RETENTION_DAYS", 30)?,
            },
            reclaim_hour: match args.reclaim_hour {
                Some(hour) => hour,
                None => env_or("AVATAR_STORE_RECLAIM_HOUR", 2)?,
            },
            reclaim_enabled: env_reclaim_enabled && !args.no_reclaim,
            backend_url: args
                .backend_url
                .unwrap_or_else(|| env_string("AVATAR_STORE_BACKEND_URL", "http://localhost:8188")),
            backend_submit_timeout_secs: env_or("AVATAR_STORE_BACKEND_SUBMIT_TIMEOUT_SECS", 30)?,
            backend_health_timeout_secs: env_or("AVATAR_STORE_BACKEND_HEALTH_TIMEOUT_SECS", 5)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.reclaim_hour > 23 {
            bail!("reclaim hour must be between 0 and 23, got {}", self.reclaim_hour);
        }
        if self.retention_days < 0 {
            bail!("retention days must not be negative, got {}", self.retention_days);
        }
        if self.min_image_dimension > self.max_image_dimension {
            bail!(
                "min image dimension {} exceeds max {}",
                self.min_image_dimension,
                self.max_image_dimension
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_bytes: self.max_upload_bytes,
            min_dimension: self.min_image_dimension,
            max_dimension: self.max_image_dimension,
        }
    }

    pub fn reclamation_policy(&self) -> ReclamationPolicy {
        ReclamationPolicy {
            enabled: self.reclaim_enabled,
            retention: chrono::Duration::days(self.retention_days),
            hour: self.reclaim_hour,
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: self.backend_url.clone(),
            submit_timeout: Duration::from_secs(self.backend_submit_timeout_secs),
            health_timeout: Duration::from_secs(self.backend_health_timeout_secs),
            ..BackendConfig::default()
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
