use crate::models::chunk::DEFAULT_CHUNK_SIZE;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub chunk_size: u64,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub finalize_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked-upload server")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding partial and final artifacts (overrides CHUNKED_UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size in bytes for new uploads (overrides CHUNKED_UPLOAD_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Seconds between stale-upload sweeps (overrides CHUNKED_UPLOAD_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Age in seconds after which a receiving upload is reclaimed (overrides CHUNKED_UPLOAD_STALE_AFTER_SECS)
    #[arg(long)]
    pub stale_after_secs: Option<u64>,

    /// Seconds a finalize may hold an upload before it is released (overrides CHUNKED_UPLOAD_FINALIZE_TIMEOUT_SECS)
    #[arg(long)]
    pub finalize_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let cfg = Self::merge(&args)?;
        Ok((cfg, args.migrate))
    }

    fn merge(args: &Args) -> Result<Self> {
        let host = match &args.host {
            Some(host) => host.clone(),
            None => env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        };
        let storage_dir = match &args.storage_dir {
            Some(dir) => dir.clone(),
            None => env::var("CHUNKED_UPLOAD_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into()),
        };
        let database_url = match &args.database_url {
            Some(url) => url.clone(),
            None => env::var("CHUNKED_UPLOAD_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into()),
        };

        let cfg = Self {
            host,
            port: pick(args.port, "CHUNKED_UPLOAD_PORT", 3000)?,
            storage_dir,
            database_url,
            chunk_size: pick(args.chunk_size, "CHUNKED_UPLOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            sweep_interval: Duration::from_secs(pick(
                args.sweep_interval_secs,
                "CHUNKED_UPLOAD_SWEEP_INTERVAL_SECS",
                30 * 60,
            )?),
            stale_after: Duration::from_secs(pick(
                args.stale_after_secs,
                "CHUNKED_UPLOAD_STALE_AFTER_SECS",
                24 * 60 * 60,
            )?),
            finalize_timeout: Duration::from_secs(pick(
                args.finalize_timeout_secs,
                "CHUNKED_UPLOAD_FINALIZE_TIMEOUT_SECS",
                15 * 60,
            )?),
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if cfg.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be positive");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CLI value if given, else the parsed environment variable, else `default`.
fn pick<T>(arg: Option<T>, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = arg {
        return Ok(value);
    }
    match env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_defaults() {
        let args = Args::parse_from([
            "chunked-upload",
            "--port",
            "8081",
            "--chunk-size",
            "1024",
            "--stale-after-secs",
            "60",
        ]);
        let cfg = AppConfig::merge(&args).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.stale_after, Duration::from_secs(60));
        assert_eq!(cfg.addr(), format!("{}:8081", cfg.host));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let args = Args::parse_from(["chunked-upload", "--chunk-size", "0"]);
        assert!(AppConfig::merge(&args).is_err());
    }
}
