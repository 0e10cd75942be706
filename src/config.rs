use crate::services::s3_storage::S3Settings;
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use std::env;

/// Which storage backend the gateway talks to.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Any S3-compatible endpoint.
    S3,
    /// SQLite metadata + local disk payloads.
    Local,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub backend: BackendKind,
    pub s3: S3Settings,
    pub storage_dir: String,
    pub database_url: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Streaming HTTP gateway for object storage")]
pub struct Args {
    /// Address to listen on (overrides LISTEN_ADDR)
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Storage backend (overrides GATEWAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// S3 endpoint as host:port or URL (overrides S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 access key id (overrides S3_ACCESS_KEY_ID)
    #[arg(long)]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key (overrides S3_SECRET_ACCESS_KEY)
    #[arg(long)]
    pub s3_secret_access_key: Option<String>,

    /// Use TLS towards the S3 endpoint (overrides S3_USE_SSL)
    #[arg(long)]
    pub s3_use_ssl: Option<bool>,

    /// S3 region (overrides S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Directory for local object payloads (overrides GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// SQLite URL for local metadata (overrides GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Parse process arguments and environment into an AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over the variables returned by `lookup`, over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = match args.backend {
            Some(kind) => kind,
            None => match env_var("GATEWAY_BACKEND") {
                Some(value) => BackendKind::from_str(&value, true)
                    .map_err(|err| anyhow!(err))
                    .with_context(|| format!("parsing GATEWAY_BACKEND value `{}`", value))?,
                None => BackendKind::S3,
            },
        };

        let use_ssl = match args.s3_use_ssl {
            Some(flag) => flag,
            None => match env_var("S3_USE_SSL") {
                Some(value) => parse_bool(&value)
                    .with_context(|| format!("parsing S3_USE_SSL value `{}`", value))?,
                None => true,
            },
        };

        let s3 = S3Settings {
            endpoint: args
                .s3_endpoint
                .or_else(|| env_var("S3_ENDPOINT"))
                .unwrap_or_else(|| "localhost:9000".into()),
            access_key_id: args
                .s3_access_key_id
                .or_else(|| env_var("S3_ACCESS_KEY_ID")),
            secret_access_key: args
                .s3_secret_access_key
                .or_else(|| env_var("S3_SECRET_ACCESS_KEY")),
            use_ssl,
            region: args
                .s3_region
                .or_else(|| env_var("S3_REGION"))
                .unwrap_or_else(|| "us-east-1".into()),
        };

        if backend == BackendKind::S3
            && s3.access_key_id.is_some() != s3.secret_access_key.is_some()
        {
            bail!("S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together");
        }

        Ok(Self {
            listen_addr: args
                .listen_addr
                .or_else(|| env_var("LISTEN_ADDR"))
                .unwrap_or_else(|| "0.0.0.0:9001".into()),
            backend,
            s3,
            storage_dir: args
                .storage_dir
                .or_else(|| env_var("GATEWAY_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| env_var("GATEWAY_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/gateway.db".into()),
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got `{}`", other),
    }
}
