use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::env;

/// Hard ceiling for a single chunk PUT. The server clamps any larger
/// requested chunk size down to this.
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,

    /// Signing secret for download tokens.
    pub token_secret: String,

    /// Session time-to-live in minutes.
    pub session_ttl_minutes: i64,

    /// How long expired/failed session artifacts are kept for
    /// diagnostics before garbage collection removes them.
    pub session_retention_minutes: i64,

    /// Files at or below this size are assembled inline so finalize
    /// returns `completed` directly; larger ones assemble in a task.
    pub sync_finalize_max_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked-upload file sharing service")]
pub struct Args {
    /// Host to bind to (overrides SHARE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHARE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks and files are stored (overrides SHARE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SHARE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Serve,

    /// Run migrations and exit.
    Migrate,

    /// Upload a file to a running server using the chunk scheduler.
    Upload {
        /// Path of the file to upload.
        file: String,

        /// Base URL of the server.
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,

        /// Chunk size in bytes.
        #[arg(long, default_value_t = 8 * 1024 * 1024)]
        chunk_size: u64,

        /// Parallel upload workers.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Owner API key sent as a bearer credential.
        #[arg(long)]
        api_key: Option<String>,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the
    /// selected command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();

        let env_host = env::var("SHARE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("SHARE_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing SHARE_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading SHARE_STORE_PORT"),
        };
        let env_storage =
            env::var("SHARE_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/storage".into());
        let env_db = env::var("SHARE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/share_store.db".into());
        let token_secret =
            env::var("SHARE_STORE_TOKEN_SECRET").unwrap_or_else(|_| "change-me".into());
        let session_ttl_minutes = parse_env_i64("SHARE_STORE_SESSION_TTL_MINUTES", 6 * 60)?;
        let session_retention_minutes =
            parse_env_i64("SHARE_STORE_SESSION_RETENTION_MINUTES", 24 * 60)?;
        let sync_finalize_max_bytes = parse_env_i64("SHARE_STORE_SYNC_FINALIZE_MAX_BYTES", 0)?
            .try_into()
            .context("SHARE_STORE_SYNC_FINALIZE_MAX_BYTES must not be negative")?;

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            token_secret,
            session_ttl_minutes,
            session_retention_minutes,
            sync_finalize_max_bytes,
        };

        Ok((cfg, args.command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env_i64(name: &str, default: i64) -> Result<i64> {
    match env::var(name) {
        Ok(value) => value
            .parse::<i64>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
