use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Which backends the broker runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Microsoft Graph + Cloudflare R2/KV.
    Cloud,
    /// In-process stores; for local runs and demos.
    Memory,
}

/// Configuration for the docbroker server.
#[derive(Parser, Debug, Clone)]
#[command(name = "docbroker-server")]
#[command(about = "Document broker: webhook intake, delta sync and deferred publication")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Port to bind to
    #[arg(long, default_value = "8080", env = "PORT")]
    pub port: u16,

    /// JSON settings file (containers, field mapping, classification destinations)
    #[arg(long, env = "DOCBROKER_SETTINGS")]
    pub settings: PathBuf,

    /// Backend selection
    #[arg(long, value_enum, default_value = "cloud", env = "DOCBROKER_BACKEND")]
    pub backend: BackendKind,

    // -- Microsoft Graph ------------------------------------------------------
    /// Entra ID tenant
    #[arg(long, env = "AZURE_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// App registration client id
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// App registration client secret
    #[arg(long, env = "AZURE_CLIENT_SECRET")]
    pub client_secret: Option<String>,

    #[arg(long, default_value = "https://graph.microsoft.com/v1.0", env = "GRAPH_BASE_URL")]
    pub graph_base_url: String,

    #[arg(long, default_value = "https://login.microsoftonline.com", env = "AUTHORITY_URL")]
    pub authority_url: String,

    /// Mailbox author notifications are sent from (notifications are only logged when unset)
    #[arg(long, env = "MAIL_SENDER")]
    pub mail_sender: Option<String>,

    // -- Cloudflare -----------------------------------------------------------
    /// Cloudflare account ID
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub cloudflare_account_id: Option<String>,

    /// Cloudflare API token (KV)
    #[arg(long, env = "CLOUDFLARE_API_TOKEN")]
    pub cloudflare_api_token: Option<String>,

    /// KV namespace for checkpoints and subscription state
    #[arg(long, env = "KV_NAMESPACE_ID")]
    pub kv_namespace_id: Option<String>,

    /// R2 bucket for identities, content, publications and the notification queue
    #[arg(long, env = "R2_BUCKET_NAME")]
    pub r2_bucket_name: Option<String>,

    /// R2 access key ID (for S3-compatible API)
    #[arg(long, env = "R2_ACCESS_KEY_ID")]
    pub r2_access_key_id: Option<String>,

    /// R2 secret access key (for S3-compatible API)
    #[arg(long, env = "R2_SECRET_ACCESS_KEY")]
    pub r2_secret_access_key: Option<String>,

    // -- Callbacks and scheduling ----------------------------------------------
    /// Third-party callback base URL (callbacks are only logged when unset)
    #[arg(long, env = "CALLBACK_BASE_URL")]
    pub callback_base_url: Option<String>,

    /// Seconds between sync passes over all feeds (0 disables the loop)
    #[arg(long, default_value = "300", env = "SYNC_INTERVAL_SECS")]
    pub sync_interval_secs: u64,

    /// UTC hour of the daily publication drain
    #[arg(long, default_value = "5", env = "PUBLICATION_DRAIN_HOUR",
          value_parser = clap::value_parser!(u32).range(0..24))]
    pub publication_drain_hour: u32,

    /// Seconds between notification queue polls
    #[arg(long, default_value = "5", env = "QUEUE_POLL_SECS")]
    pub queue_poll_secs: u64,

    /// Messages taken from the notification queue per poll
    #[arg(long, default_value = "16", env = "QUEUE_BATCH_SIZE")]
    pub queue_batch_size: usize,

    /// Hours between subscription maintenance passes
    #[arg(long, default_value = "12", env = "SUBSCRIPTION_CHECK_HOURS")]
    pub subscription_check_hours: u64,

    /// Timeout of repository and callback requests
    #[arg(long, default_value = "60", env = "HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,
}

impl Config {
    /// Bind address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
