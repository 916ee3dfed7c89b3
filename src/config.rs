//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const WEBDAV_PREFIX: &str = "/webdav";
pub const DEFAULT_AUTH_USER: &str = "axo";
pub const DEFAULT_AUTH_PASS: &str = "axo";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_LOCK_MAX_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_REQUEST_LOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LOCK_CLEANUP_THRESHOLD: usize = 1000;
pub const DEFAULT_LOCK_SWEEP_INTERVAL_SECS: u64 = 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-cal", version, about = "AxoCal calendar WebDAV server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_CAL_STORAGE_DIR",
        default_value = ".axo-cal/storage",
        help = "Storage directory for calendars"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "AXO_CAL_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Basic auth username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "AXO_CAL_AUTH_PASS",
        default_value = DEFAULT_AUTH_PASS,
        help = "Basic auth password"
    )]
    pub auth_pass: String,
    #[arg(long, env = "AXO_CAL_NO_AUTH", help = "Disable authentication")]
    pub no_auth: bool,
    #[arg(
        short = 'b',
        long,
        env = "AXO_CAL_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_CAL_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_CAL_HTTPS_PORT",
        default_value_t = 5006,
        help = "HTTPS port"
    )]
    pub https_port: u16,
    #[arg(long, env = "AXO_CAL_TLS", help = "Enable the HTTPS listener")]
    pub tls: bool,
    #[arg(short = 'c', long, env = "AXO_CAL_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_CAL_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_CAL_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_CAL_LOCK_DEFAULT_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_TIMEOUT_SECS,
        help = "Lock timeout when the client requests none"
    )]
    pub lock_default_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_CAL_LOCK_MAX_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_MAX_TIMEOUT_SECS,
        help = "Upper bound for client lock timeouts"
    )]
    pub lock_max_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_CAL_REQUEST_LOCK_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_LOCK_TIMEOUT_SECS,
        help = "Lifetime of request-scoped temporary locks"
    )]
    pub request_lock_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_CAL_LOCK_CLEANUP_THRESHOLD",
        default_value_t = DEFAULT_LOCK_CLEANUP_THRESHOLD,
        help = "Lock nodes created between tree compactions"
    )]
    pub lock_cleanup_threshold: usize,
    #[arg(
        long,
        env = "AXO_CAL_LOCK_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_LOCK_SWEEP_INTERVAL_SECS,
        help = "Interval of the expired lock sweep"
    )]
    pub lock_sweep_interval_secs: u64,
}
