//! Configuration management for the OrderProof auditor.
//!
//! This module handles loading configuration from:
//! - TOML files
//! - Environment variables referenced as `${VAR_NAME}`
//! - Default values (fallbacks)

use alloy::primitives::Address;
use anyhow::{Context, Result};
use orderproof_core::CanonicalEncoding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Main configuration for the auditor and the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,

    /// Contract addresses
    #[serde(default)]
    pub contracts: ContractsConfig,

    /// Anchor ledger database
    pub database: DatabaseConfig,

    /// Append-only audit store
    pub audit_store: AuditStoreConfig,

    /// Order database (reconciliation source)
    #[serde(default)]
    pub orders: OrdersConfig,

    /// Anchoring configuration
    pub anchor: AnchorConfig,

    /// Reconciliation sweep configuration
    #[serde(default)]
    pub sweep: SweepConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Ethereum RPC URL
    pub rpc_url: String,

    /// Chain ID (e.g., 84532 for Base Sepolia)
    pub chain_id: u64,

    /// Block explorer base URL used to build transaction links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,

    /// Retry policy for read-only RPC calls
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Contract addresses configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractsConfig {
    /// AuditAnchor contract address. Unset until `deploy` has been run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_anchor: Option<Address>,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Audit store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStoreConfig {
    /// SQLite URL of the append-only key-value store
    pub url: String,

    /// Records fetched per page when scanning
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    /// Canonical encoding used for newly recorded orders
    #[serde(default)]
    pub encoding: CanonicalEncoding,

    /// Retry policy for store calls
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Order database configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrdersConfig {
    /// SQLite URL of the marketplace order database. Sweeps are skipped when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Anchoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Private key of the anchoring account (hex, with or without 0x)
    pub private_key: String,

    /// Number of block confirmations before an anchor counts as confirmed
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Upper bound on waiting for confirmations
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Delay between confirmation polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on a whole submission, including confirmations
    #[serde(default = "default_submission_timeout_secs")]
    pub submission_timeout_secs: u64,

    /// Whether to anchor periodically
    #[serde(default)]
    pub auto_anchor: bool,

    /// Interval between periodic anchoring attempts
    #[serde(default = "default_anchor_interval_secs")]
    pub anchor_interval_secs: u64,

    /// Age after which an unmatched PENDING anchor is marked FAILED
    #[serde(default = "default_stale_pending_secs")]
    pub stale_pending_secs: u64,

    /// Path to the compiled AuditAnchor creation bytecode (hex), used by `deploy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytecode_path: Option<PathBuf>,
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Whether the sweep runs in `run` mode
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,

    /// Interval between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Socket address to bind
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Allow requests from any origin
    #[serde(default = "default_cors_permissive")]
    pub cors_permissive: bool,

    /// Enable `POST /v1/audits` and `POST /v1/anchors`
    #[serde(default)]
    pub write_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_permissive: default_cors_permissive(),
            write_enabled: false,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay between retries
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Convert to a [`RetryPolicy`].
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_scan_page_size() -> usize {
    500
}

fn default_confirmations() -> u64 {
    2
}

fn default_confirmation_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    4
}

fn default_submission_timeout_secs() -> u64 {
    900
}

fn default_anchor_interval_secs() -> u64 {
    3600
}

fn default_stale_pending_secs() -> u64 {
    3600
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cors_permissive() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AnchorConfig {
    /// Confirmation wait bound.
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Confirmation poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Whole-submission bound.
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    /// Age at which an unmatched PENDING anchor is given up on.
    pub fn stale_pending_after(&self) -> Duration {
        Duration::from_secs(self.stale_pending_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables can be referenced using `${VAR_NAME}` syntax.
    /// For example: `private_key = "${ANCHOR_PRIVATE_KEY}"`
    ///
    /// # Example
    /// ```no_run
    /// # use orderproof_auditor::config::Config;
    /// let config = Config::from_file("auditor.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = Self::expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            anyhow::bail!("Network RPC URL cannot be empty");
        }
        if self.network.chain_id == 0 {
            anyhow::bail!("Chain ID must be non-zero");
        }
        if let Some(explorer) = self.network.explorer_url.as_deref() {
            if !(explorer.starts_with("https://") || explorer.starts_with("http://")) {
                anyhow::bail!("Network explorer_url must start with http:// or https://");
            }
        }
        Self::validate_retry("network.retry", &self.network.retry)?;

        if let Some(address) = self.contracts.audit_anchor {
            if address.is_zero() {
                anyhow::bail!("Contracts audit_anchor must be a non-zero address when provided");
            }
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.audit_store.url.is_empty() {
            anyhow::bail!("Audit store URL cannot be empty");
        }
        if self.audit_store.scan_page_size == 0 {
            anyhow::bail!("Audit store scan_page_size must be > 0");
        }
        Self::validate_retry("audit_store.retry", &self.audit_store.retry)?;

        if let Some(url) = self.orders.url.as_deref() {
            if url.is_empty() {
                anyhow::bail!("Orders URL cannot be empty when provided");
            }
        }

        if self.anchor.private_key.is_empty() {
            anyhow::bail!("Anchor private_key cannot be empty");
        }
        let key = self.anchor.private_key.trim_start_matches("0x");
        if key.len() != 64 {
            anyhow::bail!(
                "Anchor private_key must be 64 hex characters (got {})",
                key.len()
            );
        }
        if !key.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Anchor private_key must be a valid hex string");
        }
        if self.anchor.confirmation_timeout_secs == 0 {
            anyhow::bail!("Anchor confirmation_timeout_secs must be > 0");
        }
        if self.anchor.poll_interval_secs == 0 {
            anyhow::bail!("Anchor poll_interval_secs must be > 0");
        }
        if self.anchor.submission_timeout_secs < self.anchor.confirmation_timeout_secs {
            anyhow::bail!(
                "Anchor submission_timeout_secs ({}) must be >= confirmation_timeout_secs ({})",
                self.anchor.submission_timeout_secs,
                self.anchor.confirmation_timeout_secs
            );
        }
        if self.anchor.anchor_interval_secs == 0 {
            anyhow::bail!(
                "Anchor anchor_interval_secs must be > 0 (tokio interval cannot be zero)"
            );
        }

        if self.sweep.interval_secs == 0 {
            anyhow::bail!("Sweep interval_secs must be > 0");
        }

        if self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("API bind must be a socket address (got '{}')", self.api.bind);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }

    fn validate_retry(section: &str, retry: &RetryConfig) -> Result<()> {
        if retry.max_attempts == 0 {
            anyhow::bail!("{} max_attempts must be > 0", section);
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            anyhow::bail!(
                "{} initial_backoff_ms ({}) cannot exceed max_backoff_ms ({})",
                section,
                retry.initial_backoff_ms,
                retry.max_backoff_ms
            );
        }
        Ok(())
    }

    /// Get the anchor private key with 0x prefix.
    pub fn anchor_private_key_with_prefix(&self) -> String {
        let key = self.anchor.private_key.trim_start_matches("0x");
        format!("0x{}", key)
    }

    /// Expand environment variables in the format `${VAR_NAME}`.
    ///
    /// Placeholders inside comments (after `#` outside strings) are left alone;
    /// placeholders inside any TOML string form are expanded.
    ///
    /// # Errors
    /// Returns an error if a referenced environment variable is not set, or a
    /// placeholder is empty or unclosed.
    fn expand_env_vars(input: &str) -> Result<String> {
        let mut result = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();
        let mut in_double_quote = false;
        let mut in_single_quote = false;
        let mut in_multiline_double = false;
        let mut in_multiline_single = false;
        let mut in_comment = false;
        let mut escape_next = false;
        let mut pos = 0;

        while let Some(ch) = chars.next() {
            pos += 1;

            if escape_next {
                escape_next = false;
                result.push(ch);
                continue;
            }

            if ch == '\\' && (in_double_quote || in_multiline_double) && !in_comment {
                escape_next = true;
                result.push(ch);
                continue;
            }

            let in_any_string =
                in_double_quote || in_single_quote || in_multiline_double || in_multiline_single;

            match ch {
                '"' | '\'' if !in_comment => {
                    let (other_single, other_multi) = if ch == '"' {
                        (in_single_quote, in_multiline_single)
                    } else {
                        (in_double_quote, in_multiline_double)
                    };
                    result.push(ch);
                    if other_single || other_multi {
                        continue;
                    }

                    if Self::take_triple_quote(&mut chars, ch, &mut result) {
                        pos += 2;
                        if ch == '"' {
                            in_multiline_double = !in_multiline_double;
                        } else {
                            in_multiline_single = !in_multiline_single;
                        }
                    } else if ch == '"' && !in_multiline_double {
                        in_double_quote = !in_double_quote;
                    } else if ch == '\'' && !in_multiline_single {
                        in_single_quote = !in_single_quote;
                    }
                }
                '#' if !in_any_string && !in_comment => {
                    in_comment = true;
                    result.push(ch);
                }
                '\n' => {
                    in_comment = false;
                    result.push(ch);
                }
                '$' if !in_comment && chars.peek() == Some(&'{') => {
                    chars.next();
                    pos += 1;

                    let mut var_name = String::new();
                    let mut found_close = false;
                    for c in chars.by_ref() {
                        pos += 1;
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_name.push(c);
                    }

                    if !found_close {
                        anyhow::bail!(
                            "Unclosed environment variable placeholder at position {}",
                            pos
                        );
                    }
                    if var_name.is_empty() {
                        anyhow::bail!("Empty environment variable name at position {}", pos);
                    }

                    match std::env::var(&var_name) {
                        Ok(value) => result.push_str(&value),
                        Err(_) => anyhow::bail!(
                            "Environment variable '{}' is not set (referenced at position {})",
                            var_name,
                            pos
                        ),
                    }
                }
                _ => result.push(ch),
            }
        }

        Ok(result)
    }

    /// Consume the rest of a triple quote if the next two characters complete one.
    fn take_triple_quote(
        chars: &mut std::iter::Peekable<std::str::Chars>,
        quote_char: char,
        out: &mut String,
    ) -> bool {
        let mut lookahead = chars.clone();
        if lookahead.next() == Some(quote_char) && lookahead.next() == Some(quote_char) {
            chars.next();
            chars.next();
            out.push(quote_char);
            out.push(quote_char);
            return true;
        }
        false
    }
}
