//! CLI surface and its env-var equivalents (`SOLCONNECT_RELAY_*`), layered
//! the way clap's `env` feature does it: flag wins, then env var, then
//! default.

use clap::Parser;

use crate::queue::{DEFAULT_GLOBAL_CAP, DEFAULT_PER_WALLET_CAP};

#[derive(Debug, Clone, Parser)]
#[command(name = "solconnect-relay", version, about = "SolConnect relay routing engine")]
pub struct RelayConfig {
    /// Address to accept client connections on.
    #[arg(long, env = "SOLCONNECT_RELAY_LISTEN")]
    pub listen: String,

    /// TLS certificate (PEM). Required together with `--key` to enable TLS.
    #[arg(long, env = "SOLCONNECT_RELAY_CERT")]
    pub cert: Option<String>,

    /// TLS private key (PEM). Required together with `--cert` to enable TLS.
    #[arg(long, env = "SOLCONNECT_RELAY_KEY")]
    pub key: Option<String>,

    /// Maximum queued messages per recipient wallet before eviction.
    #[arg(long, env = "SOLCONNECT_RELAY_MAX_QUEUE_PER_WALLET", default_value_t = DEFAULT_PER_WALLET_CAP)]
    pub max_queue_per_wallet: usize,

    /// Maximum total queued messages across all recipients.
    #[arg(long, env = "SOLCONNECT_RELAY_MAX_QUEUE_GLOBAL", default_value_t = DEFAULT_GLOBAL_CAP)]
    pub max_queue_global: usize,

    /// Address to serve a JSON metrics snapshot on. Disabled if unset.
    #[arg(long, env = "SOLCONNECT_RELAY_METRICS_LISTEN")]
    pub metrics_listen: Option<String>,
}

impl RelayConfig {
    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    /// Returns a config error description if cert/key are mismatched
    /// (one set without the other).
    pub fn validate(&self) -> Result<(), String> {
        if self.cert.is_some() != self.key.is_some() {
            return Err("--cert and --key must be set together".to_string());
        }
        Ok(())
    }
}
