//! Runtime configuration for multicall-sync
//!
//! Loaded from environment variables (and a `.env` file) or from a TOML
//! file. Every value has a default so an empty environment still yields a
//! usable mainnet setup.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MulticallError, Result};
use crate::multicall::aggregate::MULTICALL3;
use crate::multicall::scheduler::{SchedulerConfig, CALL_CHUNK_SIZE};
use crate::retry::RetryOptions;

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // ========== Network Settings ==========
    /// JSON-RPC endpoint
    pub rpc_url: String,

    /// Chain ID (1 = Ethereum Mainnet)
    pub chain_id: u64,

    /// Deployed Multicall contract
    pub multicall_address: String,

    // ========== Scheduler Settings ==========
    /// Maximum calls per aggregate
    pub call_chunk_size: usize,

    /// Listener churn is coalesced for this long before refetching
    pub listener_debounce_ms: u64,

    // ========== Retry Settings ==========
    /// Retries per chunk (None = retry until cancelled)
    pub retry_limit: Option<u32>,

    pub retry_min_wait_ms: u64,

    pub retry_max_wait_ms: u64,

    // ========== Block Source ==========
    /// How often `eth_blockNumber` is polled
    pub block_poll_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            // Network
            rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url),
            chain_id: env_parse("CHAIN_ID", defaults.chain_id),
            multicall_address: env::var("MULTICALL_ADDRESS").unwrap_or(defaults.multicall_address),

            // Scheduler
            call_chunk_size: env_parse("CALL_CHUNK_SIZE", defaults.call_chunk_size),
            listener_debounce_ms: env_parse("LISTENER_DEBOUNCE_MS", defaults.listener_debounce_ms),

            // Retry
            retry_limit: env::var("RETRY_LIMIT").ok().and_then(|s| s.parse().ok()),
            retry_min_wait_ms: env_parse("RETRY_MIN_WAIT_MS", defaults.retry_min_wait_ms),
            retry_max_wait_ms: env_parse("RETRY_MAX_WAIT_MS", defaults.retry_max_wait_ms),

            // Block source
            block_poll_interval_ms: env_parse(
                "BLOCK_POLL_INTERVAL_MS",
                defaults.block_poll_interval_ms,
            ),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| MulticallError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MulticallError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| MulticallError::Config(e.to_string()))?;
        fs::write(path, content).map_err(|e| MulticallError::Config(e.to_string()))?;
        Ok(())
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.trim().is_empty() || self.rpc_url.contains("YOUR_API_KEY") {
            return Err(MulticallError::Config(
                "Invalid RPC_URL - please set a JSON-RPC endpoint".to_string(),
            ));
        }

        self.multicall_address()?;

        if self.call_chunk_size == 0 {
            return Err(MulticallError::Config(
                "CALL_CHUNK_SIZE must be at least 1".to_string(),
            ));
        }

        if self.retry_min_wait_ms > self.retry_max_wait_ms {
            return Err(MulticallError::Config(format!(
                "RETRY_MIN_WAIT_MS ({}) exceeds RETRY_MAX_WAIT_MS ({})",
                self.retry_min_wait_ms, self.retry_max_wait_ms
            )));
        }

        if self.block_poll_interval_ms == 0 {
            return Err(MulticallError::Config(
                "BLOCK_POLL_INTERVAL_MS must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn multicall_address(&self) -> Result<Address> {
        Address::from_str(&self.multicall_address).map_err(|e| {
            MulticallError::Config(format!(
                "Invalid MULTICALL_ADDRESS {}: {}",
                self.multicall_address, e
            ))
        })
    }

    /// RPC URL shortened for display
    pub fn rpc_url_display(&self) -> String {
        if self.rpc_url.chars().count() > 50 {
            truncate_middle(&self.rpc_url, 30, 15, "...")
        } else {
            self.rpc_url.clone()
        }
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            n: self.retry_limit,
            min_wait: Duration::from_millis(self.retry_min_wait_ms),
            max_wait: Duration::from_millis(self.retry_max_wait_ms),
        }
    }

    /// Scheduler settings derived from this config
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            call_chunk_size: self.call_chunk_size,
            listener_debounce: Duration::from_millis(self.listener_debounce_ms),
            retry: self.retry_options(),
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let retries = match self.retry_limit {
            Some(n) => n.to_string(),
            None => "unbounded".to_string(),
        };

        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║              MULTICALL SYNC - CONFIGURATION                ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ Chain ID:          {:^40} ║", self.chain_id);
        println!("║ RPC:               {:^40} ║", redact(&self.rpc_url));
        println!("║ Multicall:         {:^40} ║", short(&self.multicall_address));
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ SCHEDULER                                                  ║");
        println!("║ • Chunk Size:      {:^40} ║", self.call_chunk_size);
        println!("║ • Debounce:        {:>37} ms ║", self.listener_debounce_ms);
        println!("║ • Block Poll:      {:>37} ms ║", self.block_poll_interval_ms);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ RETRY                                                      ║");
        println!("║ • Retries:         {:^40} ║", retries);
        println!(
            "║ • Wait:            {:>37} ms ║",
            format!("{}-{}", self.retry_min_wait_ms, self.retry_max_wait_ms)
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryOptions::default();
        Self {
            rpc_url: "https://eth.llamarpc.com".to_string(),
            chain_id: 1,
            multicall_address: MULTICALL3.to_checksum(None),
            call_chunk_size: CALL_CHUNK_SIZE,
            listener_debounce_ms: 100,
            retry_limit: retry.n,
            retry_min_wait_ms: retry.min_wait.as_millis() as u64,
            retry_max_wait_ms: retry.max_wait.as_millis() as u64,
            block_poll_interval_ms: 4000,
        }
    }
}

/// Parse an env var, falling back to `default` when unset or malformed
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Hide API keys embedded in the URL path
fn redact(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => {
            let host_start = scheme_end + 3;
            let host_end = url[host_start..]
                .find('/')
                .map_or(url.len(), |i| host_start + i);
            if host_end < url.len() {
                format!("{}/…", &url[..host_end])
            } else {
                url.to_string()
            }
        }
        None => url.to_string(),
    }
}

fn short(address: &str) -> String {
    truncate_middle(address, 8, 6, "…")
}

/// Keep the first `head` and last `tail` characters of `s`. Counts chars,
/// not bytes, so multi-byte input never splits a character.
pub fn truncate_middle(s: &str, head: usize, tail: usize, sep: &str) -> String {
    let len = s.chars().count();
    if len <= head + tail {
        return s.to_string();
    }
    let start: String = s.chars().take(head).collect();
    let end: String = s.chars().skip(len - tail).collect();
    format!("{}{}{}", start, sep, end)
}

// ============================================
// TESTS
// ============================================
