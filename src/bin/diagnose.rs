//! Diagnostic tool - Check configuration and RPC connectivity
//!
//! Run with: cargo run --bin diagnose

use alloy_provider::{Provider, ProviderBuilder};
use eyre::Result;
use std::env;
use std::time::Instant;

use multicall_sync::config::Config;
use multicall_sync::multicall::{Aggregator, RpcAggregator};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    println!("🔍 MULTICALL SYNC DIAGNOSTIC CHECK\n");

    // Load .env
    let config = Config::from_env()?;

    println!("═══════════════════════════════════════════════════");
    println!("                  CONFIGURATION                     ");
    println!("═══════════════════════════════════════════════════\n");

    let defaults = Config::default();
    let checks = [
        ("CHAIN_ID", defaults.chain_id.to_string(), "Chain the scheduler serves"),
        ("MULTICALL_ADDRESS", defaults.multicall_address.clone(), "Multicall contract"),
        ("CALL_CHUNK_SIZE", defaults.call_chunk_size.to_string(), "Calls per aggregate"),
        ("LISTENER_DEBOUNCE_MS", defaults.listener_debounce_ms.to_string(), "Listener debounce window"),
        ("RETRY_LIMIT", "unbounded".to_string(), "Retries per chunk"),
        ("RETRY_MIN_WAIT_MS", defaults.retry_min_wait_ms.to_string(), "Minimum retry wait"),
        ("RETRY_MAX_WAIT_MS", defaults.retry_max_wait_ms.to_string(), "Maximum retry wait"),
        ("BLOCK_POLL_INTERVAL_MS", defaults.block_poll_interval_ms.to_string(), "Block polling interval"),
    ];

    for (key, default, desc) in checks {
        let (value, marker) = match env::var(key) {
            Ok(value) => (value, "(from .env)"),
            Err(_) => (default, "(default)"),
        };
        println!("  {}: {} {}", key, value, marker);
        println!("    └─ {}\n", desc);
    }

    println!("  RPC_URL: {}", config.rpc_url_display());

    println!("\n═══════════════════════════════════════════════════");
    println!("                    VALIDATION                      ");
    println!("═══════════════════════════════════════════════════\n");

    if let Err(e) = config.validate() {
        println!("  ❌ {}", e);
        println!("\n  Fix the configuration and run again.\n");
        return Ok(());
    }
    println!("  ✅ Configuration is valid");

    println!("\n═══════════════════════════════════════════════════");
    println!("                   CONNECTIVITY                     ");
    println!("═══════════════════════════════════════════════════\n");

    let provider = ProviderBuilder::new()
        .connect_http(config.rpc_url.parse()?)
        .erased();

    match provider.get_chain_id().await {
        Ok(chain_id) if chain_id == config.chain_id => {
            println!("  ✅ Chain ID:     {}", chain_id);
        }
        Ok(chain_id) => {
            println!(
                "  ⚠️  Chain ID:     {} (CHAIN_ID is {})",
                chain_id, config.chain_id
            );
        }
        Err(e) => {
            println!("  ❌ RPC unreachable: {}", e);
            return Ok(());
        }
    }

    match provider.get_block_number().await {
        Ok(block) => println!("  ✅ Head block:   {}", block),
        Err(e) => println!("  ❌ eth_blockNumber failed: {}", e),
    }

    // An empty aggregate returns just the block number
    let aggregator = RpcAggregator::new(provider, config.multicall_address()?);
    let start = Instant::now();
    match aggregator.aggregate(Vec::new()).await {
        Ok(result) => println!(
            "  ✅ Multicall:    {} answered at block {} ({:?})",
            aggregator.multicall_address(),
            result.block_number,
            start.elapsed()
        ),
        Err(e) => println!(
            "  ❌ Multicall:    {} did not answer: {}",
            aggregator.multicall_address(),
            e
        ),
    }

    println!("\n✅ Diagnostic complete!\n");
    Ok(())
}
