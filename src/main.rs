//! multicall-sync - watch contract reads block by block
//!
//! Run with: cargo run -- --watch 0x6B175474E89094c44DA98b954EEDcdECb5be3830

use alloy_primitives::{address, Address};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_sol_types::sol;
use clap::Parser;
use color_eyre::eyre::Result;
use console::style;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multicall_sync::block::BlockWatcher;
use multicall_sync::config::Config;
use multicall_sync::multicall::{
    Call, CallState, RpcAggregator, Scheduler, DEFAULT_BLOCKS_PER_FETCH,
};

sol! {
    interface IERC20 {
        function totalSupply() external view returns (uint256);
    }
}

const DEFAULT_TOKENS: [(Address, &str); 3] = [
    (address!("6B175474E89094c44DA98b954EEDcdECb5be3830"), "DAI"),
    (address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"), "USDC"),
    (address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"), "WETH"),
];

#[derive(Parser, Debug)]
#[command(name = "multicall-sync", version, about = "Batch contract reads over Multicall, refreshed every block")]
struct Cli {
    /// Load settings from a TOML file instead of the environment
    #[arg(long)]
    config: Option<PathBuf>,

    /// ERC-20 token whose totalSupply() is watched (repeatable)
    #[arg(long = "watch", value_name = "ADDRESS")]
    watch: Vec<Address>,

    /// Refetch each read at most every N blocks
    #[arg(long, default_value_t = DEFAULT_BLOCKS_PER_FETCH)]
    blocks_per_fetch: u64,
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style(" 📡 MULTICALL SYNC - Block-aware contract reads").cyan().bold()
    );
    println!(
        "{}",
        style("    Batched | Deduplicated | Retried").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn label(token: &Address, symbols: &HashMap<Address, &str>) -> String {
    match symbols.get(token) {
        Some(symbol) => symbol.to_string(),
        None => format!("0x{}...", &format!("{:x}", token)[..6]),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multicall_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    print_banner();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file");
        return Err(e.into());
    }

    config.print_summary();
    println!();

    // Provider
    let provider = ProviderBuilder::new()
        .connect_http(config.rpc_url.parse()?)
        .erased();

    match provider.get_chain_id().await {
        Ok(chain_id) if chain_id != config.chain_id => {
            warn!(
                expected = config.chain_id,
                actual = chain_id,
                "RPC endpoint serves a different chain"
            );
        }
        Ok(_) => {}
        Err(e) => warn!("Could not query chain id: {}", e),
    }

    // Scheduler
    let aggregator = Arc::new(RpcAggregator::new(
        provider.clone(),
        config.multicall_address()?,
    ));
    let (scheduler, handle) = Scheduler::new(aggregator, config.scheduler());
    let scheduler_task = tokio::spawn(scheduler.run());

    let watcher = BlockWatcher::new(provider, config.chain_id, config.block_poll_interval());
    let watcher_task = tokio::spawn(watcher.run(handle.clone()));

    // Listeners
    let symbols: HashMap<Address, &str> = DEFAULT_TOKENS.into_iter().collect();
    let tokens: Vec<Address> = if cli.watch.is_empty() {
        DEFAULT_TOKENS.iter().map(|(token, _)| *token).collect()
    } else {
        cli.watch.clone()
    };
    let calls: Vec<(Address, Call)> = tokens
        .iter()
        .map(|&token| (token, Call::from_sol(token, &IERC20::totalSupplyCall {})))
        .collect();

    let guard = handle.subscribe(
        config.chain_id,
        calls.iter().map(|(_, call)| call.clone()).collect(),
        cli.blocks_per_fetch,
    )?;

    println!(
        "{} Watching totalSupply() of {} token(s), every {} block(s)",
        style("✓").green(),
        tokens.len(),
        cli.blocks_per_fetch
    );
    println!();

    // Print each read whenever its block moves
    let mut results = handle.results();
    let mut printed: HashMap<Address, (u64, bool)> = HashMap::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                info!("Shutting down");
                break;
            }
            changed = results.changed() => {
                if changed.is_err() {
                    warn!("Scheduler stopped unexpectedly");
                    break;
                }

                let latest = handle.latest_block_number();
                let states: Vec<(Address, CallState)> = {
                    let store = results.borrow_and_update();
                    calls
                        .iter()
                        .map(|(token, call)| {
                            let state = CallState::from_result(
                                store.get(config.chain_id, &call.key()),
                                latest,
                            );
                            (*token, state)
                        })
                        .collect()
                };

                for (token, state) in states {
                    let Some(block_number) = state.block_number else {
                        continue;
                    };
                    if printed.get(&token) == Some(&(block_number, state.error)) {
                        continue;
                    }
                    printed.insert(token, (block_number, state.error));

                    let decoded = state.decode::<IERC20::totalSupplyCall>();
                    match decoded.result {
                        Some(supply) if !decoded.error => println!(
                            "{} #{:<10} {:<10} totalSupply = {}",
                            style("●").green(),
                            block_number,
                            label(&token, &symbols),
                            supply
                        ),
                        _ => println!(
                            "{} #{:<10} {:<10} {}",
                            style("●").red(),
                            block_number,
                            label(&token, &symbols),
                            style("call failed").red()
                        ),
                    }
                }
            }
        }
    }

    drop(guard);
    handle.shutdown().ok();
    scheduler_task.await?;
    watcher_task.await?;

    println!("{}", style("✓ Stopped").green());
    Ok(())
}
