//! Bridge Client Launcher
//!
//! Maintenance services for the swap bridge:
//! 1. Header Synchronizer - keeps the on-chain relay at Bitcoin's tip
//! 2. Account Sweeper - reclaims rent from settled fork and data accounts
//!
//! Swap construction, claims, and refunds are library concerns driven by
//! the integrating application; this binary only runs the upkeep that has
//! to happen regardless of swap traffic.
//!
//! Run modes:
//!   cargo run -- sync            - Run the header synchronizer loop
//!   cargo run -- sweep           - Sweep closable accounts once
//!   cargo run -- status          - Print relay and ledger status

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;
use tokio_util::sync::CancellationToken;

use btcbridge::bitcoin::{BitcoinRpc, EsploraRpc};
use btcbridge::chain::{send_chained, ChainRpc, FeeRate, SolanaRpc};
use btcbridge::config::BridgeConfig;
use btcbridge::escrow::EscrowProtocol;
use btcbridge::logging;
use btcbridge::relay::{RelayClient, RelaySynchronizer, SyncError, MAX_SYNC_HEADERS};
use btcbridge::store::{CleanupStore, SqliteCleanupStore};
use btcbridge::{BridgeError, Result};

/// Per-transaction confirmation budget for chained submissions
const CONFIRM_WAIT: Duration = Duration::from_secs(90);

/// Cursor scope for the relay fork sweep
const FORK_SWEEP_SCOPE: &str = "relay_forks";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || matches!(args[1].as_str(), "help" | "--help" | "-h") {
        print_usage();
        return;
    }

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("Warning: logging init failed: {}", e);
    }

    let result = match args[1].as_str() {
        "sync" => run_sync(&config, &args[2..]).await,
        "sweep" => run_sweep(&config).await,
        "status" => run_status(&config).await,
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("btcbridge - Swap Bridge Maintenance Services");
    println!();
    println!("Usage:");
    println!("  btcbridge sync [--interval <secs>] [--once]   Run the header relay synchronizer");
    println!("  btcbridge sweep                               Reclaim rent from settled accounts");
    println!("  btcbridge status                              Print relay and ledger status");
    println!();
    println!("Environment Variables:");
    println!("  BRIDGE_NETWORK           mainnet, testnet, or devnet (default: devnet)");
    println!("  BRIDGE_SOLANA_RPC        Solana RPC endpoint");
    println!("  BRIDGE_BITCOIN_RPC       Esplora API endpoint");
    println!("  BRIDGE_RELAY_PROGRAM_ID  BTC header relay program");
    println!("  BRIDGE_SWAP_PROGRAM_ID   Swap escrow program");
    println!("  BRIDGE_SIGNER_KEY        JSON byte-array keypair (or BRIDGE_SIGNER_KEY_FILE)");
    println!("  BRIDGE_DB_PATH           SQLite path for the cleanup ledger");
    println!("  BRIDGE_PRIORITY_FEE      Compute unit price in micro-lamports");
    println!();
    println!("Swap construction, claims, and refunds are driven through the library API.");
}

fn parse_program_id(value: &str, what: &str) -> Result<Pubkey> {
    Pubkey::from_str(value)
        .map_err(|e| BridgeError::Validation(format!("{} program id {:?}: {}", what, value, e)))
}

/// Cancel on Ctrl+C so loops wind down between passes
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("Shutting down...");
            cancel.cancel();
        }
    });
}

async fn run_sync(config: &BridgeConfig, args: &[String]) -> Result<()> {
    let mut interval_secs: u64 = 60;
    let mut once = false;

    // Parse arguments
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--interval" if i + 1 < args.len() => {
                interval_secs = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--once" => {
                once = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    let signer = config.load_signer()?;
    let rpc: Arc<dyn ChainRpc> = Arc::new(SolanaRpc::new(config.solana_rpc.clone()));
    let bitcoin_rpc: Arc<dyn BitcoinRpc> = Arc::new(EsploraRpc::new(&config.bitcoin_api));
    let relay_program = parse_program_id(&config.relay_program_id, "relay")?;
    let relay = Arc::new(RelayClient::new(
        Arc::clone(&rpc),
        relay_program,
        signer.pubkey(),
    ));
    let synchronizer = RelaySynchronizer::new(relay, bitcoin_rpc);
    let fee_rate = FeeRate::new(config.priority_fee, 0);

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    println!("=== Header Relay Synchronizer ===");
    println!();
    println!("Submitter: {}", signer.pubkey());
    println!("Interval: {} seconds", interval_secs);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    loop {
        match synchronizer
            .plan_to_tip(&fee_rate, Some(&cancel), MAX_SYNC_HEADERS)
            .await
        {
            Ok(Some(plan)) => {
                println!(
                    "Submitting headers {}..={} ({} transactions)",
                    plan.start_height,
                    plan.target_height,
                    plan.submission.txs.len()
                );
                match send_chained(rpc.as_ref(), &signer, plan.submission.txs, CONFIRM_WAIT).await
                {
                    Ok(signatures) => println!(
                        "Relay advanced to {} ({} confirmed)",
                        plan.target_height,
                        signatures.len()
                    ),
                    Err(e) if e.is_retryable() => {
                        eprintln!("Submission interrupted, will retry: {}", e)
                    }
                    Err(e) => return Err(e.into()),
                }
                // A capped pass can leave the relay short of the tip; go
                // again immediately before settling into the interval.
                if !once && !cancel.is_cancelled() {
                    continue;
                }
            }
            Ok(None) => println!("Relay is up to date"),
            Err(_) if cancel.is_cancelled() => break,
            Err(e) if e.is_retryable() => eprintln!("Sync pass failed, will retry: {}", e),
            Err(e) => return Err(e.into()),
        }

        if once || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
        }
    }

    Ok(())
}

async fn run_sweep(config: &BridgeConfig) -> Result<()> {
    let signer = config.load_signer()?;
    let rpc: Arc<dyn ChainRpc> = Arc::new(SolanaRpc::new(config.solana_rpc.clone()));
    let relay_program = parse_program_id(&config.relay_program_id, "relay")?;
    let swap_program = parse_program_id(&config.swap_program_id, "swap escrow")?;
    let relay = Arc::new(RelayClient::new(
        Arc::clone(&rpc),
        relay_program,
        signer.pubkey(),
    ));
    let store: Arc<dyn CleanupStore> = Arc::new(SqliteCleanupStore::new(&config.db_path)?);
    let protocol = EscrowProtocol::new(
        Arc::clone(&rpc),
        swap_program,
        Arc::clone(&relay),
        Arc::clone(&store),
    );
    let fee_rate = FeeRate::new(config.priority_fee, 0);

    println!("=== Account Sweeper ===");
    println!();

    // Fork state accounts left behind by relay reorg handling.
    let cursor = store.sweep_cursor(FORK_SWEEP_SCOPE).await?;
    let fork_sweep = relay.sweep_fork_data(cursor, &fee_rate).await?;
    if fork_sweep.txs.is_empty() {
        println!("No closable fork accounts");
    } else {
        send_chained(rpc.as_ref(), &signer, fork_sweep.txs, CONFIRM_WAIT).await?;
        println!("Closed {} fork accounts", fork_sweep.closed_fork_ids.len());
    }
    store
        .set_sweep_cursor(FORK_SWEEP_SCOPE, fork_sweep.highest_checked)
        .await?;

    // Scratch data accounts recorded by tx-data claims.
    let data_sweep = protocol
        .sweep_data_accounts(&signer.pubkey(), &fee_rate)
        .await?;
    if data_sweep.txs.is_empty() {
        println!("No closable data accounts");
    } else {
        send_chained(rpc.as_ref(), &signer, data_sweep.txs, CONFIRM_WAIT).await?;
        let settled = protocol.confirm_data_sweep(&data_sweep.closing).await?;
        println!("Closed {} data accounts", settled);
    }
    if data_sweep.reconciled > 0 {
        println!(
            "Reconciled {} records already closed on chain",
            data_sweep.reconciled
        );
    }

    Ok(())
}

async fn run_status(config: &BridgeConfig) -> Result<()> {
    config.print_summary();
    println!();

    // Status is read-only; a signer is only borrowed for its address.
    let submitter = config
        .load_signer()
        .map(|k| k.pubkey())
        .unwrap_or_default();
    let rpc: Arc<dyn ChainRpc> = Arc::new(SolanaRpc::new(config.solana_rpc.clone()));
    let bitcoin_rpc: Arc<dyn BitcoinRpc> = Arc::new(EsploraRpc::new(&config.bitcoin_api));
    let relay_program = parse_program_id(&config.relay_program_id, "relay")?;
    let relay = Arc::new(RelayClient::new(Arc::clone(&rpc), relay_program, submitter));
    let synchronizer = RelaySynchronizer::new(relay, bitcoin_rpc);

    match synchronizer.status().await {
        Ok(status) => {
            println!("Relay height:   {}", status.relay_height);
            println!("Bitcoin height: {}", status.bitcoin_height);
            println!("Blocks behind:  {}", status.blocks_behind);
        }
        Err(SyncError::RelayUninitialized) => println!("Relay is not initialized"),
        Err(e) => return Err(e.into()),
    }

    let store = SqliteCleanupStore::new(&config.db_path)?;
    let open = store.open_data_accounts().await?;
    println!("Open data accounts: {}", open.len());

    Ok(())
}
