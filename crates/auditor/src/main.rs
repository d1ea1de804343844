//! OrderProof auditor
//!
//! This binary provides:
//! - Periodic anchoring of the audit tree root on chain
//! - The reconciliation sweep over completed orders
//! - Operator commands: manual anchoring, contract deployment, recovery
//!
//! Note: The HTTP API is provided by the separate `orderproof-api` service

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orderproof_auditor::anchor::AnchorOutcome;
use orderproof_auditor::config::Config;
use orderproof_auditor::ledger::{parse_bytecode, AnchorLedger};
use orderproof_auditor::logging::init_logging;
use orderproof_auditor::orders::OrderLookup;
use orderproof_auditor::services::Services;
use orderproof_auditor::storage::Storage;
use orderproof_auditor::OrderId;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "orderproof-auditor")]
#[command(version, about = "OrderProof audit anchoring service", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "orderproof.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the background tasks (anchor scheduler + reconciliation sweep)
    Run,

    /// Anchor the current audit tree root (manual trigger)
    Anchor,

    /// Deploy the AuditAnchor contract
    Deploy {
        /// Creation bytecode (hex or compiler artifact JSON); defaults to anchor.bytecode_path
        #[arg(long)]
        bytecode: Option<PathBuf>,
    },

    /// Reconcile PENDING anchors against the chain
    Recover,

    /// Record audits for completed orders that lack one
    Sweep,

    /// Verify one order against its audit and anchor
    Verify {
        /// Order id
        order_id: OrderId,
    },

    /// Show anchoring status
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = "sqlite://orderproof.db")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::InitDb { database_url } = &command {
        init_logging(cli.debug, &Default::default())?;
        return init_database(database_url).await;
    }

    let config = Config::from_file(&cli.config).context("Failed to load configuration")?;
    init_logging(cli.debug, &config.logging)?;

    info!("OrderProof auditor starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let services = Services::from_config(config).await?;

    let result = match command {
        Commands::Run => run_auditor(&services).await,
        Commands::Anchor => anchor_manual(&services).await,
        Commands::Deploy { bytecode } => deploy_contract(&services, bytecode).await,
        Commands::Recover => recover(&services).await,
        Commands::Sweep => sweep_once(&services).await,
        Commands::Verify { order_id } => verify_order(&services, order_id).await,
        Commands::Status => show_status(&services).await,
        Commands::InitDb { .. } => unreachable!("handled before configuration is loaded"),
    };

    services.storage.close().await;
    result
}

/// Main service - runs the scheduler and the sweep until Ctrl+C
async fn run_auditor(services: &Services) -> Result<()> {
    let config = &services.config;
    info!("  Chain ID: {}", config.network.chain_id);
    info!("  RPC URL: {}", config.network.rpc_url);
    info!("  Database: {}", config.database.url);

    if let Err(e) = services.ledger.check_chain_id().await {
        warn!("Chain check failed: {}", e);
    }

    let mut tasks = tokio::task::JoinSet::new();

    match services.anchor_scheduler() {
        Some(scheduler) => {
            if config.anchor.auto_anchor {
                info!(
                    "Anchor scheduler started (interval: {}s)",
                    config.anchor.anchor_interval_secs
                );
            } else {
                info!("Auto-anchoring disabled, use the 'anchor' command to anchor manually");
            }
            tasks.spawn(async move { scheduler.run().await });
        }
        None => warn!("No AuditAnchor contract configured, anchoring disabled"),
    }

    match services.reconcile_sweep() {
        Some(sweep) => {
            info!(
                "Reconciliation sweep started (interval: {}s)",
                config.sweep.interval_secs
            );
            tasks.spawn(async move { sweep.run().await });
        }
        None => info!("Reconciliation sweep disabled (sweep.enabled = false or no orders.url)"),
    }

    info!("Auditor is running. Press Ctrl+C to stop.");
    info!("For API queries, run the orderproof-api service separately.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received shutdown signal, gracefully shutting down...");
        }
        Some(result) = tasks.join_next() => {
            if let Err(e) = result {
                error!("Background task panicked: {}", e);
            } else {
                warn!("Background task exited unexpectedly");
            }
        }
    }

    services.shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    Ok(())
}

/// Manually trigger anchoring
async fn anchor_manual(services: &Services) -> Result<()> {
    info!("Manual anchoring triggered");

    match services.coordinator.anchor_current_state().await {
        Ok(AnchorOutcome::NoAuditsToAnchor) => {
            println!("No audits to anchor.");
        }
        Ok(AnchorOutcome::AlreadyAnchored(anchor)) => {
            println!(
                "Root {} already anchored by anchor {} (tx {}).",
                anchor.merkle_root,
                anchor.id,
                anchor
                    .tx_hash
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(AnchorOutcome::InFlight(anchor)) => {
            println!(
                "Anchor {} for root {} is still PENDING in another process.",
                anchor.id, anchor.merkle_root
            );
        }
        Ok(AnchorOutcome::Anchored(anchor)) => {
            println!("Anchored root {} ({} audits)", anchor.merkle_root, anchor.audit_count);
            if let Some(tx_hash) = anchor.tx_hash {
                println!("  TX Hash: {}", tx_hash);
                if let Some(url) = services.coordinator.explorer_tx_url(&tx_hash) {
                    println!("  Explorer: {}", url);
                }
            }
            if let Some(block) = anchor.block_number {
                println!("  Block: {}", block);
            }
        }
        Err(e) => {
            error!("Failed to anchor: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}

/// Deploy the AuditAnchor contract
async fn deploy_contract(services: &Services, bytecode: Option<PathBuf>) -> Result<()> {
    let path = bytecode
        .or_else(|| services.config.anchor.bytecode_path.clone())
        .context("No bytecode given; pass --bytecode or set anchor.bytecode_path")?;

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read bytecode from {}", path.display()))?;
    let bytecode = parse_bytecode(&contents)?;

    let wallet = services.ledger.wallet_info().await?;
    info!("Deploying from {} (balance: {} wei)", wallet.address, wallet.balance_wei);

    let address = services.coordinator.deploy(bytecode).await?;

    println!("AuditAnchor deployed at {}", address);
    println!("Add this to your configuration:");
    println!();
    println!("[contracts]");
    println!("audit_anchor = \"{}\"", address);

    Ok(())
}

/// Reconcile PENDING anchors
async fn recover(services: &Services) -> Result<()> {
    let report = services.coordinator.recover_pending().await?;
    println!(
        "Recovery: {} confirmed, {} superseded, {} failed, {} still pending",
        report.confirmed, report.superseded, report.failed, report.still_pending
    );
    Ok(())
}

/// Run one reconciliation pass
async fn sweep_once(services: &Services) -> Result<()> {
    let sweep = services
        .reconcile_sweep()
        .context("Sweep needs orders.url configured and sweep.enabled = true")?;

    let report = sweep.run_once().await?;
    println!(
        "Sweep: {} processed, {} created, {} existing, {} errors",
        report.processed, report.created, report.existing, report.errors
    );
    Ok(())
}

/// Verify a single order and print the public response
async fn verify_order(services: &Services, order_id: OrderId) -> Result<()> {
    let orders = services
        .orders
        .as_ref()
        .context("Verification needs orders.url configured")?;

    let facts = match orders.lookup(order_id).await? {
        OrderLookup::Completed(facts) => facts,
        OrderLookup::Missing => anyhow::bail!("Order {} not found", order_id),
        OrderLookup::NotCompleted { status } => {
            anyhow::bail!("Order {} is not completed yet (status: {})", order_id, status)
        }
    };

    let response = services.assembler.assemble(order_id, &facts).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Show anchoring status
async fn show_status(services: &Services) -> Result<()> {
    let stats = services.storage.stats().await?;
    let latest = services.storage.get_latest_confirmed_anchor().await?;

    println!("\n=== OrderProof Auditor Status ===\n");
    println!("Chain:");
    println!("  Chain ID: {}", services.config.network.chain_id);
    match services.ledger.contract_address() {
        Some(address) => println!("  AuditAnchor: {}", address),
        None => println!("  AuditAnchor: not deployed"),
    }
    match services.ledger.wallet_info().await {
        Ok(wallet) => {
            println!("  Wallet: {}", wallet.address);
            println!("  Balance: {} wei", wallet.balance_wei);
        }
        Err(e) => println!("  Wallet: unavailable ({})", e),
    }

    println!("\nAnchors:");
    println!("  Pending: {}", stats.pending_anchors);
    println!("  Confirmed: {}", stats.confirmed_anchors);
    println!("  Failed: {}", stats.failed_anchors);
    println!("  Audit store keys: {}", stats.kv_keys);

    if let Some(anchor) = latest {
        println!("\nLatest Confirmed Anchor:");
        println!("  ID: {}", anchor.id);
        println!("  Merkle Root: {}", anchor.merkle_root);
        println!("  Audits: {}", anchor.audit_count);
        if let Some(tx_hash) = anchor.tx_hash {
            println!("  TX Hash: {}", tx_hash);
        }
        if let Some(block) = anchor.block_number {
            println!("  Block: {}", block);
        }
        println!(
            "  Confirmed at: {}",
            anchor
                .confirmed_at
                .and_then(chrono::DateTime::from_timestamp_millis)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        );
    } else {
        println!("\nNo anchors confirmed yet.");
    }

    if services.ledger.contract_address().is_some() {
        match services.ledger.latest_anchor().await {
            Ok(Some(on_chain)) => {
                println!("\nOn-chain Latest Anchor:");
                println!("  Root: {}", on_chain.root);
                println!("  Count: {}", on_chain.count);
                println!("  Timestamp: {}", on_chain.timestamp);
            }
            Ok(None) => println!("\nNothing anchored on chain yet."),
            Err(e) => println!("\nOn-chain state unavailable: {}", e),
        }
    }

    println!();
    Ok(())
}

/// Initialize the database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url, None, None)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    let stats = storage.stats().await?;
    info!("Database initialized successfully!");
    info!("  Pending anchors: {}", stats.pending_anchors);
    info!("  Confirmed anchors: {}", stats.confirmed_anchors);
    info!("  Audit store keys: {}", stats.kv_keys);

    storage.close().await;

    Ok(())
}
