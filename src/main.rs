mod api;
mod canonical;
mod claims;
mod codec;
mod config;
mod contracts;
mod db;
mod metrics;
mod monitors;
mod processor;
mod retry;
mod settlement;
mod token_map;
mod types;
mod verification;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use eyre::WrapErr;

use claims::ClaimCoordinator;
use codec::EventCodec;
use config::Config;
use monitors::MonitorManager;
use processor::BridgeProcessor;
use retry::RetryConfig;
use settlement::{EvmSettlement, SettlementSubmitter};
use verification::VerificationGateway;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting Veil Bridge Relayer");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        evm_chain_id = config.evm.chain_id,
        solana_program = %config.solana.program_id,
        token_mappings = config.relayer.token_mappings.len(),
        "Configuration loaded"
    );

    // Connect to database
    let db = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    // Run migrations
    db::run_migrations(&db).await?;
    tracing::info!("Database migrations complete");

    // Event envelope codec over the configured keyring
    let codec = Arc::new(EventCodec::new(config.keyring.keys.clone()));

    // Bounded intake: monitors block when the processor falls behind
    let (intake_tx, intake_rx) =
        tokio::sync::mpsc::channel::<monitors::IntakeEvent>(config.relayer.intake_capacity);

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    // Settlement stack
    let settlement_client = EvmSettlement::new(&config.evm)?;
    let signer: PrivateKeySigner = settlement_client.signer().clone();
    let retry = RetryConfig {
        max_retries: config.relayer.retry_attempts,
        initial_backoff: Duration::from_millis(config.relayer.retry_delay_ms),
        ..RetryConfig::default()
    };
    let submitter = SettlementSubmitter::new(settlement_client, retry);

    let min_bond = U256::from_str_radix(&config.claims.min_bond, 10)
        .wrap_err("Invalid claim minimum bond")?;
    let claims = ClaimCoordinator::new(db.clone(), min_bond);

    let verification = match &config.verification {
        Some(vconfig) => {
            let gateway = VerificationGateway::new(vconfig)?;
            match gateway.health().await {
                Ok(true) => {
                    tracing::info!(gateway = %vconfig.base_url, "Verification gateway reachable")
                }
                Ok(false) => {
                    tracing::warn!(gateway = %vconfig.base_url, "Verification gateway unhealthy")
                }
                Err(e) => {
                    tracing::warn!(gateway = %vconfig.base_url, error = %e, "Verification gateway probe failed")
                }
            }
            Some(gateway)
        }
        None => None,
    };

    let monitor_manager = MonitorManager::new(&config, db.clone(), intake_tx.clone())?;
    let bridge_processor = BridgeProcessor::new(
        &config,
        db.clone(),
        codec.clone(),
        claims,
        submitter,
        signer,
        verification,
    );

    tracing::info!("Pipeline initialized, starting processing");

    // Start metrics/API server
    let api_state = api::AppState {
        db: db.clone(),
        codec,
        intake: intake_tx,
        active_key_version: config.keyring.active_version,
        dev_enabled: config.api.dev_endpoints,
        started: std::time::Instant::now(),
    };
    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;
    tokio::spawn(async move {
        if let Err(e) = api::start_server(&bind_address, port, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Run monitors and processor concurrently
    tokio::select! {
        result = monitor_manager.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Monitor manager error");
            }
        }
        result = bridge_processor.run(intake_rx, shutdown_rx2) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Bridge processor error");
            }
        }
    }

    tracing::info!("Veil Bridge Relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,veil_relayer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
