//! Chain monitors
//!
//! Each monitor polls its chain from a persisted cursor, journals every
//! observed event (chain_events row) and only then advances the cursor,
//! before forwarding the event into the processor's bounded intake
//! channel. A full channel blocks the monitor (back-pressure), it never
//! drops events; events lost from the channel in a crash are replayed
//! from the journal on the next recovery pass.

use alloy::primitives::{B256, U256};
use eyre::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;

pub mod evm;
pub mod solana;

pub use evm::EvmMonitor;
pub use solana::SolanaMonitor;

/// An observation forwarded from a chain monitor to the processor.
/// Serialized verbatim into the chain_events journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainEvent {
    /// An encrypted intent envelope (EV1/legacy line) was emitted.
    Intent {
        chain: String,
        tx_ref: String,
        line: String,
    },
    /// A solver claimed a solver-mediated request on the EVM side.
    ClaimObserved {
        chain: String,
        msg_id: B256,
        solver: String,
        bond: U256,
        claimed_at: i64,
        deadline: i64,
    },
    /// A solver delivery notice was logged on the destination chain.
    DeliveryObserved {
        chain: String,
        msg_id: B256,
        signature: String,
    },
}

/// A journaled event in flight to the processor. The journal row is only
/// marked processed after handling succeeds, so anything still queued
/// here at crash time is re-driven from the journal on restart.
#[derive(Debug, Clone)]
pub struct IntakeEvent {
    pub journal_id: i64,
    pub event: ChainEvent,
}

/// Manages the chain monitors
pub struct MonitorManager {
    evm: EvmMonitor,
    solana: SolanaMonitor,
}

impl MonitorManager {
    pub fn new(config: &Config, db: PgPool, intake: mpsc::Sender<IntakeEvent>) -> Result<Self> {
        let evm = EvmMonitor::new(
            &config.evm,
            config.relayer.poll_interval_ms,
            db.clone(),
            intake.clone(),
        )?;
        let solana = SolanaMonitor::new(
            &config.solana,
            config.relayer.poll_interval_ms,
            db,
            intake,
        )?;

        info!("Monitor manager created");

        Ok(Self { evm, solana })
    }

    /// Run all monitors concurrently
    /// Returns when any monitor fails or shutdown signal received
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();

        let evm = self.evm;
        join_set.spawn(async move { evm.run().await });
        let solana = self.solana;
        join_set.spawn(async move { solana.run().await });

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping monitors");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A monitor exited unexpectedly without error");
                        Err(eyre::eyre!("monitor exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A monitor stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A monitor task panicked: {:?}", e);
                        Err(eyre::eyre!("monitor task panicked: {}", e))
                    }
                    None => {
                        error!("All monitor tasks exited unexpectedly");
                        Err(eyre::eyre!("all monitor tasks exited unexpectedly"))
                    }
                }
            }
        }
    }
}
