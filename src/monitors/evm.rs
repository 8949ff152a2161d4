//! EVM settlement-chain monitor
//!
//! Polls the settlement contract for BridgeInitiated and BridgeClaimed
//! events behind a finality offset, forwarding them into the intake
//! channel. The cursor (last processed block) is persisted so restarts
//! resume without gaps; duplicate replay is absorbed downstream by the
//! msg_id insert gate.

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::{Client, Http};
use eyre::{eyre, Result, WrapErr};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::EvmConfig;
use crate::db::{get_cursor, insert_chain_event, set_cursor};
use crate::metrics;
use crate::monitors::{ChainEvent, IntakeEvent};

const CHAIN: &str = "evm";

/// EVM event monitor for the settlement contract
pub struct EvmMonitor {
    provider: RootProvider<Http<Client>>,
    settlement_address: Address,
    finality_blocks: u64,
    poll_interval: Duration,
    db: PgPool,
    intake: mpsc::Sender<IntakeEvent>,
}

impl EvmMonitor {
    pub fn new(
        config: &EvmConfig,
        poll_interval_ms: u64,
        db: PgPool,
        intake: mpsc::Sender<IntakeEvent>,
    ) -> Result<Self> {
        let url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);

        let settlement_address = Address::from_str(&config.settlement_address)
            .wrap_err("Invalid settlement address")?;

        Ok(Self {
            provider,
            settlement_address,
            finality_blocks: config.finality_blocks,
            poll_interval: Duration::from_millis(poll_interval_ms),
            db,
            intake,
        })
    }

    /// Run the monitor loop
    pub async fn run(&self) -> Result<()> {
        info!(
            settlement_address = %self.settlement_address,
            finality_blocks = self.finality_blocks,
            "EVM monitor started"
        );

        loop {
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "EVM monitor poll failed");
                metrics::record_error("evm_monitor", "poll");
                // back off a little harder than the normal poll cadence
                tokio::time::sleep(self.poll_interval * 4).await;
                continue;
            }
            metrics::record_successful_poll(CHAIN);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let last_block: u64 = match get_cursor(&self.db, CHAIN).await? {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| eyre!("corrupt EVM cursor: {}", cursor))?,
            None => 0,
        };

        let current_block = self.finalized_block().await?;
        if current_block <= last_block {
            return Ok(());
        }

        let from_block = last_block + 1;
        let to_block = current_block;
        debug!(from_block, to_block, "Processing EVM blocks");

        // the whole range is journaled before the cursor moves, so a
        // crash between the two re-journals (and dedups) at worst
        self.process_block_range(from_block, to_block).await?;
        set_cursor(&self.db, CHAIN, &to_block.to_string()).await?;

        Ok(())
    }

    async fn process_block_range(&self, from_block: u64, to_block: u64) -> Result<()> {
        let filter = Filter::new()
            .address(self.settlement_address)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("Failed to get logs")?;

        let initiated_sig = Self::bridge_initiated_signature();
        let claimed_sig = Self::bridge_claimed_signature();

        for log in logs {
            let topics = log.topics();
            if topics.is_empty() {
                continue;
            }

            let event = if topics[0] == initiated_sig {
                self.parse_initiated_log(&log)
            } else if topics[0] == claimed_sig {
                self.parse_claimed_log(&log)
            } else {
                continue;
            };

            match event {
                Ok(event) => {
                    let tx_hash = log
                        .transaction_hash
                        .ok_or_else(|| eyre!("Missing transaction hash"))?;
                    let event_key = format!(
                        "{}:0x{:x}:{}",
                        CHAIN,
                        tx_hash,
                        log.log_index.unwrap_or_default()
                    );
                    let payload = serde_json::to_string(&event)
                        .wrap_err("Failed to serialize chain event")?;
                    let Some(journal_id) =
                        insert_chain_event(&self.db, &event_key, CHAIN, &payload).await?
                    else {
                        debug!(event_key = %event_key, "Event already journaled, skipping");
                        continue;
                    };

                    if let ChainEvent::Intent { .. } = event {
                        metrics::record_intent_observed(CHAIN);
                    }
                    // blocks when the processor is behind; no drops
                    self.intake
                        .send(IntakeEvent { journal_id, event })
                        .await
                        .map_err(|_| eyre!("intake channel closed"))?;
                }
                Err(e) => {
                    warn!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Failed to parse settlement log"
                    );
                    metrics::record_error("evm_monitor", "parse");
                }
            }
        }

        Ok(())
    }

    /// Parse a BridgeInitiated log.
    ///
    /// Indexed topics: msgId (bytes32), sender (address).
    /// Non-indexed data: token (address), amountAfterFee (uint256),
    /// envelope (bytes, dynamic: offset word, length word, payload).
    fn parse_initiated_log(&self, log: &Log) -> Result<ChainEvent> {
        let topics = log.topics();
        if topics.len() < 3 {
            return Err(eyre!("BridgeInitiated log missing topics"));
        }

        let data = log.data().data.as_ref();
        if data.len() < 96 {
            return Err(eyre!("BridgeInitiated data too short: {}", data.len()));
        }

        let offset: usize = U256::from_be_slice(&data[64..96])
            .try_into()
            .map_err(|_| eyre!("envelope offset overflow"))?;
        if data.len() < offset + 32 {
            return Err(eyre!("envelope offset out of range"));
        }
        let len: usize = U256::from_be_slice(&data[offset..offset + 32])
            .try_into()
            .map_err(|_| eyre!("envelope length overflow"))?;
        let start = offset + 32;
        if data.len() < start + len {
            return Err(eyre!("envelope payload out of range"));
        }

        let line = String::from_utf8(data[start..start + len].to_vec())
            .wrap_err("envelope is not valid UTF-8")?;

        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| eyre!("Missing transaction hash"))?;

        Ok(ChainEvent::Intent {
            chain: CHAIN.to_string(),
            tx_ref: format!("0x{:x}", tx_hash),
            line,
        })
    }

    /// Parse a BridgeClaimed log.
    ///
    /// Indexed topics: msgId (bytes32), solver (address).
    /// Non-indexed data: bond (uint256), claimedAt (uint64), deadline (uint64).
    fn parse_claimed_log(&self, log: &Log) -> Result<ChainEvent> {
        let topics = log.topics();
        if topics.len() < 3 {
            return Err(eyre!("BridgeClaimed log missing topics"));
        }

        let msg_id = topics[1];
        let solver = Address::from_slice(&topics[2].as_slice()[12..]);

        let data = log.data().data.as_ref();
        if data.len() < 96 {
            return Err(eyre!("BridgeClaimed data too short: {}", data.len()));
        }

        let bond = U256::from_be_slice(&data[0..32]);
        let claimed_at: i64 = U256::from_be_slice(&data[32..64])
            .try_into()
            .map_err(|_| eyre!("claimedAt overflow"))?;
        let deadline: i64 = U256::from_be_slice(&data[64..96])
            .try_into()
            .map_err(|_| eyre!("deadline overflow"))?;

        Ok(ChainEvent::ClaimObserved {
            chain: CHAIN.to_string(),
            msg_id,
            solver: format!("{:?}", solver),
            bond,
            claimed_at,
            deadline,
        })
    }

    /// Get the current finalized block number
    async fn finalized_block(&self) -> Result<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")?;

        Ok(block.saturating_sub(self.finality_blocks))
    }

    fn bridge_initiated_signature() -> B256 {
        // keccak256("BridgeInitiated(bytes32,address,address,uint256,bytes)")
        alloy::primitives::keccak256(b"BridgeInitiated(bytes32,address,address,uint256,bytes)")
    }

    fn bridge_claimed_signature() -> B256 {
        // keccak256("BridgeClaimed(bytes32,address,uint256,uint64,uint64)")
        alloy::primitives::keccak256(b"BridgeClaimed(bytes32,address,uint256,uint64,uint64)")
    }
}
