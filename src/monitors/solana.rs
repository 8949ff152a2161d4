//! Solana origin-chain monitor
//!
//! Polls the bridge program's transaction history over plain JSON-RPC
//! (getSignaturesForAddress / getTransaction) and scans program log
//! messages for encrypted intent envelopes and SETTLED delivery notices.
//! The cursor is the newest processed signature; getSignaturesForAddress
//! pages back `until` it.

use alloy::primitives::B256;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SolanaConfig;
use crate::db::{get_cursor, insert_chain_event, set_cursor};
use crate::metrics;
use crate::monitors::{ChainEvent, IntakeEvent};

const CHAIN: &str = "solana";

/// Anything actionable found in one program log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMatch {
    /// An encrypted intent envelope (EV1 or legacy EVENT format).
    Envelope(String),
    /// A solver delivery notice: SETTLED:<msgId>:<signature>.
    Settled { msg_id: B256, signature: String },
}

/// Match one Solana program log line against the known formats.
pub fn match_line(raw: &str) -> Option<LogMatch> {
    let line = raw.strip_prefix("Program log: ").unwrap_or(raw).trim();

    if line.starts_with("EV1:") || line.contains("EVENT:") {
        return Some(LogMatch::Envelope(line.to_string()));
    }

    if let Some(rest) = line.strip_prefix("SETTLED:") {
        let (id_seg, signature) = rest.split_once(':')?;
        let id_hex = id_seg.strip_prefix("0x").unwrap_or(id_seg);
        let id_bytes: [u8; 32] = hex::decode(id_hex).ok()?.try_into().ok()?;
        if signature.is_empty() {
            return None;
        }
        return Some(LogMatch::Settled {
            msg_id: B256::from(id_bytes),
            signature: signature.to_string(),
        });
    }

    None
}

/// Solana program log monitor
pub struct SolanaMonitor {
    client: Client,
    rpc_url: String,
    program_id: String,
    poll_interval: Duration,
    db: PgPool,
    intake: mpsc::Sender<IntakeEvent>,
}

impl SolanaMonitor {
    pub fn new(
        config: &SolanaConfig,
        poll_interval_ms: u64,
        db: PgPool,
        intake: mpsc::Sender<IntakeEvent>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build Solana RPC client")?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            program_id: config.program_id.clone(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            db,
            intake,
        })
    }

    /// Run the monitor loop
    pub async fn run(&self) -> Result<()> {
        info!(program_id = %self.program_id, "Solana monitor started");

        loop {
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Solana monitor poll failed");
                metrics::record_error("solana_monitor", "poll");
                tokio::time::sleep(self.poll_interval * 4).await;
                continue;
            }
            metrics::record_successful_poll(CHAIN);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let until = get_cursor(&self.db, CHAIN).await?;

        // newest first; reverse before processing so the cursor only
        // ever moves forward
        let mut signatures = self.fetch_signatures(until.as_deref()).await?;
        if signatures.is_empty() {
            return Ok(());
        }
        signatures.reverse();

        debug!(count = signatures.len(), "Processing Solana transactions");

        for signature in signatures {
            let logs = self.fetch_log_messages(&signature).await?;
            for (line_index, raw) in logs.iter().enumerate() {
                let event = match match_line(raw) {
                    Some(LogMatch::Envelope(line)) => ChainEvent::Intent {
                        chain: CHAIN.to_string(),
                        tx_ref: signature.clone(),
                        line,
                    },
                    Some(LogMatch::Settled { msg_id, signature: delivery_sig }) => {
                        ChainEvent::DeliveryObserved {
                            chain: CHAIN.to_string(),
                            msg_id,
                            signature: delivery_sig,
                        }
                    }
                    None => continue,
                };

                let event_key = format!("{}:{}:{}", CHAIN, signature, line_index);
                let payload = serde_json::to_string(&event)
                    .wrap_err("Failed to serialize chain event")?;
                let Some(journal_id) =
                    insert_chain_event(&self.db, &event_key, CHAIN, &payload).await?
                else {
                    // already journaled on a previous pass; the recovery
                    // scan owns it from here
                    debug!(event_key = %event_key, "Event already journaled, skipping");
                    continue;
                };

                if let ChainEvent::Intent { .. } = event {
                    metrics::record_intent_observed(CHAIN);
                }
                self.intake
                    .send(IntakeEvent { journal_id, event })
                    .await
                    .map_err(|_| eyre!("intake channel closed"))?;
            }
            // every actionable line in this transaction is journaled, so
            // advancing here can never lose one to a crash
            set_cursor(&self.db, CHAIN, &signature).await?;
        }

        Ok(())
    }

    /// getSignaturesForAddress, paging back until the cursor
    async fn fetch_signatures(&self, until: Option<&str>) -> Result<Vec<String>> {
        let mut params_obj = json!({ "limit": 100, "commitment": "finalized" });
        if let Some(until) = until {
            params_obj["until"] = json!(until);
        }

        let result = self
            .rpc_call("getSignaturesForAddress", json!([self.program_id, params_obj]))
            .await?;

        let entries = result
            .as_array()
            .ok_or_else(|| eyre!("getSignaturesForAddress returned non-array"))?;

        let mut signatures = Vec::with_capacity(entries.len());
        for entry in entries {
            // skip failed transactions; their logs never committed state
            if !entry["err"].is_null() {
                continue;
            }
            let sig = entry["signature"]
                .as_str()
                .ok_or_else(|| eyre!("signature entry missing signature field"))?;
            signatures.push(sig.to_string());
        }

        Ok(signatures)
    }

    /// getTransaction, extracting meta.logMessages
    async fn fetch_log_messages(&self, signature: &str) -> Result<Vec<String>> {
        let result = self
            .rpc_call(
                "getTransaction",
                json!([signature, { "encoding": "json", "commitment": "finalized",
                    "maxSupportedTransactionVersion": 0 }]),
            )
            .await?;

        if result.is_null() {
            warn!(signature = %signature, "Transaction not found, skipping");
            return Ok(Vec::new());
        }

        let logs = result["meta"]["logMessages"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(logs)
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: Value = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("Solana RPC {} request failed", method))?
            .json()
            .await
            .wrap_err_with(|| format!("Solana RPC {} returned malformed JSON", method))?;

        if let Some(err) = response.get("error") {
            if !err.is_null() {
                return Err(eyre!("Solana RPC {} error: {}", method, err));
            }
        }

        Ok(response["result"].clone())
    }
}
