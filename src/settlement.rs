//! Settlement submission to the EVM side
//!
//! `SettlementClient` is the sign-and-send boundary: everything that
//! needs a wallet goes through it, which keeps the processor testable
//! against a mock. `SettlementSubmitter` layers idempotence (finalized
//! read-back), a liquidity precheck, and bounded retries on top.

use std::str::FromStr;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use crate::config::EvmConfig;
use crate::contracts::VeilSettlement;
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};

/// Relayer attestation over a msg_id, in EVM {v, r, s} form.
#[derive(Debug, Clone, Copy)]
pub struct Attestation {
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

/// Sign an attestation over a message identifier.
pub async fn attest(signer: &PrivateKeySigner, msg_id: B256) -> Result<Attestation> {
    let sig = alloy::signers::Signer::sign_hash(signer, &msg_id)
        .await
        .wrap_err("Failed to sign msg_id")?;
    Ok(Attestation {
        v: 27 + sig.v() as u8,
        r: B256::from(sig.r().to_be_bytes()),
        s: B256::from(sig.s().to_be_bytes()),
    })
}

/// Capability boundary for on-chain settlement operations.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn is_finalized(&self, msg_id: B256) -> Result<bool>;
    async fn token_balance(&self, token: Address) -> Result<U256>;
    async fn submit_payout(
        &self,
        msg_id: B256,
        token: Address,
        to: Address,
        amount: U256,
        attestation: Attestation,
    ) -> Result<String>;
    async fn verify_and_settle(
        &self,
        msg_id: B256,
        dest_tx_ref: B256,
        evidence_hash: B256,
        solver: &str,
    ) -> Result<String>;
    async fn slash(&self, msg_id: B256) -> Result<String>;
}

/// alloy-backed settlement client against the VeilSettlement contract.
pub struct EvmSettlement {
    rpc_url: String,
    contract_address: Address,
    signer: PrivateKeySigner,
}

impl EvmSettlement {
    pub fn new(config: &EvmConfig) -> Result<Self> {
        let contract_address = Address::from_str(&config.settlement_address)
            .wrap_err("Invalid settlement address")?;
        let signer: PrivateKeySigner =
            config.private_key.parse().wrap_err("Invalid private key")?;

        info!(
            relayer_address = %signer.address(),
            chain_id = config.chain_id,
            settlement_address = %contract_address,
            "Settlement client initialized"
        );

        Ok(Self {
            rpc_url: config.rpc_url.clone(),
            contract_address,
            signer,
        })
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

#[async_trait]
impl SettlementClient for EvmSettlement {
    async fn is_finalized(&self, msg_id: B256) -> Result<bool> {
        let provider =
            ProviderBuilder::new().on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let contract = VeilSettlement::new(self.contract_address, provider);
        let result = contract.finalized(msg_id).call().await?;
        Ok(result._0)
    }

    async fn token_balance(&self, token: Address) -> Result<U256> {
        let provider =
            ProviderBuilder::new().on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let contract = VeilSettlement::new(self.contract_address, provider);
        let result = contract.bridgeBalance(token).call().await?;
        Ok(result._0)
    }

    async fn submit_payout(
        &self,
        msg_id: B256,
        token: Address,
        to: Address,
        amount: U256,
        attestation: Attestation,
    ) -> Result<String> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let contract = VeilSettlement::new(self.contract_address, provider);

        debug!(
            msg_id = %msg_id,
            token = %token,
            to = %to,
            amount = %amount,
            "Submitting payout"
        );

        let call = contract.payout(
            msg_id,
            token,
            to,
            amount,
            attestation.v,
            attestation.r,
            attestation.s,
        );

        let pending_tx = call
            .send()
            .await
            .map_err(|e| eyre!("Failed to send payout: {}", e))?;
        let tx_hash = *pending_tx.tx_hash();
        info!(tx_hash = %tx_hash, "Payout sent, waiting for confirmation");

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| eyre!("Failed to get receipt: {}", e))?;
        if !receipt.status() {
            return Err(eyre!("Transaction reverted"));
        }

        Ok(format!("0x{:x}", tx_hash))
    }

    async fn verify_and_settle(
        &self,
        msg_id: B256,
        dest_tx_ref: B256,
        evidence_hash: B256,
        solver: &str,
    ) -> Result<String> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let contract = VeilSettlement::new(self.contract_address, provider);

        let call = contract.verifyAndSettle(msg_id, dest_tx_ref, evidence_hash, solver.to_string());
        let pending_tx = call
            .send()
            .await
            .map_err(|e| eyre!("Failed to send verifyAndSettle: {}", e))?;
        let tx_hash = *pending_tx.tx_hash();

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| eyre!("Failed to get receipt: {}", e))?;
        if !receipt.status() {
            return Err(eyre!("Transaction reverted"));
        }

        Ok(format!("0x{:x}", tx_hash))
    }

    async fn slash(&self, msg_id: B256) -> Result<String> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let contract = VeilSettlement::new(self.contract_address, provider);

        let call = contract.slash(msg_id);
        let pending_tx = call
            .send()
            .await
            .map_err(|e| eyre!("Failed to send slash: {}", e))?;
        let tx_hash = *pending_tx.tx_hash();

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| eyre!("Failed to get receipt: {}", e))?;
        if !receipt.status() {
            return Err(eyre!("Transaction reverted"));
        }

        Ok(format!("0x{:x}", tx_hash))
    }
}

/// Outcome of a payout submission.
#[derive(Debug, Clone)]
pub enum PayoutOutcome {
    /// A transaction was sent and confirmed.
    Submitted(String),
    /// The contract already finalized this message; nothing sent.
    AlreadyFinalized,
}

/// Drives payouts with idempotence and retries over a SettlementClient.
pub struct SettlementSubmitter<C: SettlementClient> {
    client: C,
    retry: RetryConfig,
    submit_timeout: Duration,
}

impl<C: SettlementClient> SettlementSubmitter<C> {
    pub fn new(client: C, retry: RetryConfig) -> Self {
        Self {
            client,
            retry,
            submit_timeout: Duration::from_secs(120),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Whether the escrow can cover a payout.
    pub async fn has_liquidity(&self, token: Address, amount: U256) -> Result<bool> {
        let balance = self.client.token_balance(token).await?;
        Ok(balance >= amount)
    }

    /// Submit a payout at most once: the finalized read-back runs before
    /// every attempt, so a retry after an ambiguous failure can never
    /// double-pay.
    pub async fn submit(
        &self,
        msg_id: B256,
        token: Address,
        to: Address,
        amount: U256,
        attestation: Attestation,
    ) -> Result<PayoutOutcome> {
        if self.client.is_finalized(msg_id).await? {
            debug!(msg_id = %msg_id, "Already finalized on-chain, skipping payout");
            return Ok(PayoutOutcome::AlreadyFinalized);
        }

        let outcome = with_retry(&self.retry, |attempt| async move {
            if attempt > 0 && self.client.is_finalized(msg_id).await? {
                return Ok(PayoutOutcome::AlreadyFinalized);
            }
            let tx_hash = tokio::time::timeout(
                self.submit_timeout,
                self.client.submit_payout(msg_id, token, to, amount, attestation),
            )
            .await
            .map_err(|_| eyre!("payout submission timeout"))??;
            Ok(PayoutOutcome::Submitted(tx_hash))
        })
        .await?;

        metrics::record_payout_submitted();
        Ok(outcome)
    }

    /// Finalize a solver delivery with evidence.
    pub async fn settle(
        &self,
        msg_id: B256,
        dest_tx_ref: B256,
        evidence_hash: B256,
        solver: &str,
    ) -> Result<Option<String>> {
        if self.client.is_finalized(msg_id).await? {
            debug!(msg_id = %msg_id, "Already finalized on-chain, skipping settle");
            return Ok(None);
        }

        let tx_hash = with_retry(&self.retry, |_attempt| async move {
            self.client
                .verify_and_settle(msg_id, dest_tx_ref, evidence_hash, solver)
                .await
        })
        .await?;

        metrics::record_settlement_submitted();
        Ok(Some(tx_hash))
    }

    /// Slash an expired claim's bond.
    pub async fn slash(&self, msg_id: B256) -> Result<String> {
        let tx_hash = with_retry(&self.retry, |_attempt| async move {
            self.client.slash(msg_id).await
        })
        .await?;

        warn!(msg_id = %msg_id, tx_hash = %tx_hash, "Slashed expired claim");
        metrics::record_slash();
        Ok(tx_hash)
    }
}
