//! Bridge request processor
//!
//! Single consumer of the monitors' intake channel and sole writer of
//! `bridge_requests.status`. Every request walks
//! detected → [claimed →] decrypted → transferred → verified, or drops
//! into failed. Transitions are status-conditioned UPDATEs, so a replayed
//! event can never move a row twice.
//!
//! A recovery pass runs at startup and on the reaper interval: it replays
//! journaled events whose handling never completed and re-drives rows
//! stalled in a non-terminal status, failing them once their re-drive
//! budget is spent.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::canonical::{msg_id_hex, BridgeMessage};
use crate::claims::{ClaimCoordinator, ClaimError};
use crate::codec::EventCodec;
use crate::config::Config;
use crate::db::{self, BridgeRequest, NewBridgeRequest};
use crate::metrics;
use crate::monitors::{ChainEvent, IntakeEvent};
use crate::settlement::{attest, PayoutOutcome, SettlementClient, SettlementSubmitter};
use crate::token_map::{convert, ConvertDirection, TokenMapResolver};
use crate::types::Status;
use crate::verification::{VerificationGateway, VerifyBridgeRequest};

/// Drives bridge requests through the pipeline.
pub struct BridgeProcessor<C: SettlementClient> {
    db: PgPool,
    codec: Arc<EventCodec>,
    tokens: TokenMapResolver,
    claims: ClaimCoordinator,
    submitter: SettlementSubmitter<C>,
    signer: PrivateKeySigner,
    verification: Option<VerificationGateway>,
    reap_interval: Duration,
    max_attempts: i32,
}

impl<C: SettlementClient> BridgeProcessor<C> {
    pub fn new(
        config: &Config,
        db: PgPool,
        codec: Arc<EventCodec>,
        claims: ClaimCoordinator,
        submitter: SettlementSubmitter<C>,
        signer: PrivateKeySigner,
        verification: Option<VerificationGateway>,
    ) -> Self {
        Self {
            db,
            codec,
            tokens: config.relayer.token_mappings.clone(),
            claims,
            submitter,
            signer,
            verification,
            reap_interval: Duration::from_secs(config.claims.reap_interval_secs),
            max_attempts: config.relayer.retry_attempts as i32,
        }
    }

    /// Consume intake events until shutdown. The claim reaper and the
    /// recovery pass run on their own interval inside the same loop.
    pub async fn run(
        &self,
        mut intake: mpsc::Receiver<IntakeEvent>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("Bridge processor started");

        // replay whatever the last run left behind before taking new work
        if let Err(e) = self.recover_pending().await {
            error!(error = %e, "Startup recovery pass failed");
            metrics::record_error("processor", "recover");
        }

        let mut reap_tick = tokio::time::interval(self.reap_interval);
        reap_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping processor");
                    return Ok(());
                }
                _ = reap_tick.tick() => {
                    if let Err(e) = self.reap_expired_claims().await {
                        error!(error = %e, "Claim reaper pass failed");
                        metrics::record_error("processor", "reap");
                    }
                    if let Err(e) = self.recover_pending().await {
                        error!(error = %e, "Recovery pass failed");
                        metrics::record_error("processor", "recover");
                    }
                }
                event = intake.recv() => {
                    let Some(IntakeEvent { journal_id, event }) = event else {
                        return Err(eyre!("intake channel closed"));
                    };
                    match self.handle_event(event).await {
                        // the journal row stays pending on error; the
                        // recovery pass retries it
                        Ok(()) => db::mark_event_processed(&self.db, journal_id).await?,
                        Err(e) => {
                            error!(error = %e, "Failed to handle chain event");
                            metrics::record_error("processor", "handle");
                        }
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: ChainEvent) -> Result<()> {
        match event {
            ChainEvent::Intent { chain, tx_ref, line } => {
                self.handle_intent(&chain, &tx_ref, &line).await
            }
            ChainEvent::ClaimObserved {
                msg_id,
                solver,
                bond,
                claimed_at,
                deadline,
                ..
            } => {
                self.handle_claim(msg_id, &solver, bond, claimed_at, deadline)
                    .await
            }
            ChainEvent::DeliveryObserved {
                msg_id, signature, ..
            } => self.handle_delivery(msg_id, &signature).await,
        }
    }

    /// An encrypted intent envelope was observed on either chain.
    async fn handle_intent(&self, chain: &str, tx_ref: &str, line: &str) -> Result<()> {
        let envelope = match self.codec.parse_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(chain, tx_ref, error = %e, "Dropping undecodable event line");
                metrics::record_decrypt_failure(chain, error_reason(&e));
                return Ok(());
            }
        };

        // Tampered routing id: drop without persisting anything.
        if !envelope.integrity_ok() {
            warn!(
                chain,
                tx_ref,
                msg_id = %envelope.msg_id,
                "Clear msgId does not match recomputed msgId, dropping"
            );
            metrics::record_decrypt_failure(chain, "integrity");
            return Ok(());
        }

        let message = &envelope.message;
        let id = msg_id_hex(&envelope.msg_id);
        let new_request = new_request_from(message, &id, envelope.kv);

        let inserted = db::insert_detected(&self.db, &new_request).await?;
        if !inserted {
            debug!(msg_id = %id, "Duplicate intent, already tracked");
            return Ok(());
        }

        // Expired on arrival: keep the row for triage, never deliver.
        let now = chrono::Utc::now().timestamp();
        if intent_expired(message.expiry, now) {
            warn!(msg_id = %id, expiry = message.expiry, "Intent expired on arrival");
            db::mark_failed(&self.db, &id, "expired").await?;
            return Ok(());
        }

        info!(
            chain,
            msg_id = %id,
            dir = message.dir,
            amount = %message.amount,
            solver_mediated = message.is_solver_mediated(),
            "New bridge request detected"
        );

        let attestation = attest(&self.signer, envelope.msg_id).await?;
        db::set_signature(
            &self.db,
            &id,
            attestation.v as i32,
            &format!("{:#x}", attestation.r),
            &format!("{:#x}", attestation.s),
        )
        .await?;

        if message.is_solver_mediated() {
            // dir=2 waits in `detected` for a solver claim
            return Ok(());
        }

        // dir=1 runs straight through the no-solver path
        if self.step_decrypt(&id, message, Status::Detected).await? {
            self.step_transfer(&id, envelope.msg_id).await?;
        }
        Ok(())
    }

    /// A solver claimed a solver-mediated request. The deadline is the
    /// one the contract emitted; the coordinator stores it verbatim.
    async fn handle_claim(
        &self,
        msg_id: B256,
        solver: &str,
        bond: U256,
        claimed_at: i64,
        deadline: i64,
    ) -> Result<()> {
        let id = msg_id_hex(&msg_id);
        let Some(request) = db::get_request(&self.db, &id).await? else {
            warn!(msg_id = %id, "Claim for unknown request, ignoring");
            return Ok(());
        };
        if request.status != Status::Detected.as_str() {
            debug!(msg_id = %id, status = %request.status, "Claim for non-detected request, ignoring");
            return Ok(());
        }

        match self.claims.claim(&id, solver, bond, claimed_at, deadline).await {
            Ok(claim) => {
                metrics::record_claim_accepted();
                info!(msg_id = %id, solver, deadline = claim.deadline, "Claim accepted");
            }
            Err(e @ ClaimError::InsufficientBond { .. }) => {
                warn!(msg_id = %id, solver, error = %e, "Claim rejected");
                metrics::record_claim_rejected("insufficient_bond");
                return Ok(());
            }
            Err(e @ ClaimError::AlreadyClaimed) => {
                warn!(msg_id = %id, solver, error = %e, "Claim rejected");
                metrics::record_claim_rejected("already_claimed");
                return Ok(());
            }
            Err(ClaimError::Storage(e)) => return Err(eyre!("claim storage error: {}", e)),
        }

        if !db::transition_status(&self.db, &id, Status::Detected, Status::Claimed).await? {
            debug!(msg_id = %id, "Request moved concurrently, skipping claim transition");
            return Ok(());
        }

        let message = message_from_request(&request)?;
        self.step_decrypt(&id, &message, Status::Claimed).await?;
        Ok(())
    }

    /// A solver delivery notice was observed on the destination chain.
    async fn handle_delivery(&self, msg_id: B256, signature: &str) -> Result<()> {
        let id = msg_id_hex(&msg_id);
        let Some(request) = db::get_request(&self.db, &id).await? else {
            warn!(msg_id = %id, "Delivery notice for unknown request, ignoring");
            return Ok(());
        };
        if request.status != Status::Decrypted.as_str() {
            debug!(
                msg_id = %id,
                status = %request.status,
                "Delivery notice for request not awaiting delivery, ignoring"
            );
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let Some(claim) = self
            .claims
            .live_claim(&id, now)
            .await
            .map_err(|e| eyre!("claim lookup failed: {}", e))?
        else {
            warn!(msg_id = %id, "Delivery notice without a live claim, ignoring");
            return Ok(());
        };

        let dest_token = request
            .dest_token
            .clone()
            .ok_or_else(|| eyre!("request {} missing dest_token", id))?;
        let dest_amount = request
            .dest_amount
            .clone()
            .ok_or_else(|| eyre!("request {} missing dest_amount", id))?;

        // Gateway cross-check runs before any state moves: a rejection
        // fails the row in `decrypted`, a gateway error leaves it there
        // for the recovery pass to retry.
        if let Some(gateway) = &self.verification {
            let response = gateway
                .verify_bridge(&VerifyBridgeRequest {
                    request_id: id.clone(),
                    origin_claim_tx_hash: request.src_tx_id.clone(),
                    dest_transfer_signature: signature.to_string(),
                    dest_address: request.recipient.clone(),
                    amount: dest_amount,
                    token: dest_token,
                })
                .await?;
            if !response.is_verified() {
                warn!(msg_id = %id, message = %response.message, "Gateway rejected delivery");
                db::mark_failed(&self.db, &id, &format!("verification rejected: {}", response.message))
                    .await?;
                return Ok(());
            }
        }

        db::set_transfer_tx(&self.db, &id, signature).await?;
        if !db::transition_status(&self.db, &id, Status::Decrypted, Status::Transferred).await? {
            debug!(msg_id = %id, "Request moved concurrently, skipping delivery");
            return Ok(());
        }

        // Settlement failures from here leave the row in `transferred`;
        // the recovery pass re-runs finish_settlement until the budget
        // is spent.
        self.finish_settlement(&id, msg_id).await?;
        debug!(solver = %claim.solver, msg_id = %id, "Delivery handled");
        Ok(())
    }

    /// Settle a delivered transfer and close out the request. Idempotent:
    /// the submitter skips settlement once the contract reports the
    /// message finalized, so a crashed or failed earlier pass can rerun.
    async fn finish_settlement(&self, id: &str, msg_id: B256) -> Result<()> {
        let request = db::get_request(&self.db, id)
            .await?
            .ok_or_else(|| eyre!("request {} disappeared", id))?;
        let transfer_tx = request
            .transfer_tx
            .clone()
            .ok_or_else(|| eyre!("request {} missing transfer_tx", id))?;
        let dest_token = request
            .dest_token
            .clone()
            .ok_or_else(|| eyre!("request {} missing dest_token", id))?;
        let dest_amount = request
            .dest_amount
            .clone()
            .ok_or_else(|| eyre!("request {} missing dest_amount", id))?;
        let claim = db::get_claim(&self.db, id)
            .await?
            .ok_or_else(|| eyre!("request {} has no claim to settle against", id))?;

        // Evidence derived from the delivery: the destination signature
        // hashed into a 32-byte reference, and a digest over the payout
        // facts the settlement contract can re-derive.
        let dest_tx_ref = keccak256(transfer_tx.as_bytes());
        let evidence_hash = keccak256(
            format!("{}|{}|{}", dest_token, dest_amount, request.recipient).as_bytes(),
        );

        if let Some(tx_hash) = self
            .submitter
            .settle(msg_id, dest_tx_ref, evidence_hash, &claim.solver)
            .await?
        {
            db::set_settle_tx(&self.db, id, &tx_hash).await?;
        }

        self.claims
            .release(id)
            .await
            .map_err(|e| eyre!("claim release failed: {}", e))?;

        if db::transition_status(&self.db, id, Status::Transferred, Status::Verified).await? {
            self.record_latency(&request);
            info!(msg_id = %id, solver = %claim.solver, "Solver delivery verified and settled");
        }
        Ok(())
    }

    /// Resolve the token mapping and convert the amount. Advances the
    /// request to `decrypted`; unmappable tokens fail the request.
    async fn step_decrypt(&self, id: &str, message: &BridgeMessage, from: Status) -> Result<bool> {
        let origin_token = format!("{:#x}", message.origin_token);
        let Some(mapping) = self.tokens.resolve(&origin_token) else {
            warn!(msg_id = %id, origin_token = %origin_token, "No token mapping, failing request");
            db::mark_failed(&self.db, id, &format!("no token mapping for {}", origin_token))
                .await?;
            return Ok(false);
        };

        let converted = convert(message.amount, mapping, ConvertDirection::OriginToDest);
        if !converted.dust.is_zero() {
            debug!(
                msg_id = %id,
                dust = %converted.dust,
                "Down-conversion truncated dust, remains in origin escrow"
            );
        }

        let advanced = db::transition_to_decrypted(
            &self.db,
            id,
            from,
            &mapping.dest,
            &converted.amount.to_string(),
        )
        .await?;
        Ok(advanced)
    }

    /// Submit the destination payout for a no-solver request and verify it.
    async fn step_transfer(&self, id: &str, msg_id: B256) -> Result<()> {
        let request = db::get_request(&self.db, id)
            .await?
            .ok_or_else(|| eyre!("request {} disappeared", id))?;
        let dest_token = request
            .dest_token
            .clone()
            .ok_or_else(|| eyre!("request {} missing dest_token", id))?;
        let dest_amount_str = request
            .dest_amount
            .clone()
            .ok_or_else(|| eyre!("request {} missing dest_amount", id))?;

        let token = address_from_identity(&dest_token)?;
        let to = address_from_identity(&request.recipient)?;
        let amount = U256::from_str(&dest_amount_str)
            .map_err(|_| eyre!("invalid dest_amount: {}", dest_amount_str))?;

        // Economic shortfall leaves the row in `decrypted`; a later pass
        // (or refilled escrow) can pick it up again.
        if !self.submitter.has_liquidity(token, amount).await? {
            warn!(msg_id = %id, amount = %amount, "Insufficient escrow liquidity, deferring payout");
            metrics::record_error("processor", "liquidity");
            return Ok(());
        }

        let attestation = attestation_from_request(&request)?;
        let outcome = self
            .submitter
            .submit(msg_id, token, to, amount, attestation)
            .await;

        match outcome {
            Ok(PayoutOutcome::Submitted(tx_hash)) => {
                db::set_transfer_tx(&self.db, id, &tx_hash).await?;
            }
            Ok(PayoutOutcome::AlreadyFinalized) => {
                debug!(msg_id = %id, "Payout already finalized on-chain");
            }
            Err(e) => {
                error!(msg_id = %id, error = %e, "Payout failed");
                db::mark_failed(&self.db, id, &format!("payout failed: {}", e)).await?;
                return Ok(());
            }
        }

        if !db::transition_status(&self.db, id, Status::Decrypted, Status::Transferred).await? {
            return Ok(());
        }

        self.step_verify(id, msg_id, &request).await
    }

    /// Confirm the payout: gateway cross-check when configured, otherwise
    /// the settlement contract's own finalized read-back.
    async fn step_verify(&self, id: &str, msg_id: B256, request: &BridgeRequest) -> Result<()> {
        let verified = match &self.verification {
            Some(gateway) => {
                let transfer_tx = db::get_request(&self.db, id)
                    .await?
                    .and_then(|r| r.transfer_tx)
                    .unwrap_or_default();
                let response = gateway
                    .verify_bridge(&VerifyBridgeRequest {
                        request_id: id.to_string(),
                        origin_claim_tx_hash: request.src_tx_id.clone(),
                        dest_transfer_signature: transfer_tx,
                        dest_address: request.recipient.clone(),
                        amount: request.dest_amount.clone().unwrap_or_default(),
                        token: request.dest_token.clone().unwrap_or_default(),
                    })
                    .await?;
                response.is_verified()
            }
            None => self.submitter.client().is_finalized(msg_id).await?,
        };

        if !verified {
            warn!(msg_id = %id, "Payout not verified yet, leaving in transferred");
            return Ok(());
        }

        if db::transition_status(&self.db, id, Status::Transferred, Status::Verified).await? {
            self.record_latency(request);
            info!(msg_id = %id, "Bridge request verified");
        }
        Ok(())
    }

    /// Slash expired unreleased claims and fail their requests.
    pub async fn reap_expired_claims(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let expired = self
            .claims
            .expired_claims(now)
            .await
            .map_err(|e| eyre!("expired claim lookup failed: {}", e))?;

        for claim in expired {
            let msg_id = b256_from_hex(&claim.msg_id)?;
            info!(
                msg_id = %claim.msg_id,
                solver = %claim.solver,
                deadline = claim.deadline,
                "Claim deadline passed, slashing"
            );

            if let Err(e) = self.submitter.slash(msg_id).await {
                error!(msg_id = %claim.msg_id, error = %e, "Slash failed, will retry next pass");
                continue;
            }
            // released here means settled on-chain (slashed), so the
            // reaper never picks it up again
            self.claims
                .release(&claim.msg_id)
                .await
                .map_err(|e| eyre!("claim release failed: {}", e))?;
            db::mark_failed(
                &self.db,
                &claim.msg_id,
                "claim deadline expired; bond slashed",
            )
            .await?;
        }
        Ok(())
    }

    /// Replay journaled events that never completed handling, then
    /// re-drive rows stalled in a non-terminal status. A row whose
    /// re-drive keeps erroring is failed once its budget is spent.
    pub async fn recover_pending(&self) -> Result<()> {
        let pending = db::unprocessed_events(&self.db, 500).await?;
        for (journal_id, payload) in pending {
            let event: ChainEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    // unreadable rows would wedge the journal forever
                    warn!(journal_id, error = %e, "Corrupt journaled event, discarding");
                    db::mark_event_processed(&self.db, journal_id).await?;
                    continue;
                }
            };
            match self.handle_event(event).await {
                Ok(()) => db::mark_event_processed(&self.db, journal_id).await?,
                Err(e) => {
                    warn!(journal_id, error = %e, "Journaled event replay failed, will retry");
                    metrics::record_error("processor", "replay");
                }
            }
        }

        for request in db::active_requests(&self.db).await? {
            if let Err(e) = self.resume_request(&request).await {
                warn!(msg_id = %request.msg_id, error = %e, "Request re-drive failed");
                metrics::record_error("processor", "resume");
                let attempts = db::increment_attempts(&self.db, &request.msg_id).await?;
                if attempts >= self.max_attempts {
                    db::mark_failed(
                        &self.db,
                        &request.msg_id,
                        &format!("retry budget exhausted: {}", e),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Pick one stalled row up from wherever it stopped. States that are
    /// legitimately waiting on an external party (a solver claim or a
    /// delivery notice) are left alone.
    async fn resume_request(&self, request: &BridgeRequest) -> Result<()> {
        let id = request.msg_id.clone();
        let msg_id = b256_from_hex(&id)?;
        let solver_mediated = request.dir == 2;
        let now = chrono::Utc::now().timestamp();

        match request.status.as_str() {
            "detected" => {
                if intent_expired(request.expiry as u64, now) {
                    db::mark_failed(&self.db, &id, "expired").await?;
                    return Ok(());
                }
                if solver_mediated {
                    // waiting for a solver claim
                    return Ok(());
                }
                if request.sig_r.is_none() {
                    let attestation = attest(&self.signer, msg_id).await?;
                    db::set_signature(
                        &self.db,
                        &id,
                        attestation.v as i32,
                        &format!("{:#x}", attestation.r),
                        &format!("{:#x}", attestation.s),
                    )
                    .await?;
                }
                let message = message_from_request(request)?;
                if self.step_decrypt(&id, &message, Status::Detected).await? {
                    self.step_transfer(&id, msg_id).await?;
                }
            }
            "claimed" => {
                let message = message_from_request(request)?;
                self.step_decrypt(&id, &message, Status::Claimed).await?;
            }
            "decrypted" => {
                if solver_mediated {
                    // waiting for the solver's delivery notice
                    return Ok(());
                }
                self.step_transfer(&id, msg_id).await?;
            }
            "transferred" => {
                if solver_mediated {
                    self.finish_settlement(&id, msg_id).await?;
                } else {
                    self.step_verify(&id, msg_id, request).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn record_latency(&self, request: &BridgeRequest) {
        let elapsed = (chrono::Utc::now() - request.created_at).num_milliseconds();
        let dir = if request.dir == 2 { "dest_to_origin" } else { "origin_to_dest" };
        metrics::record_latency(dir, elapsed as f64 / 1000.0);
    }
}

/// An intent whose expiry has been reached is dead: expiry == now is
/// already too late, matching the settlement contract's own check.
fn intent_expired(expiry: u64, now: i64) -> bool {
    expiry as i64 <= now
}

fn new_request_from(message: &BridgeMessage, id: &str, kv: u32) -> NewBridgeRequest {
    NewBridgeRequest {
        msg_id: id.to_string(),
        key_version: kv as i32,
        version: message.version as i16,
        dir: message.dir as i16,
        src_chain_id: message.src_chain_id.to_string(),
        dst_chain_id: message.dst_chain_id.to_string(),
        src_tx_id: format!("{:#x}", message.src_tx_id),
        origin_token: format!("{:#x}", message.origin_token),
        amount: message.amount.to_string(),
        recipient: format!("{:#x}", message.recipient),
        nonce: message.nonce.to_string(),
        expiry: message.expiry as i64,
    }
}

/// Rebuild the canonical message from a persisted row.
fn message_from_request(request: &BridgeRequest) -> Result<BridgeMessage> {
    Ok(BridgeMessage {
        version: request.version as u8,
        dir: request.dir as u8,
        src_chain_id: U256::from_str(&request.src_chain_id)
            .map_err(|_| eyre!("invalid src_chain_id"))?,
        dst_chain_id: U256::from_str(&request.dst_chain_id)
            .map_err(|_| eyre!("invalid dst_chain_id"))?,
        src_tx_id: b256_from_hex(&request.src_tx_id)?,
        origin_token: b256_from_hex(&request.origin_token)?,
        amount: U256::from_str(&request.amount).map_err(|_| eyre!("invalid amount"))?,
        recipient: b256_from_hex(&request.recipient)?,
        nonce: U256::from_str(&request.nonce).map_err(|_| eyre!("invalid nonce"))?,
        expiry: request.expiry as u64,
    })
}

fn attestation_from_request(request: &BridgeRequest) -> Result<crate::settlement::Attestation> {
    let v = request
        .sig_v
        .ok_or_else(|| eyre!("request {} missing attestation", request.msg_id))?;
    let r = request
        .sig_r
        .as_deref()
        .ok_or_else(|| eyre!("request {} missing attestation r", request.msg_id))?;
    let s = request
        .sig_s
        .as_deref()
        .ok_or_else(|| eyre!("request {} missing attestation s", request.msg_id))?;
    Ok(crate::settlement::Attestation {
        v: v as u8,
        r: b256_from_hex(r)?,
        s: b256_from_hex(s)?,
    })
}

fn b256_from_hex(raw: &str) -> Result<B256> {
    let hex_part = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes: [u8; 32] = hex::decode(hex_part)
        .wrap_err_with(|| format!("invalid hex: {}", raw))?
        .try_into()
        .map_err(|_| eyre!("expected 32 bytes: {}", raw))?;
    Ok(B256::from(bytes))
}

/// Extract the EVM address from a 32-byte identity (last 20 bytes).
fn address_from_identity(raw: &str) -> Result<Address> {
    let hex_part = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(hex_part).wrap_err_with(|| format!("invalid identity: {}", raw))?;
    match bytes.len() {
        32 => Ok(Address::from_slice(&bytes[12..])),
        20 => Ok(Address::from_slice(&bytes)),
        n => Err(eyre!("identity must be 20 or 32 bytes, got {}", n)),
    }
}

fn error_reason(e: &crate::codec::DecryptError) -> &'static str {
    use crate::codec::DecryptError::*;
    match e {
        NoEnvelope => "no_envelope",
        MalformedPrefix | BadKeyVersion(_) | BadMsgId(_) => "malformed",
        UnknownKeyVersion(_) => "unknown_key_version",
        Base64(_) | TooShort => "bad_payload",
        AuthFailed => "auth_failed",
        BadPayload(_) => "bad_plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;

    use crate::claims::ClaimCoordinator;
    use crate::codec::EventCodec;
    use crate::config::{
        ApiConfig, ClaimsConfig, DatabaseConfig, EvmConfig, KeyringConfig, RelayerConfig,
        SolanaConfig,
    };
    use crate::retry::RetryConfig;
    use crate::settlement::Attestation;
    use crate::token_map::TokenMapResolver;

    #[test]
    fn test_intent_expiry_boundary() {
        assert!(intent_expired(999, 1000));
        assert!(intent_expired(1000, 1000)); // expiry == now is already dead
        assert!(!intent_expired(1001, 1000));
    }

    #[test]
    fn test_address_from_identity() {
        let padded = format!("0x{}{}", "00".repeat(12), "ab".repeat(20));
        let addr = address_from_identity(&padded).unwrap();
        assert_eq!(addr, Address::repeat_byte(0xab));

        let plain = format!("0x{}", "cd".repeat(20));
        assert_eq!(
            address_from_identity(&plain).unwrap(),
            Address::repeat_byte(0xcd)
        );

        assert!(address_from_identity("0xabcd").is_err());
    }

    #[test]
    fn test_b256_from_hex() {
        let hex = format!("0x{}", "ef".repeat(32));
        assert_eq!(b256_from_hex(&hex).unwrap(), B256::repeat_byte(0xef));
        assert!(b256_from_hex("0x1234").is_err());
    }

    #[test]
    fn test_message_roundtrip_through_row() {
        let message = BridgeMessage {
            version: 1,
            dir: 2,
            src_chain_id: U256::from(11155111u64),
            dst_chain_id: U256::from(1u64),
            src_tx_id: B256::repeat_byte(0xAA),
            origin_token: B256::repeat_byte(0x01),
            amount: U256::from(5_000_000u64),
            recipient: B256::repeat_byte(0xBB),
            nonce: U256::from(7u64),
            expiry: 1_900_000_000,
        };
        let id = msg_id_hex(&message.msg_id());
        let new_request = new_request_from(&message, &id, 1);

        let row = BridgeRequest {
            msg_id: new_request.msg_id,
            key_version: new_request.key_version,
            version: new_request.version,
            dir: new_request.dir,
            src_chain_id: new_request.src_chain_id,
            dst_chain_id: new_request.dst_chain_id,
            src_tx_id: new_request.src_tx_id,
            origin_token: new_request.origin_token,
            amount: new_request.amount,
            recipient: new_request.recipient,
            nonce: new_request.nonce,
            expiry: new_request.expiry,
            status: "detected".to_string(),
            sig_v: None,
            sig_r: None,
            sig_s: None,
            dest_token: None,
            dest_amount: None,
            transfer_tx: None,
            settle_tx: None,
            error: None,
            attempts: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let rebuilt = message_from_request(&row).unwrap();
        assert_eq!(rebuilt, message);
        assert_eq!(msg_id_hex(&rebuilt.msg_id()), row.msg_id);
    }

    // ---- pipeline tests against a real database ----
    //
    // These run only when DATABASE_URL is set, like the integration
    // tests in tests/. Recovery passes scan the whole table, so tests
    // that call recover_pending serialize on DB_LOCK.

    static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    const DEST_TOKEN_HEX: &str =
        "0x2222222222222222222222222222222222222222222222222222222222222222";
    const SOLVER: &str = "0x0000000000000000000000000000000000000009";

    struct RecordingSettlement {
        finalized: Arc<AtomicBool>,
        payout_calls: Arc<AtomicU32>,
        settle_calls: Arc<AtomicU32>,
        fail_settle: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SettlementClient for RecordingSettlement {
        async fn is_finalized(&self, _msg_id: B256) -> Result<bool> {
            Ok(self.finalized.load(Ordering::SeqCst))
        }

        async fn token_balance(&self, _token: Address) -> Result<U256> {
            Ok(U256::from(u64::MAX))
        }

        async fn submit_payout(
            &self,
            _msg_id: B256,
            _token: Address,
            _to: Address,
            _amount: U256,
            _attestation: Attestation,
        ) -> Result<String> {
            self.payout_calls.fetch_add(1, Ordering::SeqCst);
            self.finalized.store(true, Ordering::SeqCst);
            Ok(format!("0x{}", "cd".repeat(32)))
        }

        async fn verify_and_settle(
            &self,
            _msg_id: B256,
            _dest_tx_ref: B256,
            _evidence_hash: B256,
            _solver: &str,
        ) -> Result<String> {
            self.settle_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_settle.load(Ordering::SeqCst) {
                return Err(eyre!("execution reverted"));
            }
            self.finalized.store(true, Ordering::SeqCst);
            Ok(format!("0x{}", "ef".repeat(32)))
        }

        async fn slash(&self, _msg_id: B256) -> Result<String> {
            Ok(format!("0x{}", "99".repeat(32)))
        }
    }

    struct SettlementHandles {
        payout_calls: Arc<AtomicU32>,
        settle_calls: Arc<AtomicU32>,
        fail_settle: Arc<AtomicBool>,
    }

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!("./migrations").run(&pool).await.ok()?;
        Some(pool)
    }

    fn pipeline_config() -> Config {
        let origin = format!("0x{}", "01".repeat(32));
        let mut keys = HashMap::new();
        keys.insert(1, [0x11u8; 32]);
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            evm: EvmConfig {
                rpc_url: "http://localhost:8545".to_string(),
                chain_id: 31337,
                settlement_address: "0x0000000000000000000000000000000000000001".to_string(),
                private_key:
                    "0x0000000000000000000000000000000000000000000000000000000000000001"
                        .to_string(),
                finality_blocks: 1,
            },
            solana: SolanaConfig {
                rpc_url: "http://localhost:8899".to_string(),
                program_id: "BridgeProg1111111111111111111111111111111111".to_string(),
            },
            keyring: KeyringConfig {
                keys,
                active_version: 1,
            },
            claims: ClaimsConfig {
                min_bond: "1000000".to_string(),
                reap_interval_secs: 30,
            },
            relayer: RelayerConfig {
                poll_interval_ms: 1000,
                retry_attempts: 2,
                retry_delay_ms: 1,
                intake_capacity: 16,
                token_mappings: TokenMapResolver::from_env_value(&format!(
                    "{}={}:6:6",
                    origin, DEST_TOKEN_HEX
                ))
                .unwrap(),
            },
            verification: None,
            api: ApiConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 0,
                dev_endpoints: false,
            },
        }
    }

    fn pipeline(pool: PgPool) -> (BridgeProcessor<RecordingSettlement>, SettlementHandles) {
        let config = pipeline_config();
        let handles = SettlementHandles {
            payout_calls: Arc::new(AtomicU32::new(0)),
            settle_calls: Arc::new(AtomicU32::new(0)),
            fail_settle: Arc::new(AtomicBool::new(false)),
        };
        let client = RecordingSettlement {
            finalized: Arc::new(AtomicBool::new(false)),
            payout_calls: handles.payout_calls.clone(),
            settle_calls: handles.settle_calls.clone(),
            fail_settle: handles.fail_settle.clone(),
        };
        let retry = RetryConfig {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };
        let submitter = SettlementSubmitter::new(client, retry);
        let claims = ClaimCoordinator::new(pool.clone(), U256::from(1_000_000u64));
        let codec = Arc::new(EventCodec::new(config.keyring.keys.clone()));
        let signer: PrivateKeySigner = config.evm.private_key.parse().unwrap();
        let processor = BridgeProcessor::new(&config, pool, codec, claims, submitter, signer, None);
        (processor, handles)
    }

    /// A fresh message per run so reruns never collide on msg_id.
    fn unique_message(dir: u8) -> BridgeMessage {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        BridgeMessage {
            version: 1,
            dir,
            src_chain_id: U256::from(900u64),
            dst_chain_id: U256::from(31337u64),
            src_tx_id: B256::repeat_byte(0x5a),
            origin_token: B256::repeat_byte(0x01),
            amount: U256::from(2_000_000u64),
            recipient: B256::repeat_byte(0xbb),
            nonce: U256::from(nanos),
            expiry: 4_000_000_000,
        }
    }

    async fn seed_decrypted(pool: &PgPool, message: &BridgeMessage) -> String {
        let id = msg_id_hex(&message.msg_id());
        assert!(db::insert_detected(pool, &new_request_from(message, &id, 1))
            .await
            .unwrap());
        assert!(
            db::transition_status(pool, &id, Status::Detected, Status::Claimed)
                .await
                .unwrap()
        );
        assert!(
            db::transition_to_decrypted(pool, &id, Status::Claimed, DEST_TOKEN_HEX, "2000000")
                .await
                .unwrap()
        );
        id
    }

    #[tokio::test]
    async fn test_delivery_with_expired_claim_never_settles() {
        let Some(pool) = test_pool().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let (processor, handles) = pipeline(pool.clone());

        let message = unique_message(2);
        let id = seed_decrypted(&pool, &message).await;
        let now = chrono::Utc::now().timestamp();
        assert!(
            db::insert_claim(&pool, &id, SOLVER, "2000000", now - 600, now - 60)
                .await
                .unwrap()
        );

        processor
            .handle_delivery(message.msg_id(), "5xDeliverySig")
            .await
            .unwrap();

        let row = db::get_request(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.status, "decrypted");
        assert!(row.transfer_tx.is_none());
        assert_eq!(handles.settle_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_claim_stores_observed_deadline() {
        let Some(pool) = test_pool().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let (processor, _handles) = pipeline(pool.clone());

        let message = unique_message(2);
        let id = msg_id_hex(&message.msg_id());
        assert!(db::insert_detected(&pool, &new_request_from(&message, &id, 1))
            .await
            .unwrap());

        let now = chrono::Utc::now().timestamp();
        // contract window shorter than any local guess would be
        let deadline = now + 120;
        processor
            .handle_claim(message.msg_id(), SOLVER, U256::from(2_000_000u64), now, deadline)
            .await
            .unwrap();

        let claim = db::get_claim(&pool, &id).await.unwrap().unwrap();
        assert_eq!(claim.deadline, deadline);
        assert_eq!(claim.claimed_at, now);
        let row = db::get_request(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.status, "decrypted");
    }

    #[tokio::test]
    async fn test_insufficient_bond_claim_leaves_no_row() {
        let Some(pool) = test_pool().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let (processor, _handles) = pipeline(pool.clone());

        let message = unique_message(2);
        let id = msg_id_hex(&message.msg_id());
        assert!(db::insert_detected(&pool, &new_request_from(&message, &id, 1))
            .await
            .unwrap());

        let now = chrono::Utc::now().timestamp();
        processor
            .handle_claim(message.msg_id(), SOLVER, U256::from(5u64), now, now + 900)
            .await
            .unwrap();

        assert!(db::get_claim(&pool, &id).await.unwrap().is_none());
        let row = db::get_request(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.status, "detected");
    }

    #[tokio::test]
    async fn test_settle_failure_leaves_recoverable_row() {
        let Some(pool) = test_pool().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let _guard = DB_LOCK.lock().await;
        let (processor, handles) = pipeline(pool.clone());

        let message = unique_message(2);
        let id = seed_decrypted(&pool, &message).await;
        let now = chrono::Utc::now().timestamp();
        assert!(
            db::insert_claim(&pool, &id, SOLVER, "2000000", now, now + 900)
                .await
                .unwrap()
        );

        handles.fail_settle.store(true, Ordering::SeqCst);
        assert!(processor
            .handle_delivery(message.msg_id(), "5xDeliverySig")
            .await
            .is_err());

        // stalled, not stranded: still transferred, claim still held
        let row = db::get_request(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.status, "transferred");
        let claim = db::get_claim(&pool, &id).await.unwrap().unwrap();
        assert!(!claim.released);

        handles.fail_settle.store(false, Ordering::SeqCst);
        processor.recover_pending().await.unwrap();

        let row = db::get_request(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.status, "verified");
        let claim = db::get_claim(&pool, &id).await.unwrap().unwrap();
        assert!(claim.released);
    }

    #[tokio::test]
    async fn test_recovery_resumes_stalled_payout() {
        let Some(pool) = test_pool().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let _guard = DB_LOCK.lock().await;
        let (processor, handles) = pipeline(pool.clone());

        // a no-solver request that crashed after decrypt, before payout
        let message = unique_message(1);
        let id = msg_id_hex(&message.msg_id());
        assert!(db::insert_detected(&pool, &new_request_from(&message, &id, 1))
            .await
            .unwrap());
        db::set_signature(
            &pool,
            &id,
            27,
            &format!("0x{}", "aa".repeat(32)),
            &format!("0x{}", "bb".repeat(32)),
        )
        .await
        .unwrap();
        assert!(db::transition_to_decrypted(
            &pool,
            &id,
            Status::Detected,
            DEST_TOKEN_HEX,
            "2000000"
        )
        .await
        .unwrap());

        processor.recover_pending().await.unwrap();

        let row = db::get_request(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.status, "verified");
        assert_eq!(handles.payout_calls.load(Ordering::SeqCst), 1);
    }
}
