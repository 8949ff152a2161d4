//! Solver claim coordination
//!
//! Solver-mediated transfers must be claimed with a bond before delivery.
//! A claim gives one solver exclusive rights until its deadline; after the
//! deadline an unreleased claim is slashable and the request fails.

use alloy::primitives::U256;
use sqlx::PgPool;
use thiserror::Error;

use crate::db::{self, Claim};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("insufficient bond: {bond} < {minimum}")]
    InsufficientBond { bond: String, minimum: String },
    #[error("already claimed by another solver")]
    AlreadyClaimed,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Tracks solver claims against bridge requests.
pub struct ClaimCoordinator {
    pool: PgPool,
    min_bond: U256,
}

impl ClaimCoordinator {
    pub fn new(pool: PgPool, min_bond: U256) -> Self {
        Self { pool, min_bond }
    }

    /// Register a solver's claim. The bond must meet the configured
    /// minimum and the request must not already carry a claim. The
    /// deadline is the one the settlement contract emitted with the
    /// claim, not a local clock; expiry checks must agree with the
    /// chain's own view of the delivery window.
    pub async fn claim(
        &self,
        msg_id: &str,
        solver: &str,
        bond: U256,
        claimed_at: i64,
        deadline: i64,
    ) -> Result<Claim, ClaimError> {
        if bond < self.min_bond {
            return Err(ClaimError::InsufficientBond {
                bond: bond.to_string(),
                minimum: self.min_bond.to_string(),
            });
        }

        let inserted = db::insert_claim(
            &self.pool,
            msg_id,
            solver,
            &bond.to_string(),
            claimed_at,
            deadline,
        )
        .await
        .map_err(|e| ClaimError::Storage(e.to_string()))?;

        if !inserted {
            return Err(ClaimError::AlreadyClaimed);
        }

        Ok(Claim {
            msg_id: msg_id.to_string(),
            solver: solver.to_string(),
            bond: bond.to_string(),
            claimed_at,
            deadline,
            released: false,
            created_at: chrono::Utc::now(),
        })
    }

    /// The live (unreleased, unexpired) claim for a request, if any.
    pub async fn live_claim(&self, msg_id: &str, now: i64) -> Result<Option<Claim>, ClaimError> {
        let claim = db::get_claim(&self.pool, msg_id)
            .await
            .map_err(|e| ClaimError::Storage(e.to_string()))?;
        Ok(claim.filter(|c| !c.released && !is_expired(c, now)))
    }

    /// Release a claim's bond after successful delivery.
    pub async fn release(&self, msg_id: &str) -> Result<(), ClaimError> {
        db::release_claim(&self.pool, msg_id)
            .await
            .map_err(|e| ClaimError::Storage(e.to_string()))
    }

    /// Unreleased claims past their deadline, for the reaper.
    pub async fn expired_claims(&self, now: i64) -> Result<Vec<Claim>, ClaimError> {
        db::expired_unreleased_claims(&self.pool, now)
            .await
            .map_err(|e| ClaimError::Storage(e.to_string()))
    }
}

/// Whether a claim's delivery window has closed.
pub fn is_expired(claim: &Claim, now: i64) -> bool {
    now > claim.deadline
}
