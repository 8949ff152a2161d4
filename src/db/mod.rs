//! Database access layer
//!
//! All pipeline state lives in Postgres. The processor is the only writer
//! of `bridge_requests.status`; it advances rows with status-conditioned
//! UPDATEs and treats `rows_affected == 0` as "someone already moved it".

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::types::Status;

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// SQL SELECT columns for bridge_requests (casting NUMERIC to TEXT)
const REQUEST_SELECT: &str = r#"msg_id, key_version, version, dir,
    src_chain_id::TEXT as src_chain_id, dst_chain_id::TEXT as dst_chain_id,
    src_tx_id, origin_token, amount::TEXT as amount, recipient,
    nonce::TEXT as nonce, expiry, status, sig_v, sig_r, sig_s,
    dest_token, dest_amount::TEXT as dest_amount, transfer_tx, settle_tx,
    error, attempts, created_at, updated_at"#;

/// SQL SELECT columns for claims (casting NUMERIC to TEXT)
const CLAIM_SELECT: &str =
    r#"msg_id, solver, bond::TEXT as bond, claimed_at, deadline, released, created_at"#;

/// Insert a newly detected request. Returns false when the row already
/// exists (duplicate event replay); the insert is the exactly-once gate.
pub async fn insert_detected(pool: &PgPool, req: &NewBridgeRequest) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO bridge_requests (msg_id, key_version, version, dir, src_chain_id,
            dst_chain_id, src_tx_id, origin_token, amount, recipient, nonce, expiry, status)
        VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7, $8, $9::NUMERIC, $10,
            $11::NUMERIC, $12, 'detected')
        ON CONFLICT (msg_id) DO NOTHING
        "#,
    )
    .bind(&req.msg_id)
    .bind(req.key_version)
    .bind(req.version)
    .bind(req.dir)
    .bind(&req.src_chain_id)
    .bind(&req.dst_chain_id)
    .bind(&req.src_tx_id)
    .bind(&req.origin_token)
    .bind(&req.amount)
    .bind(&req.recipient)
    .bind(&req.nonce)
    .bind(req.expiry)
    .execute(pool)
    .await
    .wrap_err("Failed to insert bridge request")?;

    Ok(result.rows_affected() == 1)
}

/// Fetch one request by msg_id
pub async fn get_request(pool: &PgPool, msg_id: &str) -> Result<Option<BridgeRequest>> {
    let query = format!(
        "SELECT {} FROM bridge_requests WHERE msg_id = $1",
        REQUEST_SELECT
    );
    let row = sqlx::query_as::<_, BridgeRequest>(&query)
        .bind(msg_id)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get bridge request")?;

    Ok(row)
}

/// Advance a request from one status to the next. Returns false when the
/// row was not in the expected state (already advanced or failed).
pub async fn transition_status(
    pool: &PgPool,
    msg_id: &str,
    from: Status,
    to: Status,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE bridge_requests SET status = $3, updated_at = NOW()
           WHERE msg_id = $1 AND status = $2"#,
    )
    .bind(msg_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to transition {} {} -> {}", msg_id, from, to))?;

    Ok(result.rows_affected() == 1)
}

/// Advance to `decrypted`, recording the resolved destination token and
/// converted amount in the same statement.
pub async fn transition_to_decrypted(
    pool: &PgPool,
    msg_id: &str,
    from: Status,
    dest_token: &str,
    dest_amount: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE bridge_requests
           SET status = 'decrypted', dest_token = $3, dest_amount = $4::NUMERIC,
               updated_at = NOW()
           WHERE msg_id = $1 AND status = $2"#,
    )
    .bind(msg_id)
    .bind(from.as_str())
    .bind(dest_token)
    .bind(dest_amount)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to transition {} to decrypted", msg_id))?;

    Ok(result.rows_affected() == 1)
}

/// Mark a request failed with a reason. Terminal rows are never touched.
pub async fn mark_failed(pool: &PgPool, msg_id: &str, error: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE bridge_requests
           SET status = 'failed', error = $2, updated_at = NOW()
           WHERE msg_id = $1 AND status NOT IN ('verified', 'failed')"#,
    )
    .bind(msg_id)
    .bind(error)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to mark {} as failed", msg_id))?;

    Ok(result.rows_affected() == 1)
}

/// Store the relayer's attestation signature over msg_id
pub async fn set_signature(pool: &PgPool, msg_id: &str, v: i32, r: &str, s: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE bridge_requests SET sig_v = $2, sig_r = $3, sig_s = $4, updated_at = NOW()
           WHERE msg_id = $1"#,
    )
    .bind(msg_id)
    .bind(v)
    .bind(r)
    .bind(s)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to set signature for {}", msg_id))?;

    Ok(())
}

/// Record the destination transfer reference (tx hash or signature)
pub async fn set_transfer_tx(pool: &PgPool, msg_id: &str, transfer_tx: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE bridge_requests SET transfer_tx = $2,
           updated_at = NOW() WHERE msg_id = $1"#,
    )
    .bind(msg_id)
    .bind(transfer_tx)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to set transfer tx for {}", msg_id))?;

    Ok(())
}

/// Record the settlement transaction hash
pub async fn set_settle_tx(pool: &PgPool, msg_id: &str, settle_tx: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE bridge_requests SET settle_tx = $2, updated_at = NOW() WHERE msg_id = $1"#,
    )
    .bind(msg_id)
    .bind(settle_tx)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to set settle tx for {}", msg_id))?;

    Ok(())
}

/// Bump the re-drive counter for a stalled request. Returns the new count
/// so the caller can fail the row once its budget is spent.
pub async fn increment_attempts(pool: &PgPool, msg_id: &str) -> Result<i32> {
    let attempts: i32 = sqlx::query_scalar(
        r#"UPDATE bridge_requests SET attempts = attempts + 1, updated_at = NOW()
           WHERE msg_id = $1 RETURNING attempts"#,
    )
    .bind(msg_id)
    .fetch_one(pool)
    .await
    .wrap_err_with(|| format!("Failed to increment attempts for {}", msg_id))?;

    Ok(attempts)
}

/// All rows still in flight, oldest first, for the recovery pass.
pub async fn active_requests(pool: &PgPool) -> Result<Vec<BridgeRequest>> {
    let query = format!(
        "SELECT {} FROM bridge_requests WHERE status NOT IN ('verified', 'failed')
         ORDER BY created_at",
        REQUEST_SELECT
    );
    let rows = sqlx::query_as::<_, BridgeRequest>(&query)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list active bridge requests")?;

    Ok(rows)
}

/// Count requests per status, for the /status endpoint and metrics
pub async fn status_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        r#"SELECT status, COUNT(*) as count FROM bridge_requests GROUP BY status"#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to count requests by status")?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get("status"), r.get("count")))
        .collect())
}

// ============ Claims ============

/// Record a solver's claim. Returns false if the request is already claimed.
pub async fn insert_claim(
    pool: &PgPool,
    msg_id: &str,
    solver: &str,
    bond: &str,
    claimed_at: i64,
    deadline: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO claims (msg_id, solver, bond, claimed_at, deadline)
        VALUES ($1, $2, $3::NUMERIC, $4, $5)
        ON CONFLICT (msg_id) DO NOTHING
        "#,
    )
    .bind(msg_id)
    .bind(solver)
    .bind(bond)
    .bind(claimed_at)
    .bind(deadline)
    .execute(pool)
    .await
    .wrap_err("Failed to insert claim")?;

    Ok(result.rows_affected() == 1)
}

/// Fetch the claim for a request, if any
pub async fn get_claim(pool: &PgPool, msg_id: &str) -> Result<Option<Claim>> {
    let query = format!("SELECT {} FROM claims WHERE msg_id = $1", CLAIM_SELECT);
    let row = sqlx::query_as::<_, Claim>(&query)
        .bind(msg_id)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get claim")?;

    Ok(row)
}

/// Release a claim's bond (successful delivery)
pub async fn release_claim(pool: &PgPool, msg_id: &str) -> Result<()> {
    sqlx::query(r#"UPDATE claims SET released = TRUE WHERE msg_id = $1"#)
        .bind(msg_id)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to release claim for {}", msg_id))?;

    Ok(())
}

/// Unreleased claims whose deadline has passed, for the reaper
pub async fn expired_unreleased_claims(pool: &PgPool, now: i64) -> Result<Vec<Claim>> {
    let query = format!(
        "SELECT {} FROM claims WHERE NOT released AND deadline < $1",
        CLAIM_SELECT
    );
    let rows = sqlx::query_as::<_, Claim>(&query)
        .bind(now)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get expired claims")?;

    Ok(rows)
}

// ============ Chain event journal ============

/// Journal an observed event. Monitors call this BEFORE advancing their
/// cursor, so an event that never reached the processor survives a crash.
/// Returns None when the event is already journaled (cursor replay).
pub async fn insert_chain_event(
    pool: &PgPool,
    event_key: &str,
    chain: &str,
    payload: &str,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO chain_events (event_key, chain, payload)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(event_key)
    .bind(chain)
    .bind(payload)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to journal chain event")?;

    Ok(row.map(|r| r.0))
}

/// Mark a journaled event handled. Only called after the handler returned
/// Ok; a failed handler leaves the row for the next recovery pass.
pub async fn mark_event_processed(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(r#"UPDATE chain_events SET processed = TRUE WHERE id = $1"#)
        .bind(id)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to mark chain event {} processed", id))?;

    Ok(())
}

/// Journaled events that never completed handling, oldest first.
pub async fn unprocessed_events(pool: &PgPool, limit: i64) -> Result<Vec<(i64, String)>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        r#"SELECT id, payload FROM chain_events WHERE NOT processed ORDER BY id LIMIT $1"#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to list unprocessed chain events")?;

    Ok(rows)
}

// ============ Monitor cursors ============

/// Last processed position for a chain monitor
pub async fn get_cursor(pool: &PgPool, chain: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT cursor FROM monitor_cursors WHERE chain = $1"#)
            .bind(chain)
            .fetch_optional(pool)
            .await
            .wrap_err("Failed to get monitor cursor")?;

    Ok(row.map(|r| r.0))
}

/// Persist a chain monitor's position
pub async fn set_cursor(pool: &PgPool, chain: &str, cursor: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO monitor_cursors (chain, cursor)
        VALUES ($1, $2)
        ON CONFLICT (chain) DO UPDATE SET cursor = $2, updated_at = NOW()
        "#,
    )
    .bind(chain)
    .bind(cursor)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to set cursor for {}", chain))?;

    Ok(())
}
