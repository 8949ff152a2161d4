use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Note: amount fields are String to avoid BigDecimal/sqlx version conflicts.
// The database stores amounts as NUMERIC(78,0). When inserting, the text
// value is cast in the SQL query ($1::NUMERIC); when reading, columns are
// selected with ::TEXT.

/// One cross-chain transfer tracked by the pipeline, keyed by msg_id.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub msg_id: String,
    pub key_version: i32,
    pub version: i16,
    pub dir: i16,
    pub src_chain_id: String,
    pub dst_chain_id: String,
    pub src_tx_id: String,
    pub origin_token: String,
    pub amount: String,
    pub recipient: String,
    pub nonce: String,
    pub expiry: i64,
    pub status: String,
    pub sig_v: Option<i32>,
    pub sig_r: Option<String>,
    pub sig_s: Option<String>,
    pub dest_token: Option<String>,
    pub dest_amount: Option<String>,
    pub transfer_tx: Option<String>,
    pub settle_tx: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting newly detected requests
#[derive(Debug, Clone)]
pub struct NewBridgeRequest {
    pub msg_id: String,
    pub key_version: i32,
    pub version: i16,
    pub dir: i16,
    pub src_chain_id: String,
    pub dst_chain_id: String,
    pub src_tx_id: String,
    pub origin_token: String,
    pub amount: String,
    pub recipient: String,
    pub nonce: String,
    pub expiry: i64,
}

/// A solver's claim on a solver-mediated request
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Claim {
    pub msg_id: String,
    pub solver: String,
    pub bond: String,
    pub claimed_at: i64,
    pub deadline: i64,
    pub released: bool,
    pub created_at: DateTime<Utc>,
}
