//! Prometheus metrics for the Veil relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Intake metrics
    pub static ref INTENTS_OBSERVED: CounterVec = register_counter_vec!(
        "veil_relayer_intents_observed_total",
        "Total number of encrypted intent events observed",
        &["chain"]
    ).unwrap();

    pub static ref DECRYPT_FAILURES: CounterVec = register_counter_vec!(
        "veil_relayer_decrypt_failures_total",
        "Total number of envelope decode/decrypt failures",
        &["chain", "reason"]
    ).unwrap();

    // Claim metrics
    pub static ref CLAIMS_ACCEPTED: Counter = register_counter!(
        "veil_relayer_claims_accepted_total",
        "Total number of solver claims accepted"
    ).unwrap();

    pub static ref CLAIMS_REJECTED: CounterVec = register_counter_vec!(
        "veil_relayer_claims_rejected_total",
        "Total number of solver claims rejected",
        &["reason"]
    ).unwrap();

    // Settlement metrics
    pub static ref PAYOUTS_SUBMITTED: Counter = register_counter!(
        "veil_relayer_payouts_submitted_total",
        "Total number of payout transactions confirmed"
    ).unwrap();

    pub static ref SETTLEMENTS_SUBMITTED: Counter = register_counter!(
        "veil_relayer_settlements_submitted_total",
        "Total number of verifyAndSettle transactions confirmed"
    ).unwrap();

    pub static ref SLASHES: Counter = register_counter!(
        "veil_relayer_slashes_total",
        "Total number of expired claims slashed"
    ).unwrap();

    // Processing latency
    pub static ref PROCESSING_LATENCY: HistogramVec = register_histogram_vec!(
        "veil_relayer_processing_latency_seconds",
        "Time to process a request from detection to verified",
        &["dir"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // State counts (refreshed by the API layer)
    pub static ref REQUESTS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "veil_relayer_requests",
        "Number of requests per pipeline status",
        &["status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "veil_relayer_errors_total",
        "Total number of errors",
        &["component", "class"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "veil_relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "veil_relayer_last_successful_poll_timestamp",
        "Unix timestamp of last successful monitor poll",
        &["chain"]
    ).unwrap();
}

/// Record an observed intent event
pub fn record_intent_observed(chain: &str) {
    INTENTS_OBSERVED.with_label_values(&[chain]).inc();
}

/// Record a failed envelope decode/decrypt
pub fn record_decrypt_failure(chain: &str, reason: &str) {
    DECRYPT_FAILURES.with_label_values(&[chain, reason]).inc();
}

/// Record an accepted solver claim
pub fn record_claim_accepted() {
    CLAIMS_ACCEPTED.inc();
}

/// Record a rejected solver claim
pub fn record_claim_rejected(reason: &str) {
    CLAIMS_REJECTED.with_label_values(&[reason]).inc();
}

/// Record a confirmed payout
pub fn record_payout_submitted() {
    PAYOUTS_SUBMITTED.inc();
}

/// Record a confirmed settlement
pub fn record_settlement_submitted() {
    SETTLEMENTS_SUBMITTED.inc();
}

/// Record a slashed claim
pub fn record_slash() {
    SLASHES.inc();
}

/// Record end-to-end processing latency
pub fn record_latency(dir: &str, seconds: f64) {
    PROCESSING_LATENCY.with_label_values(&[dir]).observe(seconds);
}

/// Update the per-status request gauge
pub fn set_requests_by_status(status: &str, count: i64) {
    REQUESTS_BY_STATUS
        .with_label_values(&[status])
        .set(count as f64);
}

/// Record an error
pub fn record_error(component: &str, class: &str) {
    ERRORS.with_label_values(&[component, class]).inc();
}

/// Record last successful poll
pub fn record_successful_poll(chain: &str) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[chain])
        .set(timestamp);
}
