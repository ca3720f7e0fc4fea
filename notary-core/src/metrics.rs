//! Metrics collection for observability
//!
//! Prometheus counters for the transaction-number lifecycle and the reply
//! reconciliation protocol. Each `Metrics` owns its own registry.
//!
//! # Metrics
//!
//! - `notary_numbers_issued_total` - Numbers issued to nyms
//! - `notary_numbers_reserved_total` - Numbers reserved for outgoing instruments
//! - `notary_numbers_harvested_total` - Numbers returned to the available set
//! - `notary_numbers_closed_total` - Numbers removed from the issued set
//! - `notary_replies_processed_total` - Replies constructed or reconciled
//! - `notary_reply_notices_dropped_total` - Reply notices placed into nymboxes
//! - `notary_messages_flushed_total` - Sent messages flushed after a nymbox download
//! - `notary_reply_commit_failures_total` - Replies that could not be signed or stored

use prometheus::{IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Numbers issued
    pub numbers_issued: IntCounter,

    /// Numbers reserved
    pub numbers_reserved: IntCounter,

    /// Numbers harvested
    pub numbers_harvested: IntCounter,

    /// Numbers closed
    pub numbers_closed: IntCounter,

    /// Replies processed
    pub replies_processed: IntCounter,

    /// Reply notices dropped
    pub notices_dropped: IntCounter,

    /// Sent messages flushed
    pub messages_flushed: IntCounter,

    /// Replies that failed to commit
    pub commit_failures: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            numbers_issued: counter(&registry, "notary_numbers_issued_total", "Numbers issued to nyms")?,
            numbers_reserved: counter(
                &registry,
                "notary_numbers_reserved_total",
                "Numbers reserved for outgoing instruments",
            )?,
            numbers_harvested: counter(
                &registry,
                "notary_numbers_harvested_total",
                "Numbers returned to the available set",
            )?,
            numbers_closed: counter(
                &registry,
                "notary_numbers_closed_total",
                "Numbers removed from the issued set",
            )?,
            replies_processed: counter(
                &registry,
                "notary_replies_processed_total",
                "Replies constructed or reconciled",
            )?,
            notices_dropped: counter(
                &registry,
                "notary_reply_notices_dropped_total",
                "Reply notices placed into nymboxes",
            )?,
            messages_flushed: counter(
                &registry,
                "notary_messages_flushed_total",
                "Sent messages flushed after a nymbox download",
            )?,
            commit_failures: counter(
                &registry,
                "notary_reply_commit_failures_total",
                "Replies that could not be signed or stored",
            )?,
            registry: Arc::new(registry),
        })
    }

    /// Record issued numbers
    pub fn record_issued(&self, count: usize) {
        self.numbers_issued.inc_by(count as u64);
    }

    /// Record reserved numbers
    pub fn record_reserved(&self, count: usize) {
        self.numbers_reserved.inc_by(count as u64);
    }

    /// Record harvested numbers
    pub fn record_harvested(&self, count: usize) {
        self.numbers_harvested.inc_by(count as u64);
    }

    /// Record a closed number
    pub fn record_closed(&self) {
        self.numbers_closed.inc();
    }

    /// Record a processed reply
    pub fn record_reply(&self) {
        self.replies_processed.inc();
    }

    /// Record a dropped reply notice
    pub fn record_notice_dropped(&self) {
        self.notices_dropped.inc();
    }

    /// Record a flushed sent message
    pub fn record_flushed(&self) {
        self.messages_flushed.inc();
    }

    /// Record a reply that failed to commit
    pub fn record_commit_failure(&self) {
        self.commit_failures.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
