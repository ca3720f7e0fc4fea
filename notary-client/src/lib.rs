//! Notary Client
//!
//! Client side of the notary protocol: builds signed requests, keeps a
//! per-notary context for each nym and reconciles every reply with local
//! state. Lost replies are recovered from reply notices in the nymbox;
//! requests the notary provably never saw are flushed and their
//! transaction numbers harvested.
//!
//! # Architecture
//!
//! - **Client**: request construction and reply reconciliation
//! - **ServerContexts**: per (notary, nym) contexts behind timed locks
//! - **SentMessages / ReceivedReplies**: request and reply buffers
//! - **Harvest**: transaction-number recovery rules
//! - **Handlers**: one per reply type, behind a dispatch table

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod handlers;
pub mod harvest;

pub use buffer::{ReceivedReplies, SentMessages};
pub use client::{Client, UserCommand};
pub use config::ClientConfig;
pub use context::{ContextGuard, ServerContext, ServerContexts};
pub use handlers::{Exchange, ReplyHandler};
pub use harvest::{harvest_transaction_numbers, harvest_unsent_cron_item, HarvestFlags, Harvested};
