//! Notary Server
//!
//! Server side of the notary protocol: authenticates signed requests,
//! sequences them per nym, applies transactions against the transaction
//! number pools and boxes, and answers with signed replies. Replies to
//! number-bearing commands are also dropped into the requester's nymbox so
//! a lost reply can always be recovered.
//!
//! # Architecture
//!
//! - **Notary**: request pipeline and box bookkeeping
//! - **ReplyMessage**: reply under construction, signed and committed on drop
//! - **ContextStore**: per-nym contexts behind timed locks
//! - **Handlers**: one per command, behind a dispatch table
//! - **Actor**: tokio front end for transports

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod context;
pub mod handlers;
pub mod notary;
pub mod reply;
mod transactions;

pub use actor::{spawn_notary_actor, NotaryHandle, NotaryMessage};
pub use config::NotaryConfig;
pub use context::{ClientContext, ContextStore, Editor};
pub use handlers::CommandHandler;
pub use notary::Notary;
pub use reply::ReplyMessage;
