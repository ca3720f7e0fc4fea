//! Server reply construction
//!
//! A `ReplyMessage` is created for every incoming request and commits when
//! it goes out of scope: the reply is signed, a reply notice carrying it is
//! dropped into the sender's nymbox when requested, and the nymbox hash is
//! stamped before the final signature. The committed reply is written to the
//! output slot handed to the constructor, so a reply can never be built
//! without also being signed.
//!
//! # Echo whitelist
//!
//! Most commands get the original request echoed back in `in_reference_to`
//! so clients can correlate replies that arrive late. A handful of bulky
//! queries strip the echo again once they succeed.

use crate::context::Editor;
use crate::notary::Notary;
use notary_core::{Armored, Message, MessageType, Result};
use serde::Serialize;

/// Commands whose request is echoed back in the reply
pub fn attaches_request(command: MessageType) -> bool {
    matches!(
        command,
        MessageType::GetMarketOffers
            | MessageType::GetMarketRecentTrades
            | MessageType::GetNymMarketOffers
            | MessageType::RegisterContract
            | MessageType::RegisterNym
            | MessageType::UnregisterNym
            | MessageType::CheckNym
            | MessageType::RegisterInstrumentDefinition
            | MessageType::QueryInstrumentDefinitions
            | MessageType::IssueBasket
            | MessageType::RegisterAccount
            | MessageType::GetBoxReceipt
            | MessageType::GetAccountData
            | MessageType::UnregisterAccount
            | MessageType::NotarizeTransaction
            | MessageType::GetNymbox
            | MessageType::GetInstrumentDefinition
            | MessageType::GetMint
            | MessageType::ProcessInbox
            | MessageType::ProcessNymbox
            | MessageType::TriggerClause
            | MessageType::GetMarketList
            | MessageType::RequestAdmin
            | MessageType::AddClaim
    )
}

/// Commands whose echo is stripped again on success
pub fn clears_request(command: MessageType) -> bool {
    matches!(
        command,
        MessageType::CheckNym
            | MessageType::GetNymbox
            | MessageType::GetAccountData
            | MessageType::GetInstrumentDefinition
            | MessageType::GetMint
            | MessageType::RegisterAccount
    )
}

/// Commands that always leave a reply notice in the nymbox
pub const NOTICE_COMMANDS: [MessageType; 5] = [
    MessageType::GetTransactionNumbers,
    MessageType::NotarizeTransaction,
    MessageType::ProcessInbox,
    MessageType::ProcessNymbox,
    MessageType::TriggerClause,
];

/// Reply under construction; commits on drop
pub struct ReplyMessage<'a> {
    notary: &'a Notary,
    original: &'a Message,
    output: &'a mut Option<Result<Message>>,
    message: Message,
    context: Option<Editor>,
    init: bool,
    drop: bool,
    drop_status: bool,
}

impl std::fmt::Debug for ReplyMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyMessage")
            .field("command", &self.message.command_name())
            .field("request_number", &self.message.request_number)
            .field("init", &self.init)
            .field("drop", &self.drop)
            .finish()
    }
}

impl<'a> ReplyMessage<'a> {
    /// Start a failed reply to `original`, validating the sender
    pub fn new(notary: &'a Notary, original: &'a Message, output: &'a mut Option<Result<Message>>) -> Self {
        let mut reply = Self {
            notary,
            original,
            output,
            message: Message::reply_to(original),
            context: None,
            init: false,
            drop: false,
            drop_status: false,
        };
        reply.attach_request();
        reply.init = reply.validate();
        reply
    }

    fn validate(&self) -> bool {
        let nym_id = &self.original.nym_id;

        if self.original.is_reply {
            tracing::warn!(nym_id = %nym_id, command = %self.original.command_name(), "Received a reply as a request");
            return false;
        }

        if self.notary.config().locked && self.notary.admin_nym() != Some(*nym_id) {
            tracing::warn!(nym_id = %nym_id, "Notary is locked; refusing request");
            return false;
        }

        if self.original.notary_id != *self.notary.notary_id() {
            tracing::warn!(
                nym_id = %nym_id,
                notary_id = %self.original.notary_id,
                "Request addressed to another notary"
            );
            return false;
        }

        if *nym_id == self.notary.nym_id() {
            tracing::error!("Client is using the notary's own signing nym");
            return false;
        }

        true
    }

    fn attach_request(&mut self) {
        if !attaches_request(self.original.command) {
            return;
        }
        match Armored::encode(self.original) {
            Ok(armored) => {
                tracing::trace!(command = %self.original.command, "Attaching original request");
                self.message.in_reference_to = armored;
            }
            Err(e) => tracing::error!(error = %e, "Failed to attach original request"),
        }
    }

    /// Strip the echoed request
    pub fn clear_request(&mut self) {
        self.message.in_reference_to = Armored::default();
    }

    /// Whether the sender passed validation
    pub fn init(&self) -> bool {
        self.init
    }

    /// Original request
    pub fn original(&self) -> &Message {
        self.original
    }

    /// Set the success flag; success strips the echo for whitelisted queries
    pub fn set_success(&mut self, success: bool) {
        self.message.success = success;
        if success && clears_request(self.original.command) {
            tracing::trace!(command = %self.original.command, "Clearing original request");
            self.clear_request();
        }
    }

    /// Success flag
    pub fn success(&self) -> bool {
        self.message.success
    }

    /// Armor a value into the main payload
    pub fn set_payload<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.message.payload = Armored::encode(value)?;
        Ok(())
    }

    /// Reply fields
    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Ask for a reply notice carrying this reply on commit
    pub fn drop_to_nymbox(&mut self, success: bool) {
        self.drop = true;
        self.drop_status = success;
    }

    /// Whether a reply notice will be dropped
    pub fn drops_notice(&self) -> bool {
        self.drop
    }

    /// Attach the sender's locked context
    pub fn set_context(&mut self, context: Editor) {
        self.context = Some(context);
    }

    /// Whether a context is attached
    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Sender's context
    pub fn context_mut(&mut self) -> Option<&mut Editor> {
        self.context.as_mut()
    }

    fn commit(&mut self) -> Result<Message> {
        let keys = self.notary.keys();
        self.message.sign(keys)?;

        if self.drop && self.context.is_some() {
            self.notary
                .drop_reply_notice(&self.message, self.original.request_number, self.drop_status)?;
        }

        if let Some(context) = self.context.as_mut() {
            let hash = self.notary.nymbox_hash(context.nym_id())?;
            context.set_nymbox_hash(hash);
            self.message.nymbox_hash = Some(hash);
            self.message.sign(keys)?;
        }

        Ok(self.message.clone())
    }
}

impl Drop for ReplyMessage<'_> {
    fn drop(&mut self) {
        let committed = self.commit();
        if let Err(e) = &committed {
            self.notary.metrics().record_commit_failure();
            tracing::error!(
                command = %self.message.command_name(),
                request_number = self.message.request_number,
                notice = self.drop,
                error = %e,
                "Failed to commit reply"
            );
        }
        *self.output = Some(committed);
    }
}
