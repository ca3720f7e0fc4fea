//! Client-side context for one (notary, nym) pair
//!
//! A `ServerContext` is everything the client remembers about its
//! conversation with one notary as one nym: the next request number, the
//! transaction-number pool, the replies it has seen but not yet had
//! acknowledged, both nymbox hashes and the cron items it has signed but
//! not yet seen activated.
//!
//! Contexts are locked per pair. A `ContextGuard` persists its context when
//! dropped, so every reservation or harvest is on disk before the next
//! message can be built.

use dashmap::DashMap;
use notary_core::{
    CronItem, Error, Identifier, NotaryId, NymId, RequestNumber, Result, Storage,
    TransactionNumber, TransactionNumberPool,
};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Client state for one (notary, nym) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    notary_id: NotaryId,
    nym_id: NymId,
    request_number: RequestNumber,
    pool: TransactionNumberPool,
    seen_replies: BTreeSet<RequestNumber>,
    local_nymbox_hash: Option<Identifier>,
    server_nymbox_hash: Option<Identifier>,
    flush_permission: Option<RequestNumber>,
    unsent_cron_items: BTreeMap<TransactionNumber, CronItem>,
    #[serde(skip)]
    retired: bool,
}

impl ServerContext {
    /// Fresh context
    pub fn new(notary_id: NotaryId, nym_id: NymId) -> Self {
        Self {
            notary_id,
            nym_id,
            request_number: 1,
            pool: TransactionNumberPool::new(),
            seen_replies: BTreeSet::new(),
            local_nymbox_hash: None,
            server_nymbox_hash: None,
            flush_permission: None,
            unsent_cron_items: BTreeMap::new(),
            retired: false,
        }
    }

    /// Notary
    pub fn notary_id(&self) -> &NotaryId {
        &self.notary_id
    }

    /// Nym
    pub fn nym_id(&self) -> &NymId {
        &self.nym_id
    }

    /// Request number the next buffered message will carry
    pub fn request_number(&self) -> RequestNumber {
        self.request_number
    }

    /// Take the current request number and advance
    pub fn next_request_number(&mut self) -> Result<RequestNumber> {
        let current = self.request_number;
        self.request_number = self.following_request_number()?;
        Ok(current)
    }

    /// Request number after the current one
    pub fn following_request_number(&self) -> Result<RequestNumber> {
        self.request_number
            .checked_add(1)
            .ok_or_else(|| Error::Protocol(format!("Request numbers exhausted for {}", self.nym_id)))
    }

    /// Adopt the notary's request number if it is ahead of ours
    pub fn update_request_number(&mut self, server: RequestNumber) -> RequestNumber {
        if server > self.request_number {
            tracing::info!(
                nym_id = %self.nym_id,
                local = self.request_number,
                server,
                "Request number resynchronised"
            );
            self.request_number = server;
        }
        self.request_number
    }

    /// Transaction numbers
    pub fn pool(&self) -> &TransactionNumberPool {
        &self.pool
    }

    /// Mutable transaction numbers
    pub fn pool_mut(&mut self) -> &mut TransactionNumberPool {
        &mut self.pool
    }

    /// Replies processed but not yet acknowledged back by the notary
    pub fn seen_replies(&self) -> &BTreeSet<RequestNumber> {
        &self.seen_replies
    }

    /// Record a processed reply
    pub fn add_seen_reply(&mut self, request_number: RequestNumber) -> bool {
        self.seen_replies.insert(request_number)
    }

    /// Whether a reply was already processed
    pub fn has_seen_reply(&self, request_number: RequestNumber) -> bool {
        self.seen_replies.contains(&request_number)
    }

    /// Forget replies the notary has confirmed it knows we saw
    pub fn remove_acknowledged(&mut self, mirrored: &BTreeSet<RequestNumber>) {
        self.seen_replies.retain(|request_number| !mirrored.contains(request_number));
    }

    /// Hash of the nymbox as last downloaded
    pub fn local_nymbox_hash(&self) -> Option<Identifier> {
        self.local_nymbox_hash
    }

    /// Record a downloaded nymbox
    pub fn set_local_nymbox_hash(&mut self, hash: Identifier) {
        self.local_nymbox_hash = Some(hash);
    }

    /// Hash of the nymbox as last reported by the notary
    pub fn server_nymbox_hash(&self) -> Option<Identifier> {
        self.server_nymbox_hash
    }

    /// Record the hash carried by a reply
    pub fn set_server_nymbox_hash(&mut self, hash: Identifier) {
        self.server_nymbox_hash = Some(hash);
    }

    /// Whether the notary's nymbox changed since the last download
    pub fn nymbox_is_stale(&self) -> bool {
        match (self.local_nymbox_hash, self.server_nymbox_hash) {
            (Some(local), Some(server)) => local != server,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }

    /// Permit one flush of messages sent before `request_number`
    pub fn allow_flush(&mut self, request_number: RequestNumber) {
        self.flush_permission = Some(request_number);
    }

    /// Consume the flush permission
    pub fn take_flush_permission(&mut self) -> Option<RequestNumber> {
        self.flush_permission.take()
    }

    /// Keep a signed cron item under this nym's own opening number
    pub fn add_unsent_cron_item(&mut self, opening_number: TransactionNumber, item: CronItem) {
        self.unsent_cron_items.insert(opening_number, item);
    }

    /// Signed cron item awaiting activation
    pub fn unsent_cron_item(&self, opening_number: TransactionNumber) -> Option<&CronItem> {
        self.unsent_cron_items.get(&opening_number)
    }

    /// Stop tracking a cron item
    pub fn remove_unsent_cron_item(&mut self, opening_number: TransactionNumber) -> Option<CronItem> {
        self.unsent_cron_items.remove(&opening_number)
    }

    /// Opening numbers of all tracked cron items
    pub fn unsent_cron_items(&self) -> impl Iterator<Item = TransactionNumber> + '_ {
        self.unsent_cron_items.keys().copied()
    }

    /// Whether the pool ran below the low-water mark
    pub fn needs_numbers(&self, low_water_mark: usize) -> bool {
        self.pool.count() < low_water_mark
    }
}

/// Exclusive, persisting handle on a server context
pub struct ContextGuard {
    guard: ArcMutexGuard<RawMutex, ServerContext>,
    storage: Arc<Storage>,
    contexts: ContextMap,
}

impl ContextGuard {
    /// Remove the context instead of saving it when the guard drops
    pub fn delete(&mut self) {
        self.guard.retired = true;
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("context", &*self.guard)
            .finish()
    }
}

impl Deref for ContextGuard {
    type Target = ServerContext;

    fn deref(&self) -> &ServerContext {
        &self.guard
    }
}

impl DerefMut for ContextGuard {
    fn deref_mut(&mut self) -> &mut ServerContext {
        &mut self.guard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let context = &*self.guard;
        let result = if context.retired {
            self.contexts.remove(&(context.notary_id, context.nym_id));
            self.storage.delete_context(&context.notary_id, &context.nym_id)
        } else {
            self.storage.put_context(&context.notary_id, &context.nym_id, context)
        };

        if let Err(e) = result {
            tracing::error!(nym_id = %context.nym_id, error = %e, "Failed to persist server context");
        }
    }
}

type ContextMap = Arc<DashMap<(NotaryId, NymId), Arc<Mutex<ServerContext>>>>;

/// Server contexts of every (notary, nym) pair this client uses
pub struct ServerContexts {
    storage: Arc<Storage>,
    contexts: ContextMap,
    lock_timeout: Duration,
}

impl std::fmt::Debug for ServerContexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContexts")
            .field("cached", &self.contexts.len())
            .finish()
    }
}

impl ServerContexts {
    /// New store
    pub fn new(storage: Arc<Storage>, lock_timeout: Duration) -> Self {
        Self {
            storage,
            contexts: Arc::new(DashMap::new()),
            lock_timeout,
        }
    }

    /// Lock the context of a pair, loading or creating it
    pub fn lock(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<ContextGuard> {
        let slot = match self.contexts.get(&(*notary_id, *nym_id)) {
            Some(slot) => slot.clone(),
            None => {
                let stored: Option<ServerContext> = self.storage.get_context(notary_id, nym_id)?;
                let context = stored.unwrap_or_else(|| ServerContext::new(*notary_id, *nym_id));
                self.contexts
                    .entry((*notary_id, *nym_id))
                    .or_insert_with(|| Arc::new(Mutex::new(context)))
                    .clone()
            }
        };

        let guard = slot.try_lock_arc_for(self.lock_timeout).ok_or_else(|| {
            tracing::error!(nym_id = %nym_id, notary_id = %notary_id, "Timed out waiting for server context");
            Error::LockFailure(format!("Server context of {} at {}", nym_id, notary_id))
        })?;

        Ok(ContextGuard {
            guard,
            storage: self.storage.clone(),
            contexts: self.contexts.clone(),
        })
    }

    /// Copy of a pair's context
    pub fn snapshot(&self, notary_id: &NotaryId, nym_id: &NymId) -> Result<ServerContext> {
        let guard = self.lock(notary_id, nym_id)?;
        Ok((*guard).clone())
    }
}
