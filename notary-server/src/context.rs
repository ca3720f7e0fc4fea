//! Per-nym client contexts and their edit handles
//!
//! A `ClientContext` is the notary's whole memory of one nym: the next
//! acceptable request number, the nym's issued and available transaction
//! numbers, the acknowledged-reply set and the current nymbox hash.
//!
//! Every context lives behind its own mutex. An `Editor` is the only way to
//! mutate one; it is acquired with a timeout and writes the context back to
//! storage when dropped, so at most one message per nym is ever in flight.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use notary_core::{Error, Identifier, NotaryId, NymId, RequestNumber, Result, Storage, TransactionNumberPool};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Notary-side state for one (notary, nym) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContext {
    notary_id: NotaryId,
    nym_id: NymId,
    request_number: RequestNumber,
    pool: TransactionNumberPool,
    acknowledged_replies: BTreeSet<RequestNumber>,
    nymbox_hash: Option<Identifier>,
    #[serde(skip)]
    retired: bool,
}

impl ClientContext {
    /// Fresh context on first contact
    pub fn new(notary_id: NotaryId, nym_id: NymId) -> Self {
        Self {
            notary_id,
            nym_id,
            request_number: 1,
            pool: TransactionNumberPool::new(),
            acknowledged_replies: BTreeSet::new(),
            nymbox_hash: None,
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

    /// Lowest request number the notary will accept next
    pub fn request_number(&self) -> RequestNumber {
        self.request_number
    }

    /// Accept a request number; replays are refused, gaps tolerated
    pub fn accept_request(&mut self, request_number: RequestNumber) -> Result<()> {
        if request_number < self.request_number {
            return Err(Error::Protocol(format!(
                "Request number {} already used, expected at least {}",
                request_number, self.request_number
            )));
        }
        self.request_number = request_number.checked_add(1).ok_or_else(|| {
            Error::Protocol(format!("Request number {} leaves no successor", request_number))
        })?;
        Ok(())
    }

    /// Transaction numbers held by the nym
    pub fn pool(&self) -> &TransactionNumberPool {
        &self.pool
    }

    /// Mutable transaction numbers
    pub fn pool_mut(&mut self) -> &mut TransactionNumberPool {
        &mut self.pool
    }

    /// Replies the nym last acknowledged
    pub fn acknowledged_replies(&self) -> &BTreeSet<RequestNumber> {
        &self.acknowledged_replies
    }

    /// Record the nym's acknowledged-reply set
    pub fn set_acknowledged_replies(&mut self, acknowledged: BTreeSet<RequestNumber>) {
        self.acknowledged_replies = acknowledged;
    }

    /// Current nymbox hash
    pub fn nymbox_hash(&self) -> Option<Identifier> {
        self.nymbox_hash
    }

    /// Record a new nymbox hash
    pub fn set_nymbox_hash(&mut self, hash: Identifier) {
        self.nymbox_hash = Some(hash);
    }
}

/// Exclusive, persisting handle on a client context
pub struct Editor {
    guard: ArcMutexGuard<RawMutex, ClientContext>,
    storage: Arc<Storage>,
    contexts: ContextMap,
}

impl Editor {
    /// Remove the context instead of saving it when the editor drops
    pub fn delete(&mut self) {
        self.guard.retired = true;
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("context", &*self.guard)
            .finish()
    }
}

impl Deref for Editor {
    type Target = ClientContext;

    fn deref(&self) -> &ClientContext {
        &self.guard
    }
}

impl DerefMut for Editor {
    fn deref_mut(&mut self) -> &mut ClientContext {
        &mut self.guard
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        let context = &*self.guard;
        let result = if context.retired {
            self.contexts.remove(&(context.notary_id, context.nym_id));
            self.storage.delete_context(&context.notary_id, &context.nym_id)
        } else {
            self.storage.put_context(&context.notary_id, &context.nym_id, context)
        };

        if let Err(e) = result {
            tracing::error!(nym_id = %context.nym_id, error = %e, "Failed to persist client context");
        }
    }
}

type ContextMap = Arc<DashMap<(NotaryId, NymId), Arc<Mutex<ClientContext>>>>;

/// All client contexts of one notary
pub struct ContextStore {
    notary_id: NotaryId,
    storage: Arc<Storage>,
    contexts: ContextMap,
    lock_timeout: Duration,
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("notary_id", &self.notary_id)
            .field("cached", &self.contexts.len())
            .finish()
    }
}

impl ContextStore {
    /// New store
    pub fn new(notary_id: NotaryId, storage: Arc<Storage>, lock_timeout: Duration) -> Self {
        Self {
            notary_id,
            storage,
            contexts: Arc::new(DashMap::new()),
            lock_timeout,
        }
    }

    fn lock(&self, slot: Arc<Mutex<ClientContext>>, nym_id: &NymId) -> Result<Editor> {
        let guard = slot.try_lock_arc_for(self.lock_timeout).ok_or_else(|| {
            tracing::error!(nym_id = %nym_id, "Timed out waiting for client context");
            Error::LockFailure(format!("Client context of {}", nym_id))
        })?;

        Ok(Editor {
            guard,
            storage: self.storage.clone(),
            contexts: self.contexts.clone(),
        })
    }

    /// Lock an existing context; `None` for nyms the notary has never seen
    pub fn edit(&self, nym_id: &NymId) -> Result<Option<Editor>> {
        let slot = match self.contexts.entry((self.notary_id, *nym_id)) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let stored: Option<ClientContext> = self.storage.get_context(&self.notary_id, nym_id)?;
                match stored {
                    Some(context) => entry.insert(Arc::new(Mutex::new(context))).clone(),
                    None => return Ok(None),
                }
            }
        };

        let editor = self.lock(slot, nym_id)?;
        if editor.retired {
            // Unregistered while we waited for the lock
            return Ok(None);
        }
        Ok(Some(editor))
    }

    /// Lock the context of a nym, creating it on first contact
    pub fn edit_or_create(&self, nym_id: &NymId) -> Result<Editor> {
        if let Some(editor) = self.edit(nym_id)? {
            return Ok(editor);
        }

        let slot = self
            .contexts
            .entry((self.notary_id, *nym_id))
            .or_insert_with(|| Arc::new(Mutex::new(ClientContext::new(self.notary_id, *nym_id))))
            .clone();

        tracing::info!(nym_id = %nym_id, "Created client context");
        self.lock(slot, nym_id)
    }
}
