//! Actor front end for the notary
//!
//! Transports hand requests to a `NotaryHandle`; a single task owns the
//! `Notary` and processes its mailbox. Per-nym serialisation is still
//! enforced by the context locks, so the actor only bounds the backlog.
//!
//! ```text
//! transport ──► NotaryHandle (Clone) ──► mpsc (bounded) ──► NotaryActor
//!                                                            │
//!                                                            ▼
//!                                                  Notary::process()
//! ```

use crate::notary::Notary;
use notary_core::{Error, Message, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the notary actor
#[derive(Debug)]
pub enum NotaryMessage {
    /// Process a request
    Process {
        /// Signed request
        message: Box<Message>,
        /// Signed reply
        response: oneshot::Sender<Result<Message>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the notary
#[derive(Debug)]
pub struct NotaryActor {
    notary: Arc<Notary>,
    mailbox: mpsc::Receiver<NotaryMessage>,
}

impl NotaryActor {
    /// Create new actor
    pub fn new(notary: Arc<Notary>, mailbox: mpsc::Receiver<NotaryMessage>) -> Self {
        Self { notary, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                NotaryMessage::Process { message, response } => {
                    let notary = self.notary.clone();
                    // Storage access blocks; keep it off the runtime threads
                    let result = tokio::task::spawn_blocking(move || notary.process(&message))
                        .await
                        .unwrap_or_else(|e| Err(Error::Concurrency(format!("Request task failed: {}", e))));
                    let _ = response.send(result);
                }
                NotaryMessage::Shutdown => break,
            }
        }

        tracing::info!(notary_id = %self.notary.notary_id(), "Notary actor stopped");
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct NotaryHandle {
    sender: mpsc::Sender<NotaryMessage>,
}

impl NotaryHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<NotaryMessage>) -> Self {
        Self { sender }
    }

    /// Process a request
    pub async fn process(&self, message: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotaryMessage::Process {
                message: Box::new(message),
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(NotaryMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the notary actor
pub fn spawn_notary_actor(notary: Arc<Notary>, mailbox_size: usize) -> NotaryHandle {
    let (tx, rx) = mpsc::channel(mailbox_size);
    let actor = NotaryActor::new(notary, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    NotaryHandle::new(tx)
}
