//! Single writer task
//!
//! Every insertion, from the admission API or from peer sync, goes through
//! one bounded queue drained by one task. Producers wait when the queue is
//! full. Each insertion is published on a broadcast channel so the sync
//! engine can announce it.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AddOutcome, Leaf, LeafStore};
use crate::error::StoreError;
use crate::message::Message;

const EVENT_BUFFER: usize = 1024;

/// A freshly inserted leaf and the peer it came from, if any.
#[derive(Debug, Clone)]
pub struct InsertedLeaf {
    pub leaf: Leaf,
    /// Peer that delivered the message; `None` for local admission.
    pub source: Option<String>,
}

struct AddRequest {
    message: Message,
    source: Option<String>,
    reply: oneshot::Sender<Result<AddOutcome, StoreError>>,
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<AddRequest>,
    events: broadcast::Sender<InsertedLeaf>,
    store: Arc<LeafStore>,
}

impl WriterHandle {
    /// Queue `message` for insertion and wait for the outcome.
    pub async fn add(
        &self,
        message: Message,
        source: Option<String>,
    ) -> Result<AddOutcome, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AddRequest {
                message,
                source,
                reply,
            })
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Receive every leaf inserted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InsertedLeaf> {
        self.events.subscribe()
    }

    /// Read access to the store behind this writer.
    pub fn store(&self) -> &Arc<LeafStore> {
        &self.store
    }
}

/// Start the writer task over `store` with a queue of `capacity` requests.
pub fn spawn_writer(store: Arc<LeafStore>, capacity: usize) -> (WriterHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AddRequest>(capacity.max(1));
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let handle = WriterHandle {
        tx,
        events: events.clone(),
        store: store.clone(),
    };

    let task = tokio::spawn(async move {
        info!(capacity, "Store writer started");
        while let Some(request) = rx.recv().await {
            let result = store.add(request.message);
            match &result {
                Ok(AddOutcome::Inserted(leaf)) => {
                    // No subscribers is fine.
                    let _ = events.send(InsertedLeaf {
                        leaf: leaf.clone(),
                        source: request.source,
                    });
                }
                Ok(AddOutcome::AlreadyPresent(hash)) => {
                    debug!(%hash, "Already present");
                }
                Err(e) => {
                    warn!(error = %e, "Store insert failed");
                }
            }
            let _ = request.reply.send(result);
        }
        info!("Store writer stopped");
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn submission(key: &SigningKey, n: u64) -> Message {
        Message::sign(
            key,
            MessageBody::Submission {
                href: format!("https://example.com/{}", n),
                title: "t".into(),
            },
            n,
        )
    }

    #[tokio::test]
    async fn test_insert_is_published_once() {
        let store = Arc::new(LeafStore::in_memory());
        let (writer, _task) = spawn_writer(store.clone(), 4);
        let mut events = writer.subscribe();
        let key = SigningKey::generate(&mut OsRng);
        let msg = submission(&key, 1);

        let first = writer.add(msg.clone(), Some("peer-a".into())).await.unwrap();
        assert!(matches!(first, AddOutcome::Inserted(_)));
        let again = writer.add(msg.clone(), None).await.unwrap();
        assert!(matches!(again, AddOutcome::AlreadyPresent(_)));

        let event = events.recv().await.unwrap();
        assert_eq!(event.leaf.hash, msg.content_hash());
        assert_eq!(event.source.as_deref(), Some("peer-a"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_producers_all_land() {
        let store = Arc::new(LeafStore::in_memory());
        let (writer, _task) = spawn_writer(store.clone(), 2);
        let key = SigningKey::generate(&mut OsRng);

        let mut tasks = Vec::new();
        for n in 0..32 {
            let writer = writer.clone();
            let msg = submission(&key, n);
            tasks.push(tokio::spawn(async move { writer.add(msg, None).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.len(), 32);
        let seqs: Vec<u64> = store.snapshot().iter().map(|l| l.seq).collect();
        assert_eq!(seqs, (1..=32).collect::<Vec<_>>());
    }
}
