//! Message dispatcher
//!
//! Decoded application messages are queued here by connection handlers
//! and fanned out to every subscriber registered for the message name.

use crate::network::message::TaggedMessage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Default capacity of the dispatcher queue and subscriber channels
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A consumer of messages with particular names
#[derive(Clone, Debug)]
pub struct Subscriber {
    id: u64,
    msg_types: HashSet<String>,
    tx: mpsc::Sender<TaggedMessage>,
}

impl Subscriber {
    /// Create a subscriber for the given message names and the receiver
    /// its messages are delivered to
    pub fn new(msg_types: &[&str], capacity: usize) -> (Self, mpsc::Receiver<TaggedMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let subscriber = Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            msg_types: msg_types.iter().map(|s| s.to_string()).collect(),
            tx,
        };
        (subscriber, rx)
    }

    pub fn wants(&self, name: &str) -> bool {
        self.msg_types.contains(name)
    }
}

/// Fan-out of tagged messages to subscribers
pub struct Dispatcher {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    queue_tx: mpsc::Sender<TaggedMessage>,
    queue_rx: Mutex<Option<mpsc::Receiver<TaggedMessage>>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(queue_size: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size.max(1));
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn register(&self, subscribers: &[Subscriber]) {
        let mut subs = self.subscribers.write().await;
        for sub in subscribers {
            subs.insert(sub.id, sub.clone());
        }
    }

    pub async fn deregister(&self, subscribers: &[Subscriber]) {
        let mut subs = self.subscribers.write().await;
        for sub in subscribers {
            subs.remove(&sub.id);
        }
    }

    /// Queue a message for delivery. Drops it with a warning when the
    /// queue is full or the dispatcher has stopped.
    pub fn put_message(&self, msg: TaggedMessage) {
        if let Err(e) = self.queue_tx.try_send(msg) {
            log::warn!("Dispatcher dropped message: {}", e);
        }
    }

    /// Start delivering queued messages. Only the first call has an effect.
    pub async fn start(self: &Arc<Self>) {
        let mut rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                log::debug!("Dispatcher already started");
                return;
            }
        };

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            log::info!("Dispatcher started");
            loop {
                tokio::select! {
                    _ = dispatcher.shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => dispatcher.deliver(msg).await,
                        None => break,
                    },
                }
            }
            log::info!("Dispatcher stopped");
        });
    }

    async fn deliver(&self, msg: TaggedMessage) {
        let subs = self.subscribers.read().await;
        for sub in subs.values().filter(|s| s.wants(msg.name)) {
            if let Err(e) = sub.tx.try_send(msg.clone()) {
                log::warn!("Subscriber {} missed {} message: {}", sub.id, msg.name, e);
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Block;
    use crate::crypto::PeerId;
    use crate::network::message::{NetMessage, NEWBLOCK};
    use std::time::Duration;
    use tokio::time::timeout;

    fn block_message() -> TaggedMessage {
        let block = Block::new(1, String::new(), "data".to_string());
        TaggedMessage::new(PeerId::random(), NetMessage::NewBlock(block))
    }

    #[tokio::test]
    async fn test_delivers_to_matching_subscribers() {
        let dispatcher = Arc::new(Dispatcher::new(16));
        let (blocks, mut blocks_rx) = Subscriber::new(&[NEWBLOCK], 4);
        let (other, mut other_rx) = Subscriber::new(&["tx"], 4);
        dispatcher.register(&[blocks, other]).await;
        dispatcher.start().await;

        dispatcher.put_message(block_message());

        let got = timeout(Duration::from_secs(1), blocks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.name, NEWBLOCK);
        assert!(other_rx.try_recv().is_err());
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_deregister() {
        let dispatcher = Arc::new(Dispatcher::new(16));
        let (sub, mut rx) = Subscriber::new(&[NEWBLOCK], 4);
        dispatcher.register(std::slice::from_ref(&sub)).await;
        dispatcher.deregister(&[sub]).await;
        dispatcher.start().await;

        dispatcher.put_message(block_message());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queued_before_start() {
        let dispatcher = Arc::new(Dispatcher::new(16));
        let (sub, mut rx) = Subscriber::new(&[NEWBLOCK], 4);
        dispatcher.register(&[sub]).await;

        dispatcher.put_message(block_message());
        dispatcher.start().await;

        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_some());
    }
}
