//! Message Bus Module
//!
//! Bounded pub/sub between channels and the agent core. Inbound messages flow
//! from channels to the agent; outbound messages flow back.
//!
//! Publishing never blocks: when a buffer is full the message is dropped and
//! logged. Consuming blocks until a message arrives, the caller's cancellation
//! token fires, or the bus is closed. `close()` is idempotent; publishes after
//! close are silent no-ops.

pub mod message;

pub use message::{InboundMessage, OutboundMessage, SYSTEM_CHANNEL};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default buffer size for message channels.
const DEFAULT_BUFFER_SIZE: usize = 100;

/// The central message bus for routing messages between channels and agents.
///
/// Both directions use bounded tokio MPSC queues. Receivers are wrapped in
/// `Arc<Mutex<..>>` so clones of the bus share the same streams.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    closed: Arc<AtomicBool>,
    done: CancellationToken,
}

impl MessageBus {
    /// Create a new bus with the default buffer size (100 per direction).
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new bus with a custom buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);

        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            closed: Arc::new(AtomicBool::new(false)),
            done: CancellationToken::new(),
        }
    }

    /// Publish an inbound message. Non-blocking: drops and warns when the
    /// buffer is full; silently ignores the message after `close()`.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(msg)) = self.inbound_tx.try_send(msg) {
            warn!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                "inbound buffer full, dropping message"
            );
        }
    }

    /// Publish an outbound message. Same semantics as [`publish_inbound`].
    ///
    /// [`publish_inbound`]: MessageBus::publish_inbound
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(msg)) = self.outbound_tx.try_send(msg) {
            warn!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                "outbound buffer full, dropping message"
            );
        }
    }

    /// Consume the next inbound message.
    ///
    /// Returns `None` when the bus is closed or `cancel` fires first.
    pub async fn consume_inbound(&self, cancel: &CancellationToken) -> Option<InboundMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            _ = self.done.cancelled() => None,
            _ = cancel.cancelled() => None,
        }
    }

    /// Consume the next outbound message (channel adapters call this).
    ///
    /// Returns `None` when the bus is closed or `cancel` fires first.
    pub async fn subscribe_outbound(&self, cancel: &CancellationToken) -> Option<OutboundMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            _ = self.done.cancelled() => None,
            _ = cancel.cancelled() => None,
        }
    }

    /// Close the bus. Idempotent: repeated calls have the same effect as one.
    /// Future consumes return `None`; future publishes are dropped silently.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.done.cancel();
        }
    }

    /// Whether the bus has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MessageBus {
    /// Clones share the same underlying channels and closed state.
    fn clone(&self) -> Self {
        Self {
            inbound_tx: self.inbound_tx.clone(),
            inbound_rx: Arc::clone(&self.inbound_rx),
            outbound_tx: self.outbound_tx.clone(),
            outbound_rx: Arc::clone(&self.outbound_rx),
            closed: Arc::clone(&self.closed),
            done: self.done.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_inbound_flow() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        bus.publish_inbound(InboundMessage::new("telegram", "user123", "chat456", "Hello"));
        let received = bus.consume_inbound(&cancel).await.unwrap();

        assert_eq!(received.content, "Hello");
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.session_key, "telegram:chat456");
    }

    #[tokio::test]
    async fn test_bus_outbound_flow() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        bus.publish_outbound(OutboundMessage::new("telegram", "chat456", "Response"));
        let received = bus.subscribe_outbound(&cancel).await.unwrap();

        assert_eq!(received.content, "Response");
        assert_eq!(received.chat_id, "chat456");
    }

    #[tokio::test]
    async fn test_bus_fifo_per_publisher() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        for i in 0..5 {
            bus.publish_inbound(InboundMessage::new("t", "u", "c", &format!("Message {}", i)));
        }
        for i in 0..5 {
            let received = bus.consume_inbound(&cancel).await.unwrap();
            assert_eq!(received.content, format!("Message {}", i));
        }
    }

    #[tokio::test]
    async fn test_publish_full_buffer_drops() {
        let bus = MessageBus::with_buffer_size(2);
        let cancel = CancellationToken::new();

        for i in 0..4 {
            bus.publish_inbound(InboundMessage::new("t", "u", "c", &format!("m{}", i)));
        }

        // Only the first two fit; the rest were dropped without blocking.
        assert_eq!(bus.consume_inbound(&cancel).await.unwrap().content, "m0");
        assert_eq!(bus.consume_inbound(&cancel).await.unwrap().content, "m1");
    }

    #[tokio::test]
    async fn test_consume_cancelled() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(bus.consume_inbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = MessageBus::new();
        bus.close();
        bus.close();
        bus.close();

        assert!(bus.is_closed());

        let cancel = CancellationToken::new();
        assert!(bus.consume_inbound(&cancel).await.is_none());
        assert!(bus.subscribe_outbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_is_noop() {
        let bus = MessageBus::new();
        bus.close();

        // Must not panic or block.
        bus.publish_inbound(InboundMessage::new("t", "u", "c", "dropped"));
        bus.publish_outbound(OutboundMessage::new("t", "c", "dropped"));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_consume() {
        let bus = Arc::new(MessageBus::new());
        let bus2 = Arc::clone(&bus);
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(async move { bus2.consume_inbound(&cancel).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.close();

        let result = tokio::time::timeout(std::time::Duration::from_millis(500), consumer)
            .await
            .expect("consumer should unblock on close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_bus_clone_shares_state() {
        let bus1 = MessageBus::new();
        let bus2 = bus1.clone();
        let cancel = CancellationToken::new();

        bus1.publish_inbound(InboundMessage::new("t", "u", "c", "shared"));
        assert_eq!(bus2.consume_inbound(&cancel).await.unwrap().content, "shared");

        bus2.close();
        assert!(bus1.is_closed());
    }

    #[tokio::test]
    async fn test_bus_concurrent_access() {
        let bus = Arc::new(MessageBus::new());
        let producer_bus = Arc::clone(&bus);

        let producer = tokio::spawn(async move {
            for i in 0..10 {
                producer_bus.publish_inbound(InboundMessage::new("t", "u", "c", &format!("Msg {}", i)));
            }
        });

        let consumer_bus = Arc::clone(&bus);
        let consumer = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut count = 0;
            while count < 10 {
                if consumer_bus.consume_inbound(&cancel).await.is_some() {
                    count += 1;
                }
            }
            count
        });

        producer.await.unwrap();
        assert_eq!(consumer.await.unwrap(), 10);
    }
}
