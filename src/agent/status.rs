//! Periodic "still working" status pings for long tool batches.
//!
//! The notifier publishes a fixed, generic phrase to the origin chat every
//! `delay` until stopped. Tool names never appear in the outbound text; they
//! are internal and only show up in debug logs. All operations are safe
//! under concurrent use and `stop()` is idempotent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{MessageBus, OutboundMessage};

const STATUS_MESSAGE: &str = "Still working on it...";

/// Publishes periodic progress pings while a tool batch runs.
pub struct StatusNotifier {
    bus: MessageBus,
    channel: String,
    chat_id: String,
    delay: Duration,
    label: Arc<Mutex<String>>,
    reset: Arc<Notify>,
    stop: CancellationToken,
}

impl StatusNotifier {
    /// Create a notifier for one channel/chat pair.
    pub fn new(bus: MessageBus, channel: &str, chat_id: &str, delay: Duration) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            delay,
            label: Arc::new(Mutex::new(String::new())),
            reset: Arc::new(Notify::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Begin the timer with an initial label. The label is only logged,
    /// never sent.
    pub fn start(&self, label: &str) {
        *self.label.lock().expect("label lock") = label.to_string();

        let bus = self.bus.clone();
        let channel = self.channel.clone();
        let chat_id = self.chat_id.clone();
        let delay = self.delay;
        let label = Arc::clone(&self.label);
        let reset = Arc::clone(&self.reset);
        let stop = self.stop.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = reset.notified() => continue,
                    _ = tokio::time::sleep(delay) => {
                        let label = label.lock().expect("label lock").clone();
                        debug!(
                            label = %label,
                            channel = %channel,
                            chat_id = %chat_id,
                            "sending status ping"
                        );
                        bus.publish_outbound(OutboundMessage::new(&channel, &chat_id, STATUS_MESSAGE));
                    }
                }
            }
        });
    }

    /// Update the label and restart the current wait.
    pub fn reset(&self, label: &str) {
        if self.stop.is_cancelled() {
            return;
        }
        *self.label.lock().expect("label lock") = label.to_string();
        self.reset.notify_one();
    }

    /// Stop the notifier. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for StatusNotifier {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
