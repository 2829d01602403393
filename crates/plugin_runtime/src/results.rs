//! Result Channel
//!
//! FIFO of finished plugin results. Worker threads push; the dispatcher is the
//! only consumer and drains it from its own task, which keeps every transport
//! write on one writer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use plugin_types::PluginResult;

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<PluginResult>>,
    notify: Notify,
}

/// Cloneable handle to the shared result queue
#[derive(Clone, Default)]
pub struct ResultChannel {
    inner: Arc<Inner>,
}

impl ResultChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a finished result and wake the consumer
    ///
    /// Safe to call from any thread, including ones without a tokio runtime.
    pub fn push(&self, result: PluginResult) {
        self.inner.queue.lock().push_back(result);
        self.inner.notify.notify_one();
    }

    /// Take everything queued so far, oldest first
    ///
    /// Draining an empty channel returns an empty vector.
    pub fn drain(&self) -> Vec<PluginResult> {
        self.inner.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Wait until something is pushed
    ///
    /// A push that happened while nobody was waiting is remembered, so a
    /// consumer that checks `notified()` after a push still wakes.
    pub async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_types::{ExecutionId, PluginOutcome};
    use std::time::Duration;

    fn result(n: usize) -> PluginResult {
        PluginResult::new(
            "echo",
            ExecutionId::from(format!("echo_{}", n)),
            "general",
            PluginOutcome::Completed(format!("r{}", n)),
        )
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let channel = ResultChannel::new();
        assert!(channel.drain().is_empty());
        assert!(channel.drain().is_empty());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let channel = ResultChannel::new();
        for n in 0..3 {
            channel.push(result(n));
        }
        assert_eq!(channel.len(), 3);

        let drained: Vec<String> = channel
            .drain()
            .into_iter()
            .map(|r| r.outcome.payload().to_string())
            .collect();
        assert_eq!(drained, vec!["r0", "r1", "r2"]);
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_push_from_plain_thread_wakes_consumer() {
        let channel = ResultChannel::new();
        let producer = channel.clone();

        std::thread::spawn(move || producer.push(result(1)));

        tokio::time::timeout(Duration::from_secs(2), channel.notified())
            .await
            .unwrap();
        assert_eq!(channel.drain().len(), 1);
    }

    #[test]
    fn test_push_before_wait_is_not_lost() {
        let channel = ResultChannel::new();
        channel.push(result(7));
        tokio_test::block_on(channel.notified());
        assert_eq!(channel.len(), 1);
    }
}
