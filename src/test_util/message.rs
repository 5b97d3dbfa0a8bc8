use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use crate::connection::MessageSender;

/// A [MessageSender] that records every message instead of sending it
#[derive(Debug)]
pub struct TrackingMessageSender<M> {
    tracker: Arc<RwLock<Vec<M>>>,
    num_sent: watch::Sender<usize>,
}

impl <M: Clone + Debug + PartialEq + Send + Sync + 'static> TrackingMessageSender<M> {
    pub fn new() -> Self {
        TrackingMessageSender {
            tracker: Default::default(),
            num_sent: watch::channel(0).0,
        }
    }

    /// waits until at least `n` messages were sent in total, including messages that were
    ///  already consumed by assertions
    pub async fn wait_for_messages(&self, n: usize) {
        let mut num_sent = self.num_sent.subscribe();
        let _ = num_sent.wait_for(|num_sent| *num_sent >= n).await;
    }

    pub async fn assert_message_sent(&self, message: M) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent");
        }
        let actual = lock.remove(0);
        assert_eq!(actual, message);
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected messages: {:?}", *lock);
    }
}

impl <M: Clone + Debug + PartialEq + Send + Sync + 'static> Default for TrackingMessageSender<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl <M: Clone + Debug + PartialEq + Send + Sync + 'static> MessageSender<M> for TrackingMessageSender<M> {
    async fn try_send(&self, msg: &M) -> anyhow::Result<()> {
        self.tracker.write().await.push(msg.clone());
        self.num_sent.send_modify(|n| *n += 1);
        Ok(())
    }
}
