//! Routing of received messages to the parts of the gateway that wait for them.
//!
//! A [DispatchRegistry] maps a message tag to the queues of everybody currently interested in
//!  messages with that tag. The read loop publishes every decoded message, and the registry fans
//!  it out. Subscribers come and go all the time (a request subscribes for its response and
//!  goes away when the response arrives), so the read loop knows nothing about them.
//!
//! Delivery never blocks the read loop indefinitely: enqueueing into a single subscriber's queue
//!  is bounded by a timeout, and a subscriber that is too slow loses the message. Other
//!  subscribers of the same tag are not affected.

pub mod read_loop;

use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::{MessageCodec, TagOf};

/// the registry for a protocol family's messages
pub type RegistryFor<C> = DispatchRegistry<TagOf<C>, <C as MessageCodec>::Message>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("there is already a subscription for {0:?}")]
pub struct AlreadySubscribed<T: Debug>(pub T);

pub struct DispatchRegistry<T, M> {
    inner: Arc<RegistryInner<T, M>>,
}

struct RegistryInner<T, M> {
    // never held across an await; Subscription::drop unsubscribes synchronously
    subscribers: RwLock<FxHashMap<T, Vec<Subscriber<M>>>>,
    next_id: AtomicU64,
    publish_timeout: Duration,
}

struct Subscriber<M> {
    id: u64,
    sender: mpsc::Sender<M>,
}

impl <T, M> Debug for DispatchRegistry<T, M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DispatchRegistry{{publish_timeout:{:?}}}", self.inner.publish_timeout)
    }
}

impl <T, M> DispatchRegistry<T, M>
where
    T: Copy + Eq + Hash + Debug + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    pub fn new(publish_timeout: Duration) -> DispatchRegistry<T, M> {
        DispatchRegistry {
            inner: Arc::new(RegistryInner {
                subscribers: Default::default(),
                next_id: AtomicU64::new(0),
                publish_timeout,
            }),
        }
    }

    /// Registers a new subscriber for a tag. The subscription stays active until it is dropped
    ///  or explicitly unsubscribed.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn subscribe(&self, tag: T, capacity: usize) -> Subscription<T, M> {
        let mut subscribers = self.inner.write();
        self.add_subscriber(&mut subscribers, tag, capacity)
    }

    /// Like [DispatchRegistry::subscribe], but fails if there is any subscription for the tag.
    ///
    /// Checking and registering happen under the same lock, so of two concurrent calls for the
    ///  same tag exactly one succeeds.
    pub fn subscribe_unique(&self, tag: T, capacity: usize) -> Result<Subscription<T, M>, AlreadySubscribed<T>> {
        let mut subscribers = self.inner.write();
        if subscribers.contains_key(&tag) {
            debug!(?tag, "rejecting unique subscription: tag has subscribers");
            return Err(AlreadySubscribed(tag));
        }
        Ok(self.add_subscriber(&mut subscribers, tag, capacity))
    }

    fn add_subscriber(&self, subscribers: &mut FxHashMap<T, Vec<Subscriber<M>>>, tag: T, capacity: usize) -> Subscription<T, M> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        subscribers.entry(tag)
            .or_default()
            .push(Subscriber { id, sender });
        debug!(?tag, id, "subscribed");

        Subscription {
            handle: UnsubscribeHandle {
                registry: Arc::downgrade(&self.inner),
                tag,
                id,
            },
            receiver,
        }
    }

    /// Delivers a message to every current subscriber of its tag, returning the number of
    ///  subscribers that actually received it.
    ///
    /// Deliveries run concurrently, each bounded by the publish timeout, and this function returns
    ///  only after all of them completed or timed out. The subscriber list is a snapshot taken
    ///  when publishing starts: subscriptions registered during fan-out do not see the message.
    pub async fn publish(&self, tag: T, msg: M) -> usize {
        let mut senders = self.inner.read()
            .get(&tag)
            .map(|subscribers| subscribers.iter()
                .map(|s| (s.id, s.sender.clone()))
                .collect::<Vec<_>>()
            )
            .unwrap_or_default();

        if senders.is_empty() {
            trace!(?tag, "no subscribers - dropping message");
            return 0;
        }
        if senders.len() == 1 {
            let (id, sender) = senders.remove(0);
            return deliver(tag, id, sender, msg, self.inner.publish_timeout).await as usize;
        }

        let mut deliveries = JoinSet::new();
        for (id, sender) in senders {
            deliveries.spawn(deliver(tag, id, sender, msg.clone(), self.inner.publish_timeout));
        }

        let mut num_delivered = 0;
        while let Some(delivered) = deliveries.join_next().await {
            if let Ok(true) = delivered {
                num_delivered += 1;
            }
        }
        num_delivered
    }

    /// Removes all subscriptions. Their subscribers receive what is already queued, and then the
    ///  end of the queue.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.inner.write());
        debug!("removed subscriptions for {} tags", removed.len());
    }

    pub fn num_subscribers(&self, tag: T) -> usize {
        self.inner.read()
            .get(&tag)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn num_tags(&self) -> usize {
        self.inner.read().len()
    }
}

async fn deliver<T: Debug, M>(tag: T, id: u64, sender: mpsc::Sender<M>, msg: M, publish_timeout: Duration) -> bool {
    match timeout(publish_timeout, sender.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            debug!(?tag, id, "subscriber's queue is closed - dropping message");
            false
        }
        Err(_) => {
            warn!(?tag, id, "subscriber did not accept message within {:?} - dropping it", publish_timeout);
            false
        }
    }
}

impl <T: Copy + Eq + Hash + Debug, M> RegistryInner<T, M> {
    // the map is structurally valid even if a holder of the lock panicked
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<T, Vec<Subscriber<M>>>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<T, Vec<Subscriber<M>>>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, tag: T, id: u64) {
        let mut subscribers = self.write();
        if let Entry::Occupied(mut e) = subscribers.entry(tag) {
            if let Some(pos) = e.get().iter().position(|s| s.id == id) {
                e.get_mut().swap_remove(pos);
                debug!(?tag, id, "unsubscribed");
            }
            if e.get().is_empty() {
                e.remove();
            }
        }
    }
}

/// Removes one specific subscription from its registry. Calling it more than once, or after
///  the registry is gone, does nothing.
pub struct UnsubscribeHandle<T, M> {
    registry: Weak<RegistryInner<T, M>>,
    tag: T,
    id: u64,
}

impl <T: Copy, M> Clone for UnsubscribeHandle<T, M> {
    fn clone(&self) -> Self {
        UnsubscribeHandle {
            registry: self.registry.clone(),
            tag: self.tag,
            id: self.id,
        }
    }
}

impl <T: Debug, M> Debug for UnsubscribeHandle<T, M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnsubscribeHandle{{tag:{:?},id:{}}}", self.tag, self.id)
    }
}

impl <T: Copy + Eq + Hash + Debug, M> UnsubscribeHandle<T, M> {
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.tag, self.id);
        }
    }

    pub fn tag(&self) -> T {
        self.tag
    }
}

/// A subscriber's end of a subscription: the queue that published messages arrive in.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T: Copy + Eq + Hash + Debug, M> {
    handle: UnsubscribeHandle<T, M>,
    receiver: mpsc::Receiver<M>,
}

impl <T: Copy + Eq + Hash + Debug, M> Debug for Subscription<T, M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription{{tag:{:?},id:{}}}", self.handle.tag, self.handle.id)
    }
}

impl <T: Copy + Eq + Hash + Debug, M> Subscription<T, M> {
    /// Waits for the next message. `None` means the subscription was removed from the registry
    ///  (or the registry was dropped) and all queued messages were consumed.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn tag(&self) -> T {
        self.handle.tag
    }

    /// a handle for unsubscribing from elsewhere, e.g. a task that does not own the subscription
    pub fn handle(&self) -> UnsubscribeHandle<T, M> {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }
}

impl <T: Copy + Eq + Hash + Debug, M> Drop for Subscription<T, M> {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}
