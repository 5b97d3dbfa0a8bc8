//! Request / response on top of publish / subscribe.
//!
//! Every request subscribes for its response tag *before* the request is written. A response
//!  can therefore never slip through between sending and waiting: if it arrives before the
//!  caller starts waiting, it sits in the subscription's queue. The subscription is removed on
//!  every exit path because it is dropped when the call returns.

use std::fmt::Debug;
use std::future::{pending, Future};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tracing::debug;

use crate::connection::MessageSender;
use crate::dispatch::{DispatchRegistry, Subscription};
use crate::error::RequestError;

pub struct Correlator<T, M> {
    registry: Arc<DispatchRegistry<T, M>>,
    sender: Arc<dyn MessageSender<M>>,
}

impl <T, M> Clone for Correlator<T, M> {
    fn clone(&self) -> Self {
        Correlator {
            registry: self.registry.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl <T, M> Correlator<T, M>
where
    T: Copy + Eq + Hash + Debug + Send + Sync + 'static,
    M: Clone + Debug + Send + Sync + 'static,
{
    pub fn new(registry: Arc<DispatchRegistry<T, M>>, sender: Arc<dyn MessageSender<M>>) -> Correlator<T, M> {
        Correlator {
            registry,
            sender,
        }
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry<T, M>> {
        &self.registry
    }

    /// Sends a request and waits for the first message with the response tag
    pub async fn request(&self, request: &M, response_tag: T, deadline: Duration) -> Result<M, RequestError> {
        self.request_with_cancel(request, response_tag, deadline, pending()).await
    }

    /// Like [Correlator::request], but also returns when `cancel` completes - typically because
    ///  the external caller went away.
    pub async fn request_with_cancel(&self, request: &M, response_tag: T, deadline: Duration, cancel: impl Future<Output=()> + Send) -> Result<M, RequestError> {
        let subscription = self.registry.subscribe(response_tag, 1);
        self.send_and_wait(subscription, request, deadline, cancel).await
    }

    /// Sends a request unless another request with the same response tag is still waiting, in
    ///  which case this fails with [RequestError::AlreadyInProgress] without sending anything.
    pub async fn request_unique(&self, request: &M, response_tag: T, deadline: Duration) -> Result<M, RequestError> {
        self.request_unique_with_cancel(request, response_tag, deadline, pending()).await
    }

    pub async fn request_unique_with_cancel(&self, request: &M, response_tag: T, deadline: Duration, cancel: impl Future<Output=()> + Send) -> Result<M, RequestError> {
        let subscription = self.registry.subscribe_unique(response_tag, 1)
            .map_err(|_| RequestError::AlreadyInProgress)?;
        self.send_and_wait(subscription, request, deadline, cancel).await
    }

    async fn send_and_wait(&self, mut subscription: Subscription<T, M>, request: &M, deadline: Duration, cancel: impl Future<Output=()> + Send) -> Result<M, RequestError> {
        self.sender.try_send(request).await
            .map_err(RequestError::Send)?;

        let result = select! {
            response = subscription.recv() => response.ok_or(RequestError::ChannelClosed),
            _ = sleep(deadline) => Err(RequestError::DeadlineExceeded(deadline)),
            _ = cancel => Err(RequestError::Cancelled),
        };

        if let Err(e) = &result {
            debug!(tag = ?subscription.tag(), "request for {:?} failed: {}", request, e);
        }
        result
    }

    /// Sends a request whose response is a sequence of `item_tag` messages terminated by a
    ///  single `end_tag` message, and collects the items.
    ///
    /// The deadline applies to the whole sequence. Items that do not fit into `capacity` within
    ///  the registry's publish timeout are lost.
    pub async fn request_collect(&self, request: &M, item_tag: T, end_tag: T, capacity: usize, deadline: Duration) -> Result<Vec<M>, RequestError> {
        let mut items = self.registry.subscribe(item_tag, capacity);
        let mut end = self.registry.subscribe(end_tag, 1);

        self.sender.try_send(request).await
            .map_err(RequestError::Send)?;

        let timeout = sleep(deadline);
        tokio::pin!(timeout);

        let mut collected = Vec::new();
        loop {
            select! {
                biased;
                item = items.recv() => match item {
                    Some(item) => collected.push(item),
                    None => return Err(RequestError::ChannelClosed),
                },
                marker = end.recv() => match marker {
                    Some(_) => {
                        // the read loop publishes items before the end marker, so they are
                        //  all queued by now
                        while let Ok(item) = items.try_recv() {
                            collected.push(item);
                        }
                        debug!(tag = ?item_tag, "collected {} items", collected.len());
                        return Ok(collected);
                    }
                    None => return Err(RequestError::ChannelClosed),
                },
                _ = &mut timeout => {
                    debug!(tag = ?item_tag, "deadline exceeded after {} items", collected.len());
                    return Err(RequestError::DeadlineExceeded(deadline));
                }
            }
        }
    }
}
