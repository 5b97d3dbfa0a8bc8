//! Bridging of a bidirectional external stream onto a peer connection.
//!
//! Two tasks run per bridged stream: one forwards inbound messages from the external stream to
//!  the peer, the other forwards the peer's responses (and periodic keepalives) to the external
//!  stream. Whichever ends first ends the other one. When the bridge ends, a release message is
//!  written to the peer, so the peer never keeps state for a session that is gone.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, Instrument};

use crate::connection::MessageSender;
use crate::dispatch::{DispatchRegistry, Subscription};

/// The external side of a bridge, e.g. a bidirectional RPC stream.
///
/// `recv` and `cancelled` must be cancellation safe: they are raced against other events.
#[async_trait]
pub trait ExternalStream: Send + Sync + 'static {
    type Inbound: Send + 'static;
    type Outbound: Send + 'static;

    /// the next message from the remote side, `None` when the remote side finished sending
    async fn recv(&self) -> anyhow::Result<Option<Self::Inbound>>;

    async fn send(&self, msg: Self::Outbound) -> anyhow::Result<()>;

    /// completes when the remote side cancels the stream
    async fn cancelled(&self);
}

/// Translation between an external stream's messages and a protocol family's messages
pub trait BridgeAdapter: Send + Sync + 'static {
    type Tag: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Message: Clone + Debug + Send + Sync + 'static;
    type Inbound: Send + 'static;
    type Outbound: Send + 'static;

    /// peer messages with this tag are forwarded to the external stream
    fn response_tag(&self) -> Self::Tag;

    /// `None` for inbound messages that are not forwarded
    fn to_internal(&self, inbound: Self::Inbound) -> Option<Self::Message>;
    fn to_external(&self, msg: Self::Message) -> Option<Self::Outbound>;

    fn keepalive(&self) -> Self::Outbound;

    /// written to the peer when the bridge ends
    fn release(&self) -> Self::Message;
}

/// capacity of the response subscription, i.e. responses buffered while the external stream is busy
const RESPONSE_CAPACITY: usize = 16;

/// Runs a bridge until either side ends it, returning the first error from either direction.
pub async fn run_bridge<A, S>(
    adapter: Arc<A>,
    stream: Arc<S>,
    registry: &DispatchRegistry<A::Tag, A::Message>,
    sender: Arc<dyn MessageSender<A::Message>>,
    keepalive_interval: Duration,
) -> anyhow::Result<()>
where
    A: BridgeAdapter,
    S: ExternalStream<Inbound = A::Inbound, Outbound = A::Outbound>,
{
    // subscribe before anything is forwarded to the peer, so no response is missed
    let subscription = registry.subscribe(adapter.response_tag(), RESPONSE_CAPACITY);

    let (terminate, terminated) = watch::channel(false);
    let terminate = Arc::new(terminate);

    info!("starting bridge");

    let inbound = tokio::spawn(forward_inbound(
        adapter.clone(),
        stream.clone(),
        sender,
        terminate.clone(),
        terminated.clone(),
    ).in_current_span());
    let outbound = tokio::spawn(forward_outbound(
        adapter,
        stream,
        subscription,
        keepalive_interval,
        terminate,
        terminated,
    ).in_current_span());

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    info!("bridge terminated");
    inbound??;
    outbound??;
    Ok(())
}

async fn forward_inbound<A, S>(
    adapter: Arc<A>,
    stream: Arc<S>,
    sender: Arc<dyn MessageSender<A::Message>>,
    terminate: Arc<watch::Sender<bool>>,
    mut terminated: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    A: BridgeAdapter,
    S: ExternalStream<Inbound = A::Inbound, Outbound = A::Outbound>,
{
    let result = loop {
        select! {
            inbound = stream.recv() => match inbound {
                Ok(Some(inbound)) => {
                    match adapter.to_internal(inbound) {
                        Some(msg) => {
                            debug!("forwarding {:?} to peer", msg);
                            if let Err(e) = sender.try_send(&msg).await {
                                break Err(e);
                            }
                        }
                        None => debug!("ignoring inbound message"),
                    }
                }
                Ok(None) => {
                    debug!("external stream finished");
                    break Ok(());
                }
                Err(e) => {
                    debug!("error reading external stream: {}", e);
                    break Err(e);
                }
            },
            _ = terminated.changed() => break Ok(()),
        }
    };

    terminate.send_replace(true);
    sender.send(&adapter.release()).await;
    result
}

async fn forward_outbound<A, S>(
    adapter: Arc<A>,
    stream: Arc<S>,
    mut subscription: Subscription<A::Tag, A::Message>,
    keepalive_interval: Duration,
    terminate: Arc<watch::Sender<bool>>,
    mut terminated: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    A: BridgeAdapter,
    S: ExternalStream<Inbound = A::Inbound, Outbound = A::Outbound>,
{
    let mut keepalive = interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        select! {
            msg = subscription.recv() => match msg {
                Some(msg) => {
                    if let Some(outbound) = adapter.to_external(msg) {
                        if let Err(e) = stream.send(outbound).await {
                            break Err(e);
                        }
                    }
                }
                None => break Err(anyhow!("response subscription was closed")),
            },
            _ = keepalive.tick() => {
                if let Err(e) = stream.send(adapter.keepalive()).await {
                    break Err(e);
                }
            }
            _ = terminated.changed() => break Ok(()),
            _ = stream.cancelled() => {
                debug!("external stream was cancelled by the remote side");
                break Ok(());
            }
        }
    };

    terminate.send_replace(true);
    result
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::time::timeout;
    use crate::test_util::message::TrackingMessageSender;
    use crate::test_util::stream::{channel_stream, ChannelStreamRemote};
    use super::*;

    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
    enum Tag {
        Lock,
        Unlock,
        Status,
    }

    #[derive(Debug, Clone, Eq, PartialEq)]
    enum Internal {
        Lock,
        Unlock,
        Status(u32),
    }

    #[derive(Debug, Clone, Eq, PartialEq)]
    enum Outbound {
        Status(u32),
        KeepAlive,
    }

    struct TestAdapter;

    impl BridgeAdapter for TestAdapter {
        type Tag = Tag;
        type Message = Internal;
        type Inbound = &'static str;
        type Outbound = Outbound;

        fn response_tag(&self) -> Tag {
            Tag::Status
        }

        fn to_internal(&self, inbound: &'static str) -> Option<Internal> {
            match inbound {
                "lock" => Some(Internal::Lock),
                "unlock" => Some(Internal::Unlock),
                _ => None,
            }
        }

        fn to_external(&self, msg: Internal) -> Option<Outbound> {
            match msg {
                Internal::Status(n) => Some(Outbound::Status(n)),
                _ => None,
            }
        }

        fn keepalive(&self) -> Outbound {
            Outbound::KeepAlive
        }

        fn release(&self) -> Internal {
            Internal::Unlock
        }
    }

    struct Setup {
        registry: Arc<DispatchRegistry<Tag, Internal>>,
        sender: Arc<TrackingMessageSender<Internal>>,
        remote: ChannelStreamRemote<&'static str, Outbound>,
        bridge: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    fn start_bridge() -> Setup {
        let registry = Arc::new(DispatchRegistry::new(Duration::from_millis(100)));
        let sender = Arc::new(TrackingMessageSender::new());
        let (stream, remote) = channel_stream();

        let bridge = tokio::spawn({
            let registry = registry.clone();
            let sender = sender.clone();
            async move {
                run_bridge(Arc::new(TestAdapter), Arc::new(stream), &registry, sender, Duration::from_secs(1)).await
            }
        });

        Setup { registry, sender, remote, bridge }
    }

    async fn wait_for_subscription(registry: &DispatchRegistry<Tag, Internal>) {
        while registry.num_subscribers(Tag::Status) == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarding_and_release() {
        let mut setup = start_bridge();
        wait_for_subscription(&setup.registry).await;

        setup.remote.send("lock").await;
        setup.remote.send("ignored").await;
        setup.sender.wait_for_messages(1).await;

        setup.registry.publish(Tag::Status, Internal::Status(3)).await;
        setup.registry.publish(Tag::Lock, Internal::Lock).await;
        assert_eq!(setup.remote.recv().await, Some(Outbound::Status(3)));

        setup.remote.finish();
        setup.bridge.await.unwrap().unwrap();

        setup.sender.assert_message_sent(Internal::Lock).await;
        setup.sender.assert_message_sent(Internal::Unlock).await;
        setup.sender.assert_no_remaining_messages().await;
        assert_eq!(setup.registry.num_tags(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive() {
        let mut setup = start_bridge();
        wait_for_subscription(&setup.registry).await;

        let start = Instant::now();
        assert_eq!(setup.remote.recv().await, Some(Outbound::KeepAlive));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(setup.remote.recv().await, Some(Outbound::KeepAlive));
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));

        setup.remote.cancel();
        setup.bridge.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_releases() {
        let setup = start_bridge();
        wait_for_subscription(&setup.registry).await;

        setup.remote.fail(anyhow!("connection reset")).await;
        assert!(setup.bridge.await.unwrap().is_err());

        setup.sender.assert_message_sent(Internal::Unlock).await;
        setup.sender.assert_no_remaining_messages().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cancel_terminates_both_tasks() {
        let setup = start_bridge();
        wait_for_subscription(&setup.registry).await;

        setup.remote.cancel();
        timeout(Duration::from_millis(10), setup.bridge).await.unwrap().unwrap().unwrap();

        setup.sender.assert_message_sent(Internal::Unlock).await;
        assert_eq!(setup.registry.num_tags(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_terminates() {
        let mut setup = start_bridge();
        wait_for_subscription(&setup.registry).await;

        setup.remote.close_outbound();
        setup.registry.publish(Tag::Status, Internal::Status(1)).await;

        assert!(setup.bridge.await.unwrap().is_err());
        setup.sender.assert_message_sent(Internal::Unlock).await;
    }
}
