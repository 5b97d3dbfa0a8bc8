use std::future::pending;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::bridge::ExternalStream;

/// An in-memory [ExternalStream], controlled from the test through a [ChannelStreamRemote]
pub struct ChannelStream<I, O> {
    inbound: Mutex<mpsc::Receiver<anyhow::Result<I>>>,
    outbound: mpsc::Sender<O>,
    cancelled: watch::Receiver<bool>,
}

/// The remote end of a [ChannelStream]
pub struct ChannelStreamRemote<I, O> {
    inbound: Option<mpsc::Sender<anyhow::Result<I>>>,
    outbound: mpsc::Receiver<O>,
    cancel: watch::Sender<bool>,
}

pub fn channel_stream<I, O>() -> (ChannelStream<I, O>, ChannelStreamRemote<I, O>) {
    let (inbound_send, inbound_recv) = mpsc::channel(16);
    let (outbound_send, outbound_recv) = mpsc::channel(16);
    let (cancel, cancelled) = watch::channel(false);

    let stream = ChannelStream {
        inbound: Mutex::new(inbound_recv),
        outbound: outbound_send,
        cancelled,
    };
    let remote = ChannelStreamRemote {
        inbound: Some(inbound_send),
        outbound: outbound_recv,
        cancel,
    };
    (stream, remote)
}

#[async_trait]
impl <I: Send + 'static, O: Send + 'static> ExternalStream for ChannelStream<I, O> {
    type Inbound = I;
    type Outbound = O;

    async fn recv(&self) -> anyhow::Result<Option<I>> {
        self.inbound.lock().await
            .recv().await
            .transpose()
    }

    async fn send(&self, msg: O) -> anyhow::Result<()> {
        self.outbound.send(msg).await
            .map_err(|_| anyhow!("remote side closed the stream"))
    }

    async fn cancelled(&self) {
        let mut cancelled = self.cancelled.clone();
        if cancelled.wait_for(|c| *c).await.is_err() {
            // the remote end is gone without cancelling
            pending::<()>().await;
        }
    }
}

impl <I, O> ChannelStreamRemote<I, O> {
    pub async fn send(&self, msg: I) {
        self.inbound_sender()
            .send(Ok(msg)).await
            .expect("stream was dropped");
    }

    /// the stream's next `recv` returns an error
    pub async fn fail(&self, error: anyhow::Error) {
        self.inbound_sender()
            .send(Err(error)).await
            .expect("stream was dropped");
    }

    /// the stream's `recv` returns `None` after all previously sent messages
    pub fn finish(&mut self) {
        self.inbound = None;
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// makes sending to the remote side fail
    pub fn close_outbound(&mut self) {
        self.outbound.close();
    }

    pub async fn recv(&mut self) -> Option<O> {
        self.outbound.recv().await
    }

    fn inbound_sender(&self) -> &mpsc::Sender<anyhow::Result<I>> {
        self.inbound.as_ref()
            .expect("stream was finished")
    }
}
