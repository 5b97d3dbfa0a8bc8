use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use crate::codec::MessageCodec;
use crate::connection::{Connection, FrameReader};

/// The peer process' end of an in-memory connection, speaking the same framing as a real peer
pub struct TestPeer<C: MessageCodec> {
    codec: C,
    stream: DuplexStream,
}

/// Creates a connection to an in-memory peer
pub fn connected_peer<C: MessageCodec + Default>(name: &str) -> (Connection<C>, FrameReader, TestPeer<C>) {
    let (gateway_side, peer_side) = duplex(64 * 1024);
    let (connection, reader) = Connection::new(name, Arc::new(C::default()), gateway_side);
    let peer = TestPeer {
        codec: C::default(),
        stream: peer_side,
    };
    (connection, reader, peer)
}

impl <C: MessageCodec> TestPeer<C>
where C::Message: PartialEq
{
    pub async fn send(&mut self, msg: &C::Message) {
        let frame = self.codec.encode(msg)
            .expect("test message can not be encoded");
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).await
            .expect("gateway side of the connection was dropped");
    }

    /// receives the next message the gateway sent, skipping frames the codec ignores
    pub async fn recv(&mut self) -> C::Message {
        loop {
            let len = self.stream.read_u16_le().await
                .expect("gateway side of the connection was dropped");
            let mut payload = vec![0u8; len as usize];
            self.stream.read_exact(&mut payload).await
                .expect("gateway side of the connection was dropped");

            if let Some((_, msg)) = self.codec.decode(&payload).expect("gateway sent an undecodable frame") {
                return msg;
            }
        }
    }

    pub async fn expect(&mut self, expected: C::Message) {
        let actual = self.recv().await;
        assert_eq!(actual, expected);
    }

    /// `None` if the gateway sends nothing for `duration`
    pub async fn recv_within(&mut self, duration: Duration) -> Option<C::Message> {
        timeout(duration, self.recv()).await.ok()
    }

    pub async fn expect_nothing_within(&mut self, duration: Duration) {
        if let Some(msg) = self.recv_within(duration).await {
            panic!("expected no message, received {:?}", msg);
        }
    }

    /// expects the gateway to close its side of the connection without sending anything else
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 1];
        let n = self.stream.read(&mut buf).await
            .expect("error reading from the gateway");
        assert_eq!(n, 0, "expected the connection to be closed");
    }

    /// closes the connection from the peer's side
    pub fn disconnect(self) {
        drop(self.stream);
    }
}
