use std::sync::Arc;

use tracing::{error, info, trace, warn};

use crate::codec::MessageCodec;
use crate::connection::FrameReader;
use crate::dispatch::RegistryFor;

/// Reads frames from a peer connection until the connection fails, publishing every decoded
///  message to the registry.
///
/// Frames that can not be decoded are logged and skipped; only an I/O error (including the peer
///  closing the connection) ends the loop. There is no reconnect: the error is returned and it
///  is up to the owner of the gateway what to do about it.
pub async fn run_read_loop<C: MessageCodec>(
    mut reader: FrameReader,
    codec: Arc<C>,
    registry: Arc<RegistryFor<C>>,
) -> anyhow::Result<()> {
    info!("starting {} read loop for {}", C::FAMILY, reader.name());

    loop {
        let payload = match reader.read_frame().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("reading from {} failed, terminating read loop: {}", reader.name(), e);
                return Err(e.into());
            }
        };

        match codec.decode(&payload) {
            Ok(Some((tag, msg))) => {
                trace!(?tag, "received message");
                registry.publish(tag, msg).await;
            }
            Ok(None) => {
                trace!("skipping frame of {} bytes", payload.len());
            }
            Err(e) => {
                warn!("skipping {} frame of {} bytes that could not be decoded: {}", C::FAMILY, payload.len(), e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use crate::codec::control::{ControlCodec, ControlEvent, ControlMessage, ControlTag};
    use crate::codec::generic::{GatewayMessage, GatewayTag, GenericCodec};
    use crate::connection::Connection;
    use crate::dispatch::DispatchRegistry;
    use super::*;

    #[tokio::test]
    async fn test_read_loop_publishes_and_skips_garbage() {
        let (client, mut peer) = duplex(256);
        let (_connection, reader) = Connection::new("control", Arc::new(ControlCodec), client);
        let registry = Arc::new(DispatchRegistry::new(Duration::from_millis(100)));
        let mut granted = registry.subscribe(ControlTag::ControlResponse, 4);

        let read_loop = tokio::spawn(run_read_loop(reader, Arc::new(ControlCodec), registry.clone()));

        let valid = ControlCodec.encode(&ControlMessage::ControlResponse { event: ControlEvent::Granted }).unwrap();
        peer.write_all(b"\0\0").await.unwrap(); // empty frame
        peer.write_all(b"\x02\0\x7f\x01").await.unwrap(); // unknown tag
        peer.write_all(b"\x01\0\x20").await.unwrap(); // truncated body
        peer.write_all(&valid).await.unwrap();

        assert_eq!(granted.recv().await, Some(ControlMessage::ControlResponse { event: ControlEvent::Granted }));

        drop(peer);
        assert!(read_loop.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_read_loop_generic_family() {
        let (client, mut peer) = duplex(256);
        let (_connection, reader) = Connection::new("generic", Arc::new(GenericCodec), client);
        let registry = Arc::new(DispatchRegistry::new(Duration::from_millis(100)));
        let mut available = registry.subscribe(GatewayTag::AnimationAvailable, 4);
        let _read_loop = tokio::spawn(run_read_loop(reader, Arc::new(GenericCodec), registry.clone()));

        peer.write_all(b"\x04\0\x63\0\0\0").await.unwrap(); // unknown tag
        for name in ["anim_a", "anim_b"] {
            let frame = GenericCodec.encode(&GatewayMessage::AnimationAvailable { name: name.to_string() }).unwrap();
            peer.write_all(&frame).await.unwrap();
        }

        assert_eq!(available.recv().await, Some(GatewayMessage::AnimationAvailable { name: "anim_a".to_string() }));
        assert_eq!(available.recv().await, Some(GatewayMessage::AnimationAvailable { name: "anim_b".to_string() }));
    }
}
