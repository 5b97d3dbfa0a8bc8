use std::sync::Arc;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};

use crate::codec::control::ControlCodec;
use crate::codec::generic::GenericCodec;
use crate::codec::MessageCodec;
use crate::config::GatewayConfig;
use crate::connection::{connect_with_retry, Connection, FrameReader, PeerEndpoint};
use crate::dispatch::read_loop::run_read_loop;
use crate::service::{GatewayService, PeerLink};

/// Owns the peer connections and their read loops, and hands out the [GatewayService] that
///  operates on them.
pub struct Gateway {
    service: Arc<GatewayService>,
    read_loops: JoinSet<anyhow::Result<()>>,
}

impl Gateway {
    /// Connects to all peers, waiting for each peer's socket to appear, and starts reading.
    pub async fn connect(config: GatewayConfig) -> anyhow::Result<Gateway> {
        config.validate()?;

        let control = Self::connect_peer::<ControlCodec>(&config, "control", &config.control_socket_suffix).await;
        let generic = Self::connect_peer::<GenericCodec>(&config, "generic", &config.generic_socket_suffix).await;
        let aux = Self::connect_peer::<ControlCodec>(&config, "aux", &config.aux_socket_suffix).await;

        Self::new(config, control, generic, aux)
    }

    async fn connect_peer<C: MessageCodec + Default>(config: &GatewayConfig, name: &str, suffix: &str) -> (Connection<C>, FrameReader) {
        let endpoint = PeerEndpoint::new(&config.socket_dir, suffix);
        let stream = connect_with_retry(&endpoint, config.connect_retry_interval).await;
        Connection::new(name, Arc::new(C::default()), stream)
    }

    /// Starts the read loops for already established connections. This spawns tasks, so it
    ///  must be called from within a tokio runtime.
    pub fn new(
        config: GatewayConfig,
        control: (Connection<ControlCodec>, FrameReader),
        generic: (Connection<GenericCodec>, FrameReader),
        aux: (Connection<ControlCodec>, FrameReader),
    ) -> anyhow::Result<Gateway> {
        config.validate()?;
        let config = Arc::new(config);

        let mut read_loops = JoinSet::new();
        let control = Self::start_peer(&config, control, &mut read_loops);
        let generic = Self::start_peer(&config, generic, &mut read_loops);
        let aux = Self::start_peer(&config, aux, &mut read_loops);

        Ok(Gateway {
            service: Arc::new(GatewayService::new(config, control, generic, aux)),
            read_loops,
        })
    }

    fn start_peer<C: MessageCodec>(config: &GatewayConfig, (connection, reader): (Connection<C>, FrameReader), read_loops: &mut JoinSet<anyhow::Result<()>>) -> PeerLink<C> {
        let codec = connection.codec().clone();
        let span = info_span!("read_loop", peer = connection.name());
        let link = PeerLink::new(connection, config.publish_timeout);

        read_loops.spawn(run_read_loop(reader, codec, link.registry().clone()).instrument(span));
        link
    }

    pub fn service(&self) -> &Arc<GatewayService> {
        &self.service
    }

    /// Runs until the first peer connection fails, and then shuts the gateway down. There is no
    ///  reconnect: the returned error is for the owner to act on, typically by exiting and
    ///  being restarted.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let result = match self.read_loops.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(e.into()),
            None => Err(anyhow!("no read loops")),
        };
        if let Err(e) = &result {
            error!("peer connection failed: {}", e);
        }

        self.shutdown().await;
        result
    }

    /// Stops reading from the peers and closes the connections. Requests that are still waiting
    ///  for a response fail.
    pub async fn shutdown(mut self) {
        info!("shutting down gateway");
        self.read_loops.shutdown().await;

        self.service.control.registry.clear();
        self.service.generic.registry.clear();
        self.service.aux.registry.clear();

        for result in [
            self.service.control.connection.shutdown().await,
            self.service.generic.connection.shutdown().await,
            self.service.aux.connection.shutdown().await,
        ] {
            if let Err(e) = result {
                info!("error closing connection: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::net::UnixListener;
    use crate::codec::control::ControlMessage;
    use crate::codec::generic::GatewayMessage;
    use crate::error::RequestError;
    use crate::service::test::test_gateway;
    use super::*;

    #[tokio::test]
    async fn test_run_ends_when_a_peer_disconnects() {
        let (gateway, peers) = test_gateway(GatewayConfig::new());
        let service = gateway.service().clone();

        let waiting = tokio::spawn(async move { service.list_animations().await });
        let mut generic = peers.generic;
        generic.expect(GatewayMessage::ListAnimationsRequest).await;

        peers.aux.disconnect();
        assert!(gateway.run().await.is_err());

        // the pending request fails instead of waiting for its deadline
        assert!(matches!(waiting.await.unwrap(), Err(RequestError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (gateway, mut peers) = test_gateway(GatewayConfig::new());
        let service = gateway.service().clone();

        let waiting = tokio::spawn(async move { service.play_animation("anim_wave", 1).await });
        peers.generic.expect(GatewayMessage::PlayAnimationRequest { name: "anim_wave".to_string(), loops: 1 }).await;

        gateway.shutdown().await;
        assert!(matches!(waiting.await.unwrap(), Err(RequestError::ChannelClosed)));

        // the peers see the end of their connection
        peers.control.expect_closed().await;
        peers.generic.expect_closed().await;
        peers.aux.expect_closed().await;
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = GatewayConfig {
            publish_timeout: Duration::ZERO,
            ..GatewayConfig::new()
        };
        let (control_connection, control_reader, _control) = crate::test_util::peer::connected_peer::<ControlCodec>("control");
        let (generic_connection, generic_reader, _generic) = crate::test_util::peer::connected_peer::<GenericCodec>("generic");
        let (aux_connection, aux_reader, _aux) = crate::test_util::peer::connected_peer::<ControlCodec>("aux");

        assert!(Gateway::new(config, (control_connection, control_reader), (generic_connection, generic_reader), (aux_connection, aux_reader)).is_err());
    }

    #[tokio::test]
    async fn test_connect_over_unix_sockets() {
        let dir = std::env::temp_dir().join(format!("engine-gateway-connect-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = GatewayConfig::new().with_socket_dir(&dir);

        let mut listeners = Vec::new();
        for suffix in [&config.control_socket_suffix, &config.generic_socket_suffix, &config.aux_socket_suffix] {
            let path = dir.join(suffix);
            let _ = std::fs::remove_file(&path);
            listeners.push(UnixListener::bind(&path).unwrap());
        }

        let gateway = Gateway::connect(config).await.unwrap();
        let (mut control_peer, _) = listeners[0].accept().await.unwrap();

        gateway.service().send_control(&ControlMessage::ControlRelease).await;
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut control_peer, &mut buf).await.unwrap();
        assert_eq!(&buf, b"\x01\0\x21");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
