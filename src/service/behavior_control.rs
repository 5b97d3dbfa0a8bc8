//! Behavior control sessions: an external client asks for control over the robot's behaviors and
//!  holds it for as long as its session stream is open.

use std::sync::Arc;

use tracing::{info_span, Instrument};

use crate::bridge::{run_bridge, BridgeAdapter, ExternalStream};
use crate::codec::control::{ControlEvent, ControlMessage, ControlPriority, ControlTag};
use crate::service::GatewayService;

/// what an external client sends on a behavior control session
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BehaviorControlRequest {
    RequestControl { priority: ControlPriority },
    ReleaseControl,
}

/// what an external client receives on a behavior control session
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BehaviorControlResponse {
    ControlGranted,
    ControlLost,
    KeepAlive,
}

pub struct BehaviorControlAdapter;

impl BridgeAdapter for BehaviorControlAdapter {
    type Tag = ControlTag;
    type Message = ControlMessage;
    type Inbound = BehaviorControlRequest;
    type Outbound = BehaviorControlResponse;

    fn response_tag(&self) -> ControlTag {
        ControlTag::ControlResponse
    }

    fn to_internal(&self, inbound: BehaviorControlRequest) -> Option<ControlMessage> {
        let msg = match inbound {
            BehaviorControlRequest::RequestControl { priority } => ControlMessage::ControlRequest { priority },
            BehaviorControlRequest::ReleaseControl => ControlMessage::ControlRelease,
        };
        Some(msg)
    }

    fn to_external(&self, msg: ControlMessage) -> Option<BehaviorControlResponse> {
        match msg {
            ControlMessage::ControlResponse { event: ControlEvent::Granted } => Some(BehaviorControlResponse::ControlGranted),
            ControlMessage::ControlResponse { event: ControlEvent::Lost } => Some(BehaviorControlResponse::ControlLost),
            _ => None,
        }
    }

    fn keepalive(&self) -> BehaviorControlResponse {
        BehaviorControlResponse::KeepAlive
    }

    fn release(&self) -> ControlMessage {
        ControlMessage::ControlRelease
    }
}

impl GatewayService {
    /// Runs a behavior control session until the client ends or cancels it. Control is released
    ///  on the robot whichever way the session ends.
    pub async fn behavior_control<S>(&self, stream: S) -> anyhow::Result<()>
    where S: ExternalStream<Inbound = BehaviorControlRequest, Outbound = BehaviorControlResponse>
    {
        run_bridge(
            Arc::new(BehaviorControlAdapter),
            Arc::new(stream),
            &self.control.registry,
            self.control.connection.clone(),
            self.config.keepalive_interval,
        )
            .instrument(info_span!("behavior_control"))
            .await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use crate::config::GatewayConfig;
    use crate::service::test::test_gateway;
    use crate::test_util::stream::channel_stream;
    use super::*;

    #[tokio::test]
    async fn test_behavior_control_session() {
        let (gateway, mut peers) = test_gateway(GatewayConfig::new());
        let (stream, mut remote) = channel_stream();

        let session = tokio::spawn({
            let service = gateway.service().clone();
            async move { service.behavior_control(stream).await }
        });

        remote.send(BehaviorControlRequest::RequestControl { priority: ControlPriority::Default }).await;
        peers.control.expect(ControlMessage::ControlRequest { priority: ControlPriority::Default }).await;

        peers.control.send(&ControlMessage::ControlResponse { event: ControlEvent::Granted }).await;
        assert_eq!(remote.recv().await, Some(BehaviorControlResponse::ControlGranted));

        peers.control.send(&ControlMessage::ControlResponse { event: ControlEvent::Lost }).await;
        assert_eq!(remote.recv().await, Some(BehaviorControlResponse::ControlLost));

        remote.finish();
        session.await.unwrap().unwrap();
        peers.control.expect(ControlMessage::ControlRelease).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_releases_control() {
        let config = GatewayConfig {
            keepalive_interval: Duration::from_millis(500),
            ..GatewayConfig::new()
        };
        let (gateway, mut peers) = test_gateway(config);
        let (stream, mut remote) = channel_stream();

        let session = tokio::spawn({
            let service = gateway.service().clone();
            async move { service.behavior_control(stream).await }
        });

        remote.send(BehaviorControlRequest::RequestControl { priority: ControlPriority::ReserveControl }).await;
        peers.control.expect(ControlMessage::ControlRequest { priority: ControlPriority::ReserveControl }).await;
        assert_eq!(remote.recv().await, Some(BehaviorControlResponse::KeepAlive));

        remote.cancel();
        session.await.unwrap().unwrap();
        peers.control.expect(ControlMessage::ControlRelease).await;
    }
}
