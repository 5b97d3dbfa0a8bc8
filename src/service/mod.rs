//! The gateway's operations, built from the dispatch primitives.
//!
//! Each operation is what an external RPC handler calls: unary requests go through a
//!  [Correlator], media feeds through a chunk reassembler, and control sessions through a bridge.

pub mod behavior_control;
pub mod feeds;
pub mod gateway;

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::control::{ControlCodec, ControlMessage};
use crate::codec::generic::{AnimationResult, GatewayMessage, GatewayTag, GenericCodec, SettingsResult};
use crate::codec::{MessageCodec, TagOf};
use crate::config::GatewayConfig;
use crate::connection::{Connection, MessageSender};
use crate::correlator::Correlator;
use crate::dispatch::RegistryFor;
use crate::error::RequestError;

/// Everything needed to talk to one peer: its connection, the registry its read loop publishes
///  to, and a correlator combining the two.
pub struct PeerLink<C: MessageCodec> {
    registry: Arc<RegistryFor<C>>,
    connection: Arc<Connection<C>>,
    correlator: Correlator<TagOf<C>, C::Message>,
    /// number of running feeds per chunk tag; held while streaming is switched on or off
    feed_consumers: Arc<Mutex<FxHashMap<TagOf<C>, usize>>>,
}

impl <C: MessageCodec> Debug for PeerLink<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerLink{{connection:{:?}}}", self.connection)
    }
}

impl <C: MessageCodec> PeerLink<C> {
    pub fn new(connection: Connection<C>, publish_timeout: Duration) -> PeerLink<C> {
        let registry = Arc::new(RegistryFor::<C>::new(publish_timeout));
        let connection = Arc::new(connection);
        let correlator = Correlator::new(registry.clone(), connection.clone());
        PeerLink {
            registry,
            connection,
            correlator,
            feed_consumers: Default::default(),
        }
    }

    pub fn registry(&self) -> &Arc<RegistryFor<C>> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<Connection<C>> {
        &self.connection
    }

    pub fn correlator(&self) -> &Correlator<TagOf<C>, C::Message> {
        &self.correlator
    }

    /// fire-and-forget
    pub async fn send(&self, msg: &C::Message) {
        self.connection.send(msg).await
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SettingsUpdate {
    pub result: SettingsResult,
    pub version: u64,
}

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    control: PeerLink<ControlCodec>,
    generic: PeerLink<GenericCodec>,
    aux: PeerLink<ControlCodec>,
}

impl Debug for GatewayService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GatewayService{{control:{:?},generic:{:?},aux:{:?}}}", self.control, self.generic, self.aux)
    }
}

impl GatewayService {
    pub fn new(config: Arc<GatewayConfig>, control: PeerLink<ControlCodec>, generic: PeerLink<GenericCodec>, aux: PeerLink<ControlCodec>) -> GatewayService {
        GatewayService {
            config,
            control,
            generic,
            aux,
        }
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn control(&self) -> &PeerLink<ControlCodec> {
        &self.control
    }

    pub fn generic(&self) -> &PeerLink<GenericCodec> {
        &self.generic
    }

    pub fn aux(&self) -> &PeerLink<ControlCodec> {
        &self.aux
    }

    pub async fn play_animation(&self, name: &str, loops: u32) -> Result<AnimationResult, RequestError> {
        let request = GatewayMessage::PlayAnimationRequest {
            name: name.to_string(),
            loops,
        };
        let response = self.generic.correlator
            .request(&request, GatewayTag::PlayAnimationResponse, self.config.request_timeout)
            .await?;

        match response {
            GatewayMessage::PlayAnimationResponse { result, .. } => Ok(result),
            other => Err(RequestError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// the names of all animations the robot knows
    pub async fn list_animations(&self) -> Result<Vec<String>, RequestError> {
        let items = self.generic.correlator
            .request_collect(
                &GatewayMessage::ListAnimationsRequest,
                GatewayTag::AnimationAvailable,
                GatewayTag::EndOfListAnimations,
                self.config.list_animations_capacity,
                self.config.request_timeout,
            )
            .await?;

        let names = items.into_iter()
            .filter_map(|msg| match msg {
                GatewayMessage::AnimationAvailable { name } => Some(name),
                _ => None,
            })
            .collect::<Vec<_>>();
        debug!("{} animations available", names.len());
        Ok(names)
    }

    /// Only one settings update can be in flight at any time: a concurrent call fails with
    ///  [RequestError::AlreadyInProgress].
    pub async fn update_settings(&self, settings: BTreeMap<String, String>) -> Result<SettingsUpdate, RequestError> {
        let request = GatewayMessage::UpdateSettingsRequest { settings };
        let response = self.generic.correlator
            .request_unique(&request, GatewayTag::UpdateSettingsResponse, self.config.settings_request_timeout)
            .await?;

        match response {
            GatewayMessage::UpdateSettingsResponse { result, version } => Ok(SettingsUpdate { result, version }),
            other => Err(RequestError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn send_control(&self, msg: &ControlMessage) {
        self.control.send(msg).await
    }

    pub async fn send_generic(&self, msg: &GatewayMessage) {
        self.generic.send(msg).await
    }

    pub async fn send_aux(&self, msg: &ControlMessage) {
        self.aux.send(msg).await
    }
}
