use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory that holds the peers' listening sockets. Each peer's socket is the file named
    ///  after the peer's suffix inside this directory.
    pub socket_dir: PathBuf,
    pub control_socket_suffix: String,
    pub generic_socket_suffix: String,
    pub aux_socket_suffix: String,

    /// Pause between attempts to connect to a peer socket that does not exist (yet). Startup
    ///  blocks until every peer is up.
    pub connect_retry_interval: Duration,

    /// Upper bound for enqueueing a single message to a single subscriber. A subscriber that
    ///  does not drain its queue within this time loses the message.
    pub publish_timeout: Duration,

    pub request_timeout: Duration,
    pub settings_request_timeout: Duration,

    /// queue capacity for collecting 'animation available' messages
    pub list_animations_capacity: usize,
    /// queue capacity for chunked media subscriptions
    pub feed_capacity: usize,

    pub keepalive_interval: Duration,

    /// Preallocated buffer size for one group of audio chunks (1600 16-bit samples)
    pub audio_block_size: usize,
}

impl GatewayConfig {
    pub fn new() -> GatewayConfig {
        GatewayConfig {
            socket_dir: PathBuf::from("/dev/socket/"),
            control_socket_suffix: "_engine_gateway_server_".to_string(),
            generic_socket_suffix: "_engine_gateway_proto_server_".to_string(),
            aux_socket_suffix: "_switchboard_gateway_server_".to_string(),
            connect_retry_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
            settings_request_timeout: Duration::from_secs(10),
            list_animations_capacity: 500,
            feed_capacity: 64,
            keepalive_interval: Duration::from_secs(1),
            audio_block_size: 1600 * 2,
        }
    }

    pub fn with_socket_dir(mut self, socket_dir: impl Into<PathBuf>) -> GatewayConfig {
        self.socket_dir = socket_dir.into();
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, suffix) in [
            ("control", &self.control_socket_suffix),
            ("generic", &self.generic_socket_suffix),
            ("aux", &self.aux_socket_suffix),
        ] {
            if suffix.is_empty() {
                bail!("{} socket suffix must not be empty", name);
            }
        }

        for (name, duration) in [
            ("connect retry interval", self.connect_retry_interval),
            ("publish timeout", self.publish_timeout),
            ("request timeout", self.request_timeout),
            ("settings request timeout", self.settings_request_timeout),
            ("keepalive interval", self.keepalive_interval),
        ] {
            if duration.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.list_animations_capacity == 0 || self.feed_capacity == 0 {
            bail!("queue capacities must be greater than zero");
        }
        if self.audio_block_size == 0 {
            bail!("audio block size must be greater than zero");
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        GatewayConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::empty_suffix(|c: &mut GatewayConfig| c.generic_socket_suffix.clear())]
    #[case::zero_publish_timeout(|c: &mut GatewayConfig| c.publish_timeout = Duration::ZERO)]
    #[case::zero_keepalive(|c: &mut GatewayConfig| c.keepalive_interval = Duration::ZERO)]
    #[case::zero_feed_capacity(|c: &mut GatewayConfig| c.feed_capacity = 0)]
    #[case::zero_audio_block(|c: &mut GatewayConfig| c.audio_block_size = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut GatewayConfig)) {
        let mut config = GatewayConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
