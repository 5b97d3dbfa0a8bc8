use tokio::sync::mpsc;
use tracing::{debug, info_span, Instrument};

use crate::codec::control::{AudioChunk, ControlMessage, ControlTag};
use crate::codec::generic::{GatewayMessage, GatewayTag, ImageChunk};
use crate::codec::{MessageCodec, TagOf};
use crate::connection::MessageSender;
use crate::reassembly::{run_chunk_feed, AudioMeta, AudioSizing, Chunk, ChunkReassembler, ChunkSizing, CompletePayload, ImageMeta, ImageSizing};
use crate::service::{GatewayService, PeerLink};

/// complete payloads buffered for a slow consumer
const FEED_OUTPUT_CAPACITY: usize = 2;

pub type CameraFeed = mpsc::Receiver<CompletePayload<ImageMeta>>;
pub type AudioFeed = mpsc::Receiver<CompletePayload<AudioMeta>>;

impl GatewayService {
    /// Starts image streaming and returns complete camera images. Streaming is switched off
    ///  again when the last consumer drops its receiver.
    pub async fn camera_feed(&self) -> anyhow::Result<CameraFeed> {
        start_feed(
            &self.generic,
            GatewayTag::ImageChunk,
            |enable| GatewayMessage::EnableImageStreaming { enable },
            extract_image_chunk,
            ImageSizing,
            self.config.feed_capacity,
            "camera_feed",
        ).await
    }

    /// Starts audio streaming and returns complete blocks of audio samples. Streaming is
    ///  switched off again when the last consumer drops its receiver.
    pub async fn audio_feed(&self) -> anyhow::Result<AudioFeed> {
        start_feed(
            &self.control,
            ControlTag::AudioChunk,
            |enable| ControlMessage::EnableAudioStreaming { enable },
            extract_audio_chunk,
            AudioSizing { block_size: self.config.audio_block_size },
            self.config.feed_capacity,
            "audio_feed",
        ).await
    }
}

fn extract_image_chunk(msg: GatewayMessage) -> Option<ImageChunk> {
    match msg {
        GatewayMessage::ImageChunk(chunk) => Some(chunk),
        _ => None,
    }
}

fn extract_audio_chunk(msg: ControlMessage) -> Option<AudioChunk> {
    match msg {
        ControlMessage::AudioChunk(chunk) => Some(chunk),
        _ => None,
    }
}

async fn start_feed<C, K, S>(
    link: &PeerLink<C>,
    tag: TagOf<C>,
    streaming: fn(bool) -> C::Message,
    extract: fn(C::Message) -> Option<K>,
    sizing: S,
    capacity: usize,
    name: &'static str,
) -> anyhow::Result<mpsc::Receiver<CompletePayload<K::Meta>>>
where
    C: MessageCodec,
    K: Chunk + Send + 'static,
    S: ChunkSizing<K> + 'static,
{
    let mut consumers = link.feed_consumers.lock().await;

    // subscribe before switching streaming on, so the first chunks are not lost
    let subscription = link.registry.subscribe(tag, capacity);
    link.connection.try_send(&streaming(true)).await?;
    *consumers.entry(tag).or_default() += 1;
    drop(consumers);

    let (out_send, out_recv) = mpsc::channel(FEED_OUTPUT_CAPACITY);
    let feed_consumers = link.feed_consumers.clone();
    let connection = link.connection.clone();

    tokio::spawn(async move {
        run_chunk_feed(subscription, extract, ChunkReassembler::new(sizing), out_send).await;

        let mut consumers = feed_consumers.lock().await;
        let Some(num_consumers) = consumers.get_mut(&tag) else {
            return;
        };
        *num_consumers -= 1;
        if *num_consumers == 0 {
            consumers.remove(&tag);
            debug!("last consumer is gone - switching streaming off");
            connection.send(&streaming(false)).await;
        }
    }.instrument(info_span!("feed", name)));

    Ok(out_recv)
}
