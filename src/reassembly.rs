//! Reassembly of chunked media (camera images, audio blocks) from a stream of chunk messages.
//!
//! A group of chunks is accepted only if its chunks arrive contiguously, starting at index 0,
//!  up to the last index the chunks declare. Anything else - a gap, a repeated index, a chunk
//!  of some other group - discards the group in progress, and the reassembler ignores chunks
//!  until the next index 0 starts a fresh group.

use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec::control::AudioChunk;
use crate::codec::generic::ImageChunk;
use crate::dispatch::Subscription;

/// Preallocation is a hint from the peer, so it is capped. Groups that turn out bigger still work.
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

/// A message that is one chunk of a group
pub trait Chunk {
    /// per-group data that is taken from the group's first chunk
    type Meta: Clone + Debug + Send + 'static;

    fn group_id(&self) -> u32;
    fn chunk_index(&self) -> u32;
    fn total_chunks(&self) -> u32;
    fn payload(&self) -> &Bytes;
    fn meta(&self) -> Self::Meta;
}

/// Derives the expected size of a group's data from its first chunk
pub trait ChunkSizing<C>: Send {
    fn buffer_size(&self, first: &C) -> usize;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ImageMeta {
    pub frame_time_stamp: u32,
    pub width: u32,
    pub height: u32,
}

impl Chunk for ImageChunk {
    type Meta = ImageMeta;

    fn group_id(&self) -> u32 {
        self.image_id
    }
    fn chunk_index(&self) -> u32 {
        self.chunk_id
    }
    fn total_chunks(&self) -> u32 {
        self.image_chunk_count
    }
    fn payload(&self) -> &Bytes {
        &self.data
    }
    fn meta(&self) -> ImageMeta {
        ImageMeta {
            frame_time_stamp: self.frame_time_stamp,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AudioMeta {
    pub signal_power: u16,
}

impl Chunk for AudioChunk {
    type Meta = AudioMeta;

    fn group_id(&self) -> u32 {
        self.group_id
    }
    fn chunk_index(&self) -> u32 {
        self.chunk_id.into()
    }
    fn total_chunks(&self) -> u32 {
        self.audio_chunk_count.into()
    }
    fn payload(&self) -> &Bytes {
        &self.data
    }
    fn meta(&self) -> AudioMeta {
        AudioMeta {
            signal_power: self.signal_power,
        }
    }
}

/// RGB, 3 bytes per pixel
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSizing;

impl ChunkSizing<ImageChunk> for ImageSizing {
    fn buffer_size(&self, first: &ImageChunk) -> usize {
        (first.width as usize)
            .saturating_mul(first.height as usize)
            .saturating_mul(3)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioSizing {
    pub block_size: usize,
}

impl ChunkSizing<AudioChunk> for AudioSizing {
    fn buffer_size(&self, _first: &AudioChunk) -> usize {
        self.block_size
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompletePayload<Meta> {
    pub group_id: u32,
    pub data: Bytes,
    pub meta: Meta,
}

#[derive(Debug)]
enum ReassemblyState<Meta> {
    /// `resync` is set after a broken group, until the next index 0 arrives
    Idle { resync: bool },
    Accumulating {
        group_id: u32,
        last_index: u32,
        buffer: BytesMut,
        meta: Meta,
    },
}

pub struct ChunkReassembler<C: Chunk, S: ChunkSizing<C>> {
    sizing: S,
    state: ReassemblyState<C::Meta>,
    _chunk: PhantomData<fn(&C)>,
}

impl <C: Chunk, S: ChunkSizing<C>> ChunkReassembler<C, S> {
    pub fn new(sizing: S) -> ChunkReassembler<C, S> {
        ChunkReassembler {
            sizing,
            state: ReassemblyState::Idle { resync: false },
            _chunk: PhantomData,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ReassemblyState::Idle { .. })
    }

    /// Feeds the next chunk, returning the group's complete data if this was the group's last chunk.
    pub fn on_chunk(&mut self, chunk: &C) -> Option<CompletePayload<C::Meta>> {
        let group_id = chunk.group_id();
        let chunk_index = chunk.chunk_index();
        let total_chunks = chunk.total_chunks();

        if total_chunks == 0 || chunk_index >= total_chunks {
            warn!(group_id, chunk_index, total_chunks, "invalid chunk numbering - discarding group");
            self.state = ReassemblyState::Idle { resync: true };
            return None;
        }

        match &mut self.state {
            ReassemblyState::Idle { resync } => {
                if chunk_index != 0 {
                    if *resync {
                        trace!(group_id, chunk_index, "waiting for the start of a new group");
                    }
                    else {
                        warn!(group_id, chunk_index, "broken stream: group does not start with chunk 0");
                        *resync = true;
                    }
                    return None;
                }
                self.start_group(chunk);
            }
            ReassemblyState::Accumulating { group_id: current_group, last_index, buffer, .. } => {
                if chunk_index == 0 {
                    debug!(previous_group = *current_group, group_id, "new group started before the previous one was complete - final chunk was lost");
                    self.start_group(chunk);
                }
                else if chunk_index != *last_index + 1 || group_id != *current_group {
                    warn!(current_group = *current_group, expected_index = *last_index + 1, group_id, chunk_index, "missing chunks - discarding group");
                    self.state = ReassemblyState::Idle { resync: true };
                    return None;
                }
                else {
                    buffer.extend_from_slice(chunk.payload());
                    *last_index = chunk_index;
                }
            }
        }

        if chunk_index == total_chunks - 1 {
            return self.complete();
        }
        None
    }

    fn start_group(&mut self, first: &C) {
        let size = self.sizing.buffer_size(first).min(MAX_PREALLOCATION);
        let mut buffer = BytesMut::with_capacity(size);
        buffer.extend_from_slice(first.payload());

        self.state = ReassemblyState::Accumulating {
            group_id: first.group_id(),
            last_index: 0,
            buffer,
            meta: first.meta(),
        };
    }

    fn complete(&mut self) -> Option<CompletePayload<C::Meta>> {
        match std::mem::replace(&mut self.state, ReassemblyState::Idle { resync: false }) {
            ReassemblyState::Accumulating { group_id, buffer, meta, .. } => {
                trace!(group_id, "group complete: {} bytes", buffer.len());
                Some(CompletePayload {
                    group_id,
                    data: buffer.freeze(),
                    meta,
                })
            }
            ReassemblyState::Idle { .. } => None,
        }
    }
}

/// Drives a reassembler from a subscription until either the subscription or the consumer of
///  complete payloads goes away.
///
/// `extract` picks the chunk out of a message; messages it returns `None` for are ignored.
pub async fn run_chunk_feed<T, M, C, S>(
    mut subscription: Subscription<T, M>,
    extract: impl Fn(M) -> Option<C> + Send,
    mut reassembler: ChunkReassembler<C, S>,
    out: mpsc::Sender<CompletePayload<C::Meta>>,
)
where
    T: Copy + Eq + Hash + Debug + Send + Sync + 'static,
    M: Send + 'static,
    C: Chunk + Send,
    S: ChunkSizing<C>,
{
    debug!("starting chunk feed");
    loop {
        select! {
            msg = subscription.recv() => {
                let Some(msg) = msg else {
                    debug!("subscription closed - terminating chunk feed");
                    return;
                };
                let Some(chunk) = extract(msg) else {
                    continue;
                };
                if let Some(complete) = reassembler.on_chunk(&chunk) {
                    if out.send(complete).await.is_err() {
                        debug!("consumer went away - terminating chunk feed");
                        return;
                    }
                }
            }
            _ = out.closed() => {
                debug!("consumer went away - terminating chunk feed");
                return;
            }
        }
    }
}
