//! Secondary buffers.
//!
//! A [`Channel`] is one independently controlled mono stream. Everything it
//! owns (ring, resampler, volume, pan, rate, chunk size, peak) sits behind a
//! single mutex, so the mixer always sees a consistent snapshot and
//! application threads can call any setter while the tick loop runs.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::audio_engine::config::{BufferMode, ResamplerQuality, validate_sample_rate};
use crate::audio_engine::constants::{
    BYTES_PER_WORD, DEFAULT_CHANNEL_SAMPLE_RATE, MONO, PAN_MAX, PAN_MIN, VOLUME_MAX, VOLUME_MIN,
};
use crate::audio_engine::errors::{EngineError, ResampleError};
use crate::audio_engine::resampler::ResamplingAdapter;
use crate::audio_engine::ring_buffer::SecondaryRing;

/// Bytes covering one latency interval at `sample_rate`, forced even.
pub fn chunk_size_for(sample_rate: u32, bytes_per_sample: usize, latency_ms: u32) -> usize {
    let bytes =
        u64::from(sample_rate) * bytes_per_sample as u64 * u64::from(latency_ms) / 1000;
    (bytes as usize) & !1
}

/// Mutable state of a channel. Only reachable through [`Channel::lock`].
pub struct ChannelState {
    pub(crate) sample_rate: u32,
    pub(crate) volume: i32,
    pub(crate) pan: i32,
    pub(crate) bytes_per_sample: usize,
    pub(crate) chunk_size: usize,
    pub(crate) is_playing: bool,
    pub(crate) peak: i32,
    pub(crate) ring: SecondaryRing,
    pub(crate) resampler: ResamplingAdapter,
    latency_ms: u32,
}

impl ChannelState {
    fn recompute_chunk_size(&mut self) {
        self.chunk_size = chunk_size_for(self.sample_rate, self.bytes_per_sample, self.latency_ms);
    }

    fn write(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let written = self.ring.write(data);
        if written != data.len() {
            return Err(EngineError::BufferOverflow {
                written,
                requested: data.len(),
            });
        }
        Ok(())
    }
}

/// One secondary buffer.
pub struct Channel {
    index: usize,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Creates a stopped channel at full volume, centered, 16-bit, 44.1 kHz.
    pub fn new(
        index: usize,
        mode: BufferMode,
        capacity: usize,
        quality: ResamplerQuality,
        latency_ms: u32,
    ) -> Result<Self, ResampleError> {
        let mut state = ChannelState {
            sample_rate: DEFAULT_CHANNEL_SAMPLE_RATE,
            volume: VOLUME_MAX,
            pan: 0,
            bytes_per_sample: BYTES_PER_WORD,
            chunk_size: 0,
            is_playing: false,
            peak: 0,
            ring: SecondaryRing::new(mode, capacity),
            resampler: ResamplingAdapter::new(quality, MONO)?,
            latency_ms,
        };
        state.recompute_chunk_size();

        Ok(Self {
            index,
            state: Mutex::new(state),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Locks the whole channel.
    ///
    /// A panic while the lock was held leaves plain data behind, so a
    /// poisoned lock is taken over rather than propagated.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues PCM data, switching the channel to `source_sample_rate` first
    /// when it differs from the current rate.
    ///
    /// A truncated write keeps the bytes that fit and reports
    /// [`EngineError::BufferOverflow`].
    pub fn fill(&self, data: &[u8], source_sample_rate: u32) -> Result<(), EngineError> {
        validate_length(data.len())?;
        let mut state = self.lock();
        if source_sample_rate != state.sample_rate {
            state.sample_rate = validate_sample_rate(source_sample_rate)?;
            state.recompute_chunk_size();
        }
        state.write(data)
    }

    /// Queues `len` bytes of silence.
    pub fn fill_silence(&self, len: usize) -> Result<(), EngineError> {
        validate_length(len)?;
        let silence = vec![0u8; len];
        self.lock().write(&silence)
    }

    pub fn set_volume(&self, volume: i32) -> Result<(), EngineError> {
        if !(VOLUME_MIN..=VOLUME_MAX).contains(&volume) {
            return Err(EngineError::VolumeOutOfRange(volume));
        }
        self.lock().volume = volume;
        Ok(())
    }

    pub fn volume(&self) -> i32 {
        self.lock().volume
    }

    pub fn set_pan(&self, pan: i32) -> Result<(), EngineError> {
        if !(PAN_MIN..=PAN_MAX).contains(&pan) {
            return Err(EngineError::PanOutOfRange(pan));
        }
        self.lock().pan = pan;
        Ok(())
    }

    pub fn pan(&self) -> i32 {
        self.lock().pan
    }

    /// Sets the source rate of queued data and recomputes the chunk size.
    pub fn set_sample_rate(&self, rate: u32) -> Result<(), EngineError> {
        let rate = validate_sample_rate(rate)?;
        let mut state = self.lock();
        state.sample_rate = rate;
        state.recompute_chunk_size();
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    /// Peak absolute sample of the last mixed chunk.
    pub fn peak(&self) -> i32 {
        self.lock().peak
    }

    pub fn chunk_size(&self) -> usize {
        self.lock().chunk_size
    }

    pub(crate) fn set_latency_ms(&self, latency_ms: u32) {
        let mut state = self.lock();
        state.latency_ms = latency_ms;
        state.recompute_chunk_size();
    }

    pub fn play(&self) {
        self.lock().is_playing = true;
    }

    /// Stops the channel. Loop buffers also drop their clip.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.is_playing = false;
        state.peak = 0;
        if state.ring.mode() == BufferMode::Loop {
            state.ring.empty();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock().is_playing
    }

    pub fn mode(&self) -> BufferMode {
        self.lock().ring.mode()
    }

    /// Bytes waiting to be mixed.
    pub fn queued_bytes(&self) -> usize {
        self.lock().ring.read_available()
    }

    /// Bytes that can be queued before the ring is full.
    pub fn writable_bytes(&self) -> usize {
        self.lock().ring.write_available()
    }
}

fn validate_length(len: usize) -> Result<(), EngineError> {
    if len == 0 || len % 2 != 0 {
        return Err(EngineError::InvalidLength(len));
    }
    Ok(())
}
