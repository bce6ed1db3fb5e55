//! Silence top-up for playing channels.
//!
//! Before every mixing pass each playing stream channel that holds less than
//! one chunk gets a chunk of silence, so the mixer never reads a starved
//! channel. Loop channels replay their clip and are left alone.

use crate::audio_engine::channel::Channel;
use crate::audio_engine::config::BufferMode;
use crate::audio_engine::metrics::{EngineMetrics, bump};

/// Keeps playing channels from running dry.
#[derive(Default)]
pub struct BufferMonitor {
    silence: Vec<u8>,
}

impl BufferMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tops up every starving channel and returns how many were filled.
    pub fn run(&mut self, channels: &[Channel], metrics: &EngineMetrics) -> usize {
        let mut filled = 0;
        for channel in channels {
            let mut state = channel.lock();
            if !state.is_playing || state.ring.mode() == BufferMode::Loop {
                continue;
            }

            let chunk = state.chunk_size;
            if chunk == 0 || state.ring.read_available() >= chunk {
                continue;
            }

            if self.silence.len() < chunk {
                self.silence.resize(chunk, 0);
            }
            let written = state.ring.write(&self.silence[..chunk]);
            if written < chunk {
                bump(&metrics.fill_overflows);
                log::debug!(
                    "Channel {}: silence top-up truncated ({written} of {chunk} bytes)",
                    channel.index()
                );
            }
            bump(&metrics.silence_fills);
            filled += 1;
        }
        filled
    }
}
