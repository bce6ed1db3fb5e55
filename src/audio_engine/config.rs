//! Engine configuration.

use std::time::Duration;

use crate::audio_engine::constants::{
    CAPTURE_CHUNK_SIZE, DEFAULT_BUFFER_LATENCY_MS, DEFAULT_CHANNEL_SAMPLE_RATE,
    DEFAULT_PLAYBACK_SAMPLE_RATE, MAX_BUFFER_LATENCY_MS, MAX_SAMPLE_RATE, MONO,
    SECONDARY_BUFFER_SIZE, STEREO, TICK_INTERVAL,
};
use crate::audio_engine::errors::EngineError;

/// How a secondary buffer stores its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMode {
    /// Regular streaming ring; data is consumed once.
    #[default]
    Stream,

    /// Pre-filled clip that replays in a loop until stopped.
    Loop,
}

/// Which resampling engine every channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerQuality {
    /// Band-limited sinc interpolation.
    #[default]
    Sinc,

    /// Linear interpolation. Cheap and deterministic.
    Linear,
}

/// How channel contributions are accumulated into the output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixSummation {
    /// Plain two's complement addition; loud mixes wrap around.
    #[default]
    Wrapping,

    /// Clamp the running sum to the i16 range.
    Saturating,
}

/// Configuration for an [`AudioEngine`](crate::audio_engine::AudioEngine).
///
/// Use [`EngineConfig::default()`] and the `with_*` methods to customize.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of secondary buffers. Fixed for the engine's lifetime.
    pub num_buffers: usize,

    /// Rate requested from the playback device.
    /// Default: 44100
    pub playback_sample_rate: u32,

    /// Latency interval in milliseconds, `0 < ms < 1000`.
    /// Default: 50
    pub buffer_latency_ms: u32,

    /// Ring capacity of each secondary buffer in bytes.
    pub secondary_buffer_size: usize,

    /// Per-channel buffer mode. Channels past the end of the list stream.
    pub buffer_modes: Vec<BufferMode>,

    pub resampler_quality: ResamplerQuality,

    pub mix_summation: MixSummation,

    /// Sleep between two passes of the tick loop.
    pub tick_interval: Duration,

    /// Rate requested from the capture device.
    pub capture_sample_rate: u32,

    /// Rate handed to the recording callback.
    pub record_sample_rate: u32,

    /// Interleaved channels read from the capture device.
    pub capture_channels: usize,

    /// Cap for one capture chunk in bytes.
    pub max_capture_chunk_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_buffers: 8,
            playback_sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
            buffer_latency_ms: DEFAULT_BUFFER_LATENCY_MS,
            secondary_buffer_size: SECONDARY_BUFFER_SIZE,
            buffer_modes: Vec::new(),
            resampler_quality: ResamplerQuality::default(),
            mix_summation: MixSummation::default(),
            tick_interval: TICK_INTERVAL,
            capture_sample_rate: DEFAULT_CHANNEL_SAMPLE_RATE,
            record_sample_rate: DEFAULT_CHANNEL_SAMPLE_RATE,
            capture_channels: MONO,
            max_capture_chunk_bytes: CAPTURE_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_num_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    #[must_use]
    pub fn with_playback_sample_rate(mut self, rate: u32) -> Self {
        self.playback_sample_rate = rate;
        self
    }

    #[must_use]
    pub fn with_buffer_latency_ms(mut self, ms: u32) -> Self {
        self.buffer_latency_ms = ms;
        self
    }

    #[must_use]
    pub fn with_secondary_buffer_size(mut self, bytes: usize) -> Self {
        self.secondary_buffer_size = bytes;
        self
    }

    /// Marks `channel` as a loop buffer, growing the mode list as needed.
    #[must_use]
    pub fn with_loop_channel(mut self, channel: usize) -> Self {
        if self.buffer_modes.len() <= channel {
            self.buffer_modes.resize(channel + 1, BufferMode::Stream);
        }
        self.buffer_modes[channel] = BufferMode::Loop;
        self
    }

    #[must_use]
    pub fn with_resampler_quality(mut self, quality: ResamplerQuality) -> Self {
        self.resampler_quality = quality;
        self
    }

    #[must_use]
    pub fn with_mix_summation(mut self, summation: MixSummation) -> Self {
        self.mix_summation = summation;
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn with_capture(mut self, device_rate: u32, record_rate: u32, channels: usize) -> Self {
        self.capture_sample_rate = device_rate;
        self.record_sample_rate = record_rate;
        self.capture_channels = channels;
        self
    }

    /// Buffer mode of `channel`.
    pub fn mode_for(&self, channel: usize) -> BufferMode {
        self.buffer_modes.get(channel).copied().unwrap_or_default()
    }

    /// Checks every field against the engine's limits.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.num_buffers == 0 {
            return Err(EngineError::InvalidConfig(
                "at least one buffer is required".to_string(),
            ));
        }
        validate_latency_ms(i64::from(self.buffer_latency_ms))?;
        for rate in [
            self.playback_sample_rate,
            self.capture_sample_rate,
            self.record_sample_rate,
        ] {
            validate_sample_rate(rate)?;
        }
        if self.secondary_buffer_size == 0 || self.secondary_buffer_size % 2 != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "secondary buffer size must be a positive even byte count, got {}",
                self.secondary_buffer_size
            )));
        }
        if !(MONO..=STEREO).contains(&self.capture_channels) {
            return Err(EngineError::InvalidConfig(format!(
                "capture channels must be 1 or 2, got {}",
                self.capture_channels
            )));
        }
        if self.max_capture_chunk_bytes < 2 {
            return Err(EngineError::InvalidConfig(
                "capture chunk must hold at least one sample".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rejects latencies outside `(0, 1000)` milliseconds.
pub fn validate_latency_ms(ms: i64) -> Result<u32, EngineError> {
    if ms <= 0 || ms >= i64::from(MAX_BUFFER_LATENCY_MS) {
        return Err(EngineError::LatencyOutOfRange(ms));
    }
    Ok(ms as u32)
}

/// Rejects zero rates and rates above [`MAX_SAMPLE_RATE`].
pub fn validate_sample_rate(rate: u32) -> Result<u32, EngineError> {
    if rate == 0 || rate > MAX_SAMPLE_RATE {
        return Err(EngineError::SampleRateOutOfRange(rate));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_latency_ms, 50);
        assert_eq!(config.playback_sample_rate, 44_100);
        assert_eq!(config.secondary_buffer_size, 32768);
        assert_eq!(config.mix_summation, MixSummation::Wrapping);
    }

    #[test]
    fn test_latency_bounds() {
        assert!(validate_latency_ms(0).is_err());
        assert!(validate_latency_ms(-5).is_err());
        assert!(validate_latency_ms(1000).is_err());
        assert_eq!(validate_latency_ms(1).ok(), Some(1));
        assert_eq!(validate_latency_ms(999).ok(), Some(999));
    }

    #[test]
    fn test_sample_rate_bounds() {
        assert!(validate_sample_rate(0).is_err());
        assert!(validate_sample_rate(MAX_SAMPLE_RATE + 1).is_err());
        assert!(validate_sample_rate(8000).is_ok());
    }

    #[test]
    fn test_loop_channel_modes() {
        let config = EngineConfig::default().with_loop_channel(2);
        assert_eq!(config.mode_for(0), BufferMode::Stream);
        assert_eq!(config.mode_for(2), BufferMode::Loop);
        assert_eq!(config.mode_for(7), BufferMode::Stream);
    }

    #[test]
    fn test_validate_rejects_zero_buffers() {
        let config = EngineConfig::default().with_num_buffers(0);
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_odd_capacity() {
        let config = EngineConfig::default().with_secondary_buffer_size(1001);
        assert!(config.validate().is_err());
    }
}
