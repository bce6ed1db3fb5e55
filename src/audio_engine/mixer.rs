//! Mixing of secondary buffers into the primary stereo stream.
//!
//! Once per tick the [`Mixer`] reads one latency interval from every playing
//! [`Channel`], resamples it to the device rate, applies volume and pan and
//! sums it into an interleaved 16-bit stereo frame buffer that is then handed
//! to the [`Sink`].

use crate::audio_engine::channel::Channel;
use crate::audio_engine::config::MixSummation;
use crate::audio_engine::constants::{
    BYTES_PER_WORD, MAX_SAMPLE_RATE, MONO, OUTPUT_FRAME_BYTES, STEREO, VOLUME_MIN,
};
use crate::audio_engine::device::{Readiness, Sink, ensure_running, write_all};
use crate::audio_engine::errors::EngineError;
use crate::audio_engine::metrics::{EngineMetrics, bump};

/// Left and right gain multipliers for one channel.
///
/// Pan only attenuates the side being panned away from; the other side keeps
/// the base gain.
pub fn channel_gains(volume: i32, pan: i32, master_volume: i32) -> (f32, f32) {
    let range = -VOLUME_MIN as f32;
    let base = (volume as f32 + range) / range * (master_volume as f32 + range) / range;
    if pan < 0 {
        (base, base * (pan + 1000) as f32 / 1000.0)
    } else {
        (base * (1000 - pan) as f32 / 1000.0, base)
    }
}

/// Frames produced per tick at `playback_rate`, forced even.
pub fn target_frames(playback_rate: u32, latency_ms: u32) -> usize {
    ((u64::from(playback_rate) * u64::from(latency_ms) / 1000) as usize) & !1
}

/// Bytes of interleaved stereo output for one latency interval.
pub fn full_length(playback_rate: u32, latency_ms: u32) -> usize {
    target_frames(playback_rate, latency_ms) * OUTPUT_FRAME_BYTES
}

/// Bytes of one mono plane at the highest supported rate.
pub fn max_buffer_size(latency_ms: u32) -> usize {
    ((u64::from(MAX_SAMPLE_RATE) * u64::from(latency_ms) / 1000) as usize + 1) * BYTES_PER_WORD
}

/// Global parameters of one mixing pass.
#[derive(Debug, Clone, Copy)]
pub struct MixParams {
    pub playback_sample_rate: u32,
    pub latency_ms: u32,
    pub master_volume: i32,
}

/// What a mixing pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No channel is playing; the sink was not touched.
    Idle,
    /// Device setup or priming happened instead of mixing.
    Deferred,
    /// An xrun was recovered instead of mixing.
    Recovered,
    /// The device buffer already holds more than one latency interval.
    Saturated,
    /// A mixed frame buffer was written.
    Mixed,
}

/// Mixing state reused across ticks.
pub struct Mixer {
    summation: MixSummation,
    output: Vec<i16>,
    out_bytes: Vec<u8>,
    scratch: Vec<u8>,
    silence: Vec<u8>,
}

impl Mixer {
    pub fn new(summation: MixSummation) -> Self {
        Self {
            summation,
            output: Vec::new(),
            out_bytes: Vec::new(),
            scratch: Vec::new(),
            silence: Vec::new(),
        }
    }

    /// Sizes the reusable buffers for `latency_ms`.
    fn reserve(&mut self, full_length: usize, latency_ms: u32) {
        if self.silence.len() != full_length {
            self.silence.clear();
            self.silence.resize(full_length, 0);
        }
        let scratch_len = max_buffer_size(latency_ms);
        if self.scratch.len() < scratch_len {
            self.scratch.resize(scratch_len, 0);
        }
    }

    /// Runs one mixing pass.
    ///
    /// # Returns
    ///
    /// What the pass did. Only fatal device errors are returned as `Err`;
    /// xruns, suspends and transient "full" answers are handled here.
    pub fn process_sound_buffer<S: Sink + ?Sized>(
        &mut self,
        channels: &[Channel],
        sink: &mut S,
        params: MixParams,
        metrics: &EngineMetrics,
    ) -> Result<TickOutcome, EngineError> {
        bump(&metrics.ticks);
        if !channels.iter().any(Channel::is_playing) {
            bump(&metrics.idle_ticks);
            return Ok(TickOutcome::Idle);
        }

        let frames = target_frames(params.playback_sample_rate, params.latency_ms);
        let full_length = frames * OUTPUT_FRAME_BYTES;
        self.reserve(full_length, params.latency_ms);

        let readiness = ensure_running(sink, &self.silence, OUTPUT_FRAME_BYTES, metrics)
            .inspect_err(|e| {
                bump(&metrics.fatal_errors);
                log::error!("Playback device failed: {e}");
            })?;
        match readiness {
            Readiness::Ready => {}
            Readiness::Deferred => {
                bump(&metrics.deferred_ticks);
                return Ok(TickOutcome::Deferred);
            }
            Readiness::Recovered => return Ok(TickOutcome::Recovered),
        }

        let available = sink.available_frames()?;
        let queued = sink.buffer_frames().saturating_sub(available);
        let latency_frames =
            (u64::from(params.playback_sample_rate) * u64::from(params.latency_ms) / 1000) as usize;
        if queued > latency_frames {
            bump(&metrics.saturated_ticks);
            return Ok(TickOutcome::Saturated);
        }

        self.output.clear();
        self.output.resize(frames * STEREO, 0);

        for channel in channels {
            self.mix_channel(channel, frames, params.master_volume, metrics);
        }

        self.out_bytes.clear();
        self.out_bytes
            .extend(self.output.iter().flat_map(|sample| sample.to_le_bytes()));

        write_all(
            sink,
            &self.out_bytes,
            &self.silence,
            OUTPUT_FRAME_BYTES,
            metrics,
        )
        .inspect_err(|e| {
            bump(&metrics.fatal_errors);
            log::error!("Failed to write mixed output: {e}");
        })?;

        bump(&metrics.mixed_ticks);
        Ok(TickOutcome::Mixed)
    }

    /// Reads, resamples and sums one channel under its lock.
    fn mix_channel(
        &mut self,
        channel: &Channel,
        target_full: usize,
        master_volume: i32,
        metrics: &EngineMetrics,
    ) {
        let mut state = channel.lock();
        if !state.is_playing {
            return;
        }

        let (left_gain, right_gain) = channel_gains(state.volume, state.pan, master_volume);
        let requested = (state.chunk_size & !1).min(self.scratch.len());
        if requested == 0 {
            return;
        }

        let read = state.ring.read(&mut self.scratch[..requested]) & !1;
        if read == 0 {
            bump(&metrics.empty_reads);
            state.peak = 0;
            return;
        }

        let target = if read == requested {
            target_full
        } else {
            bump(&metrics.short_reads);
            (target_full * read / requested) & !1
        };
        if target == 0 {
            return;
        }

        let bytes_per_sample = state.bytes_per_sample;
        let source = read / bytes_per_sample;
        state.peak = self.scratch[..read]
            .chunks_exact(BYTES_PER_WORD)
            .map(|b| i32::from(i16::from_le_bytes([b[0], b[1]])).abs())
            .max()
            .unwrap_or(0);

        let resampled = match state.resampler.resample(
            &self.scratch[..read],
            source,
            target,
            bytes_per_sample,
            MONO,
        ) {
            Ok(resampled) => resampled,
            Err(e) => {
                bump(&metrics.resample_failures);
                log::debug!("Channel {}: resample failed: {e}", channel.index());
                return;
            }
        };

        let add: fn(i16, i16) -> i16 = match self.summation {
            MixSummation::Wrapping => i16::wrapping_add,
            MixSummation::Saturating => i16::saturating_add,
        };
        for (frame, bytes) in self
            .output
            .chunks_exact_mut(STEREO)
            .zip(resampled.chunks_exact(BYTES_PER_WORD))
        {
            let sample = f32::from(i16::from_le_bytes([bytes[0], bytes[1]]));
            frame[0] = add(frame[0], (sample * left_gain).round() as i16);
            frame[1] = add(frame[1], (sample * right_gain).round() as i16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::config::{BufferMode, ResamplerQuality};
    use crate::audio_engine::device::{DeviceState, Sink};
    use crate::audio_engine::mock::{MockSink, SinkCall};

    const RATE: u32 = 44_100;

    fn params(latency_ms: u32) -> MixParams {
        MixParams {
            playback_sample_rate: RATE,
            latency_ms,
            master_volume: 0,
        }
    }

    fn channels(count: usize, latency_ms: u32) -> Vec<Channel> {
        (0..count)
            .map(|i| {
                Channel::new(
                    i,
                    BufferMode::Stream,
                    32768,
                    ResamplerQuality::Linear,
                    latency_ms,
                )
                .unwrap()
            })
            .collect()
    }

    fn running_sink() -> MockSink {
        let mut sink = MockSink::new();
        sink.open(None).unwrap();
        sink.negotiate(RATE, 2, 2).unwrap();
        sink.prepare().unwrap();
        sink.start().unwrap();
        sink.handle().clear_calls();
        sink
    }

    fn pcm(value: i16, count: usize) -> Vec<u8> {
        std::iter::repeat_n(value.to_le_bytes(), count)
            .flatten()
            .collect()
    }

    fn frames(bytes: &[u8]) -> Vec<(i16, i16)> {
        bytes
            .chunks_exact(4)
            .map(|b| {
                (
                    i16::from_le_bytes([b[0], b[1]]),
                    i16::from_le_bytes([b[2], b[3]]),
                )
            })
            .collect()
    }

    #[test]
    fn test_gain_pan_symmetry() {
        let (left, right) = channel_gains(0, 0, 0);
        assert_eq!(left, right);
        assert_eq!(left, 1.0);

        let (left, right) = channel_gains(-4800, 1000, 0);
        assert_eq!(left, 0.0);
        assert_eq!(right, 0.5);

        let (left, right) = channel_gains(-4800, -1000, 0);
        assert_eq!(left, 0.5);
        assert_eq!(right, 0.0);
    }

    #[test]
    fn test_gain_monotonic_in_volume() {
        for pan in [-1000, -300, 0, 450, 1000] {
            for master in [-9600, -2000, 0] {
                let mut previous = channel_gains(-9600, pan, master);
                assert!(previous.0.abs() < 1e-6 && previous.1.abs() < 1e-6);
                for volume in (-9600..=0).step_by(100) {
                    let gains = channel_gains(volume, pan, master);
                    assert!(gains.0 >= previous.0);
                    assert!(gains.1 >= previous.1);
                    previous = gains;
                }
            }
        }
    }

    #[test]
    fn test_pan_never_boosts() {
        for pan in (-1000..=1000).step_by(50) {
            let (left, right) = channel_gains(0, pan, 0);
            assert!(left <= 1.0 && right <= 1.0);
        }
    }

    #[test]
    fn test_output_sizes() {
        assert_eq!(target_frames(44_100, 50), 2204);
        assert_eq!(full_length(44_100, 50), 8816);
        assert_eq!(full_length(48_000, 50) % 4, 0);
        assert!(max_buffer_size(50) >= 2 * 192_000 / 20);
    }

    #[test]
    fn test_idle_tick_does_not_touch_sink() {
        let channels = channels(3, 50);
        let mut sink = running_sink();
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);

        let outcome = mixer
            .process_sound_buffer(&channels, &mut sink, params(50), &metrics)
            .unwrap();
        assert_eq!(outcome, TickOutcome::Idle);
        assert!(sink.handle().calls().is_empty());
        assert_eq!(metrics.snapshot().idle_ticks, 1);
    }

    /// 100 frames per tick: 50 kHz at 2 ms.
    const SCENARIO_RATE: u32 = 50_000;
    const SCENARIO_LATENCY_MS: u32 = 2;

    fn scenario_params() -> MixParams {
        MixParams {
            playback_sample_rate: SCENARIO_RATE,
            latency_ms: SCENARIO_LATENCY_MS,
            master_volume: 0,
        }
    }

    #[test]
    fn test_opposite_pan_scenario() {
        assert_eq!(target_frames(SCENARIO_RATE, SCENARIO_LATENCY_MS), 100);

        let channels = channels(2, SCENARIO_LATENCY_MS);
        channels[0].set_pan(-1000).unwrap();
        channels[1].set_pan(1000).unwrap();
        for (channel, value) in channels.iter().zip([1000, 2000]) {
            channel.fill(&pcm(value, 100), SCENARIO_RATE).unwrap();
            channel.play();
        }

        let mut sink = running_sink();
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);
        let outcome = mixer
            .process_sound_buffer(&channels, &mut sink, scenario_params(), &metrics)
            .unwrap();
        assert_eq!(outcome, TickOutcome::Mixed);

        let payloads = sink.handle().payloads();
        assert_eq!(payloads.len(), 1);
        let mixed = frames(&payloads[0]);
        assert_eq!(mixed.len(), 100);
        assert!(mixed.iter().all(|frame| *frame == (1000, 2000)));
        assert_eq!(channels[0].peak(), 1000);
        assert_eq!(channels[1].peak(), 2000);
        assert_eq!(channels[0].queued_bytes(), 0);
    }

    #[test]
    fn test_loop_channel_repeats_clip() {
        let channel = Channel::new(
            0,
            BufferMode::Loop,
            32768,
            ResamplerQuality::Linear,
            SCENARIO_LATENCY_MS,
        )
        .unwrap();
        let clip = [100i16, 200, 300];
        let bytes: Vec<u8> = clip.iter().flat_map(|s| s.to_le_bytes()).collect();
        channel.fill(&bytes, SCENARIO_RATE).unwrap();
        channel.play();

        let mut sink = running_sink();
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);
        let channels = [channel];
        for _ in 0..2 {
            let outcome = mixer
                .process_sound_buffer(&channels, &mut sink, scenario_params(), &metrics)
                .unwrap();
            assert_eq!(outcome, TickOutcome::Mixed);
        }

        let payloads = sink.handle().payloads();
        assert_eq!(payloads.len(), 2);
        // The second tick picks up the cycle where the first one stopped.
        let mixed: Vec<_> = payloads.iter().flat_map(|p| frames(p)).collect();
        assert_eq!(mixed.len(), 200);
        for (i, frame) in mixed.iter().enumerate() {
            let expected = clip[i % clip.len()];
            assert_eq!(*frame, (expected, expected), "frame {i}");
        }
        assert_eq!(channels[0].queued_bytes(), 6);
        assert_eq!(metrics.snapshot().short_reads, 0);
    }

    #[test]
    fn test_xrun_tick_recovers_without_mixing() {
        let channels = channels(1, 50);
        channels[0].fill(&pcm(500, 4000), RATE).unwrap();
        channels[0].play();

        let mut sink = running_sink();
        sink.handle().set_state(DeviceState::XRun);
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);

        let outcome = mixer
            .process_sound_buffer(&channels, &mut sink, params(50), &metrics)
            .unwrap();
        assert_eq!(outcome, TickOutcome::Recovered);
        assert_eq!(
            sink.handle().calls(),
            vec![
                SinkCall::Prepare,
                SinkCall::Write {
                    bytes: full_length(RATE, 50),
                    silent: true
                },
                SinkCall::Start,
            ]
        );
        // Channel data is untouched until the next tick.
        assert_eq!(channels[0].queued_bytes(), 8000);
    }

    #[test]
    fn test_saturated_device_skips_mixing() {
        let channels = channels(1, 50);
        channels[0].fill(&pcm(500, 4000), RATE).unwrap();
        channels[0].play();

        let mut sink = running_sink();
        sink.handle().set_buffer_frames(8192);
        sink.handle().set_available_frames(Some(1000));
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);

        let outcome = mixer
            .process_sound_buffer(&channels, &mut sink, params(50), &metrics)
            .unwrap();
        assert_eq!(outcome, TickOutcome::Saturated);
        assert!(sink.handle().payloads().is_empty());
        assert_eq!(channels[0].queued_bytes(), 8000);
    }

    #[test]
    fn test_short_read_scales_target() {
        let channels = channels(1, 50);
        // Half a chunk at the playback rate.
        channels[0].fill(&pcm(200, 1102), RATE).unwrap();
        channels[0].play();

        let mut sink = running_sink();
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);
        mixer
            .process_sound_buffer(&channels, &mut sink, params(50), &metrics)
            .unwrap();

        let mixed = frames(&sink.handle().payloads()[0]);
        assert_eq!(mixed.len(), 2204);
        // 2204 of 4410 requested bytes were read: 2204 * 2204 / 4410 frames, forced even.
        let filled = 1100;
        assert!(mixed[..filled].iter().all(|frame| *frame == (200, 200)));
        assert!(mixed[filled..].iter().all(|frame| *frame == (0, 0)));
        assert_eq!(metrics.snapshot().short_reads, 1);
    }

    #[test]
    fn test_wrapping_and_saturating_summation() {
        for (summation, expected) in [
            (MixSummation::Wrapping, 30000i16.wrapping_add(30000)),
            (MixSummation::Saturating, i16::MAX),
        ] {
            let channels = channels(2, SCENARIO_LATENCY_MS);
            for channel in &channels {
                channel.fill(&pcm(30000, 100), SCENARIO_RATE).unwrap();
                channel.play();
            }
            let mut sink = running_sink();
            let mut mixer = Mixer::new(summation);
            mixer
                .process_sound_buffer(
                    &channels,
                    &mut sink,
                    scenario_params(),
                    &EngineMetrics::new(),
                )
                .unwrap();
            let mixed = frames(&sink.handle().payloads()[0]);
            assert_eq!(mixed[10], (expected, expected));
        }
    }

    #[test]
    fn test_empty_channel_contributes_silence() {
        let channels = channels(2, 50);
        channels[0].play();
        channels[1].fill(&pcm(-700, 2205), RATE).unwrap();
        channels[1].play();

        let mut sink = running_sink();
        let metrics = EngineMetrics::new();
        let mut mixer = Mixer::new(MixSummation::Wrapping);
        mixer
            .process_sound_buffer(&channels, &mut sink, params(50), &metrics)
            .unwrap();

        let mixed = frames(&sink.handle().payloads()[0]);
        assert_eq!(mixed[5], (-700, -700));
        assert_eq!(metrics.snapshot().empty_reads, 1);
        assert_eq!(channels[1].peak(), 700);
    }
}
