//! Sample-rate conversion for secondary buffers and the capture path.
//!
//! [`ResamplingAdapter`] converts interleaved 16-bit PCM to normalized float
//! planes, runs one of two persistent [`ResamplingEngine`]s and converts the
//! result back. Engines keep their filter state between calls, so a channel
//! owns its adapter for its whole lifetime.

use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{
    Async, FixedAsync, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};

use crate::audio_engine::config::ResamplerQuality;
use crate::audio_engine::constants::{
    BYTES_PER_WORD, PCM_FULL_SCALE, PRIMING_LONG_SAMPLES, PRIMING_SHORT_SAMPLES,
};
use crate::audio_engine::errors::ResampleError;

/// Input frames handed to the sinc resampler per processing step.
const SINC_CHUNK_FRAMES: usize = 256;

/// Ratio bounds of the upsampling engine.
const UPSAMPLE_RATIO_RANGE: (f64, f64) = (1.0, 8.0);

/// Ratio bounds of the downsampling engine.
const DOWNSAMPLE_RATIO_RANGE: (f64, f64) = (0.125, 1.0);

/// Interpolation kernel used behind the adapter.
///
/// `process` consumes every sample of each input plane and writes exactly
/// `output[p].len()` samples to each output plane. The ratio is implied by the
/// two lengths. Implementations keep filter state between calls.
pub trait ResamplingEngine: Send {
    fn process(&mut self, input: &[Vec<f32>], output: &mut [Vec<f32>])
    -> Result<(), ResampleError>;
}

fn check_planes(
    expected: usize,
    input: &[Vec<f32>],
    output: &[Vec<f32>],
) -> Result<(), ResampleError> {
    if input.len() != expected || output.len() != expected {
        return Err(ResampleError::ChannelMismatch {
            expected,
            actual: input.len().min(output.len()),
        });
    }
    Ok(())
}

/// Band-limited sinc interpolation on top of `rubato::Async`.
///
/// Arbitrary per-call lengths are honoured by queueing input until a full
/// chunk is available and serving output from a per-plane backlog. When the
/// backlog runs dry it is refilled with silence plus a one-chunk cushion, so a
/// shortfall costs latency once instead of a gap on every call.
pub struct SincEngine {
    resampler: Async<f32>,
    ratio_range: (f64, f64),
    channels: usize,
    pending_in: Vec<Vec<f32>>,
    pending_out: Vec<Vec<f32>>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
    cushion: usize,
}

impl SincEngine {
    /// Creates a sinc engine clamping ratios to `ratio_range`.
    pub fn new(channels: usize, ratio_range: (f64, f64)) -> Result<Self, ResampleError> {
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.925,
            oversampling_factor: 128,
            interpolation: SincInterpolationType::Linear,
            window: WindowFunction::BlackmanHarris2,
        };

        let (low, high) = ratio_range;
        let initial = if high > 1.0 { high.min(2.0) } else { low.max(0.5) };
        let max_relative = (high / initial).max(initial / low);

        let resampler = Async::<f32>::new_sinc(
            initial,
            max_relative,
            &params,
            SINC_CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        )?;

        let max_out = resampler.output_frames_max();
        Ok(Self {
            ratio_range,
            channels,
            pending_in: vec![Vec::new(); channels],
            pending_out: vec![Vec::new(); channels],
            work_in: vec![vec![0.0; resampler.input_frames_max()]; channels],
            work_out: vec![vec![0.0; max_out]; channels],
            cushion: max_out,
            resampler,
        })
    }

    fn run_pending_chunks(&mut self) -> Result<(), ResampleError> {
        loop {
            let need = self.resampler.input_frames_next();
            if self.pending_in[0].len() < need {
                return Ok(());
            }

            for (work, pending) in self.work_in.iter_mut().zip(self.pending_in.iter_mut()) {
                work[..need].copy_from_slice(&pending[..need]);
                pending.drain(..need);
            }

            let input = SequentialSliceOfVecs::new(&self.work_in[..], self.channels, need)
                .map_err(|e| ResampleError::Buffer(e.to_string()))?;
            let out_frames = self.resampler.output_frames_next();
            let mut output =
                SequentialSliceOfVecs::new_mut(&mut self.work_out[..], self.channels, out_frames)
                    .map_err(|e| ResampleError::Buffer(e.to_string()))?;

            let (_, written) = self
                .resampler
                .process_into_buffer(&input, &mut output, None)?;

            for (pending, work) in self.pending_out.iter_mut().zip(self.work_out.iter()) {
                pending.extend_from_slice(&work[..written]);
            }
        }
    }
}

impl ResamplingEngine for SincEngine {
    fn process(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
    ) -> Result<(), ResampleError> {
        check_planes(self.channels, input, output)?;
        let source = input[0].len();
        let target = output[0].len();
        if source == 0 || target == 0 {
            return Err(ResampleError::InvalidArguments);
        }

        let (low, high) = self.ratio_range;
        let ratio = (target as f64 / source as f64).clamp(low, high);
        self.resampler.set_resample_ratio(ratio, false)?;

        for (pending, plane) in self.pending_in.iter_mut().zip(input) {
            pending.extend_from_slice(plane);
        }
        self.run_pending_chunks()?;

        let max_backlog = target + 4 * self.cushion;
        for (pending, plane) in self.pending_out.iter_mut().zip(output.iter_mut()) {
            if pending.len() < target {
                let pad = target - pending.len() + self.cushion;
                pending.splice(0..0, std::iter::repeat_n(0.0, pad));
            }
            plane.copy_from_slice(&pending[..target]);
            pending.drain(..target);

            if pending.len() > max_backlog {
                let excess = pending.len() - max_backlog;
                pending.drain(..excess);
            }
        }
        Ok(())
    }
}

/// Linear interpolation that carries each plane's last sample across calls.
///
/// Output sample `j` of a call is read at input position
/// `(j + 1) * S / T - 1`, where position `-1` is the previous call's last
/// sample. A 1:1 call therefore reproduces its input exactly.
pub struct LinearEngine {
    last: Vec<f32>,
}

impl LinearEngine {
    pub fn new(channels: usize) -> Self {
        Self {
            last: vec![0.0; channels],
        }
    }
}

impl ResamplingEngine for LinearEngine {
    fn process(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
    ) -> Result<(), ResampleError> {
        check_planes(self.last.len(), input, output)?;

        for ((plane_in, plane_out), last) in
            input.iter().zip(output.iter_mut()).zip(self.last.iter_mut())
        {
            let source = plane_in.len();
            let target = plane_out.len();
            if source == 0 || target == 0 {
                return Err(ResampleError::InvalidArguments);
            }

            let step = source as f64 / target as f64;
            let at = |index: isize| -> f32 {
                if index < 0 {
                    *last
                } else {
                    plane_in[(index as usize).min(source - 1)]
                }
            };

            for (j, out) in plane_out.iter_mut().enumerate() {
                let pos = (j + 1) as f64 * step - 1.0;
                let base = pos.floor();
                let frac = (pos - base) as f32;
                let index = base as isize;
                let a = at(index);
                *out = if frac == 0.0 {
                    a
                } else {
                    // Exact between equal neighbours, so DC passes unchanged.
                    a + (at(index + 1) - a) * frac
                };
            }
            *last = plane_in[source - 1];
        }
        Ok(())
    }
}

fn build_engine(
    quality: ResamplerQuality,
    channels: usize,
    ratio_range: (f64, f64),
) -> Result<Box<dyn ResamplingEngine>, ResampleError> {
    Ok(match quality {
        ResamplerQuality::Sinc => Box::new(SincEngine::new(channels, ratio_range)?),
        ResamplerQuality::Linear => Box::new(LinearEngine::new(channels)),
    })
}

/// Converts interleaved 16-bit PCM between sample counts.
///
/// Holds an upsampling and a downsampling engine. A call with more target than
/// source samples goes through the upsampler, everything else (1:1 included)
/// through the downsampler.
pub struct ResamplingAdapter {
    up: Box<dyn ResamplingEngine>,
    down: Box<dyn ResamplingEngine>,
    channels: usize,
    in_planes: Vec<Vec<f32>>,
    out_planes: Vec<Vec<f32>>,
    out_bytes: Vec<u8>,
}

impl ResamplingAdapter {
    /// Builds both engines for `channels` planes and primes them on silence.
    pub fn new(quality: ResamplerQuality, channels: usize) -> Result<Self, ResampleError> {
        if channels == 0 {
            return Err(ResampleError::InvalidArguments);
        }
        let up = build_engine(quality, channels, UPSAMPLE_RATIO_RANGE)?;
        let down = build_engine(quality, channels, DOWNSAMPLE_RATIO_RANGE)?;
        Self::with_engines(up, down, channels)
    }

    /// Wraps caller-provided engines. Priming still runs.
    pub fn with_engines(
        up: Box<dyn ResamplingEngine>,
        down: Box<dyn ResamplingEngine>,
        channels: usize,
    ) -> Result<Self, ResampleError> {
        let mut adapter = Self {
            up,
            down,
            channels,
            in_planes: vec![Vec::new(); channels],
            out_planes: vec![Vec::new(); channels],
            out_bytes: Vec::new(),
        };

        let silence = vec![0u8; PRIMING_LONG_SAMPLES * channels * BYTES_PER_WORD];
        adapter.resample(
            &silence,
            PRIMING_SHORT_SAMPLES,
            PRIMING_LONG_SAMPLES,
            BYTES_PER_WORD,
            channels,
        )?;
        adapter.resample(
            &silence,
            PRIMING_LONG_SAMPLES,
            PRIMING_SHORT_SAMPLES,
            BYTES_PER_WORD,
            channels,
        )?;
        Ok(adapter)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Resamples `source_samples` frames of `pcm` to `target_samples` frames.
    ///
    /// # Returns
    ///
    /// Exactly `target_samples * channels * bytes_per_sample` bytes of
    /// interleaved little-endian PCM, borrowed from the adapter's scratch.
    /// Zero arguments, a width other than 16 bits, a channel count the adapter
    /// was not built for or too little input fail with no state change.
    pub fn resample(
        &mut self,
        pcm: &[u8],
        source_samples: usize,
        target_samples: usize,
        bytes_per_sample: usize,
        channels: usize,
    ) -> Result<&[u8], ResampleError> {
        if source_samples == 0
            || target_samples == 0
            || bytes_per_sample != BYTES_PER_WORD
            || channels == 0
            || pcm.is_empty()
        {
            return Err(ResampleError::InvalidArguments);
        }
        if channels != self.channels {
            return Err(ResampleError::ChannelMismatch {
                expected: self.channels,
                actual: channels,
            });
        }
        let frame_bytes = channels * bytes_per_sample;
        if pcm.len() < source_samples * frame_bytes {
            return Err(ResampleError::InvalidArguments);
        }

        for (plane_index, plane) in self.in_planes.iter_mut().enumerate() {
            plane.clear();
            plane.extend(
                pcm[..source_samples * frame_bytes]
                    .chunks_exact(frame_bytes)
                    .map(|frame| {
                        let at = plane_index * bytes_per_sample;
                        let sample = i16::from_le_bytes([frame[at], frame[at + 1]]);
                        (f32::from(sample) / PCM_FULL_SCALE).clamp(-1.0, 1.0)
                    }),
            );
        }
        for plane in &mut self.out_planes {
            plane.clear();
            plane.resize(target_samples, 0.0);
        }

        let engine = if target_samples > source_samples {
            &mut self.up
        } else {
            &mut self.down
        };
        engine.process(&self.in_planes, &mut self.out_planes)?;

        self.out_bytes.clear();
        self.out_bytes.reserve(target_samples * frame_bytes);
        for frame in 0..target_samples {
            for plane in &self.out_planes {
                self.out_bytes
                    .extend_from_slice(&float_to_pcm(plane[frame]).to_le_bytes());
            }
        }
        Ok(&self.out_bytes)
    }
}

/// Scales a normalized sample to i16, clamping and truncating toward zero.
fn float_to_pcm(sample: f32) -> i16 {
    (sample * PCM_FULL_SCALE).clamp(-PCM_FULL_SCALE, PCM_FULL_SCALE - 1.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Records every (source, target) length pair it sees.
    struct RecordingEngine {
        calls: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl ResamplingEngine for RecordingEngine {
        fn process(
            &mut self,
            input: &[Vec<f32>],
            output: &mut [Vec<f32>],
        ) -> Result<(), ResampleError> {
            self.calls
                .lock()
                .unwrap()
                .push((input[0].len(), output[0].len()));
            Ok(())
        }
    }

    #[test]
    fn test_length_contract_linear() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Linear, 1).unwrap();
        let input = pcm(&[1000; 441]);
        for target in [1usize, 100, 441, 480, 2000] {
            let out = adapter.resample(&input, 441, target, 2, 1).unwrap();
            assert_eq!(out.len(), target * 2);
        }
    }

    #[test]
    fn test_length_contract_sinc() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Sinc, 1).unwrap();
        let input = pcm(&[0; 2205]);
        for (source, target) in [(2205, 2205), (2205, 2400), (2205, 400), (400, 2205), (7, 3)] {
            let out = adapter.resample(&input, source, target, 2, 1).unwrap();
            assert_eq!(out.len(), target * 2);
        }
    }

    #[test]
    fn test_length_contract_stereo() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Sinc, 2).unwrap();
        let input = pcm(&[0; 700]);
        let out = adapter.resample(&input, 350, 441, 2, 2).unwrap();
        assert_eq!(out.len(), 441 * 2 * 2);
    }

    #[test]
    fn test_invalid_arguments() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Linear, 1).unwrap();
        let input = pcm(&[5; 10]);
        assert!(adapter.resample(&input, 0, 10, 2, 1).is_err());
        assert!(adapter.resample(&input, 10, 0, 2, 1).is_err());
        assert!(adapter.resample(&input, 10, 10, 0, 1).is_err());
        assert!(adapter.resample(&input, 10, 10, 2, 0).is_err());
        assert!(adapter.resample(&[], 10, 10, 2, 1).is_err());
        assert!(adapter.resample(&input, 20, 10, 2, 1).is_err());
        assert!(matches!(
            adapter.resample(&input, 5, 5, 2, 2),
            Err(ResampleError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_linear_identity_at_unity_ratio() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Linear, 1).unwrap();
        let data = [0i16, 100, -100, 32767, -32768, 12345];
        let out = samples(adapter.resample(&pcm(&data), 6, 6, 2, 1).unwrap());
        assert_eq!(out, data);
    }

    #[test]
    fn test_linear_upsample_interpolates() {
        let mut engine = LinearEngine::new(1);
        let input = vec![vec![0.0, 1.0]];
        let mut output = vec![vec![0.0; 4]];
        engine.process(&input, &mut output).unwrap();
        // Positions -0.5, 0.0, 0.5, 1.0 with a silent previous sample.
        assert_eq!(output[0], vec![0.0, 0.0, 0.5, 1.0]);

        // Next call interpolates from the carried sample.
        let input = vec![vec![1.0, 1.0]];
        engine.process(&input, &mut output).unwrap();
        assert_eq!(output[0], vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_linear_keeps_constant_level_on_short_read() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Linear, 1).unwrap();
        let input = pcm(&[200; 1102]);
        for _ in 0..3 {
            let out = samples(adapter.resample(&input, 1102, 1100, 2, 1).unwrap());
            assert_eq!(out.len(), 1100);
            assert!(out.iter().all(|s| *s == 200), "{out:?}");
        }
    }

    #[test]
    fn test_engine_selection_and_priming() {
        let up_calls = Arc::new(Mutex::new(Vec::new()));
        let down_calls = Arc::new(Mutex::new(Vec::new()));
        let mut adapter = ResamplingAdapter::with_engines(
            Box::new(RecordingEngine {
                calls: up_calls.clone(),
            }),
            Box::new(RecordingEngine {
                calls: down_calls.clone(),
            }),
            1,
        )
        .unwrap();

        assert_eq!(*up_calls.lock().unwrap(), vec![(256, 512)]);
        assert_eq!(*down_calls.lock().unwrap(), vec![(512, 256)]);

        let input = pcm(&[0; 100]);
        adapter.resample(&input, 100, 100, 2, 1).unwrap();
        adapter.resample(&input, 50, 100, 2, 1).unwrap();
        adapter.resample(&input, 100, 60, 2, 1).unwrap();

        assert_eq!(*up_calls.lock().unwrap(), vec![(256, 512), (50, 100)]);
        assert_eq!(
            *down_calls.lock().unwrap(),
            vec![(512, 256), (100, 100), (100, 60)]
        );
    }

    #[test]
    fn test_float_to_pcm_clamps_and_truncates() {
        assert_eq!(float_to_pcm(1.0), 32767);
        assert_eq!(float_to_pcm(-1.0), -32768);
        assert_eq!(float_to_pcm(2.0), 32767);
        assert_eq!(float_to_pcm(0.5), 16384);
        assert_eq!(float_to_pcm(0.00003), 0);
    }

    #[test]
    fn test_sinc_steady_tone_keeps_level() {
        let mut adapter = ResamplingAdapter::new(ResamplerQuality::Sinc, 1).unwrap();
        let input = pcm(&[8000; 2205]);
        let mut last = Vec::new();
        for _ in 0..8 {
            last = samples(adapter.resample(&input, 2205, 2400, 2, 1).unwrap());
        }
        // After the cushion has been played out the DC level comes through.
        let tail = &last[last.len() - 100..];
        assert!(tail.iter().all(|s| (i32::from(*s) - 8000).abs() < 200));
    }
}
