//! Capture path: Source → resampler → recording callback.
//!
//! [`CaptureMonitor::tick`] only reads and converts. The converted chunk is
//! handed to the recording callback by the engine once the device lock is
//! released, so the callback may call back into the engine.

use crate::audio_engine::config::ResamplerQuality;
use crate::audio_engine::constants::BYTES_PER_WORD;
use crate::audio_engine::device::{DeviceState, ReadOutcome, Source, resume_with_retry};
use crate::audio_engine::errors::{DeviceError, EngineError};
use crate::audio_engine::metrics::{EngineMetrics, bump};
use crate::audio_engine::resampler::ResamplingAdapter;

/// Consumer of captured audio.
///
/// Called on the tick thread with data already converted to the requested
/// record rate. Must return quickly; the next tick waits for it.
pub trait RecordingCallback: Send {
    fn forward(&mut self, pcm: &[u8], sample_rate: u32);
}

impl<F> RecordingCallback for F
where
    F: FnMut(&[u8], u32) + Send,
{
    fn forward(&mut self, pcm: &[u8], sample_rate: u32) {
        self(pcm, sample_rate)
    }
}

/// What one capture pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Capture is stopped.
    Idle,
    /// Device setup or recovery happened instead of reading.
    Deferred,
    /// Less than one chunk is buffered.
    Waiting,
    /// A chunk of the given byte length is ready in
    /// [`CaptureMonitor::take_chunk`].
    Delivered(usize),
}

/// One converted chunk waiting for the recording callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

/// Frames in one capture chunk.
///
/// One latency interval at the device rate, capped at `max_chunk_bytes`.
pub fn capture_chunk_frames(
    device_rate: u32,
    latency_ms: u32,
    channels: usize,
    max_chunk_bytes: usize,
) -> usize {
    let latency_frames = (u64::from(device_rate) * u64::from(latency_ms) / 1000) as usize;
    let cap = max_chunk_bytes / (channels * BYTES_PER_WORD);
    latency_frames.min(cap)
}

/// Owns the capture source and converts what it records.
pub struct CaptureMonitor<S: Source> {
    source: S,
    capturing: bool,
    device_rate: u32,
    record_rate: u32,
    channels: usize,
    latency_ms: u32,
    max_chunk_bytes: usize,
    resampler: ResamplingAdapter,
    read_buf: Vec<u8>,
    ready: Option<CapturedChunk>,
}

impl<S: Source> CaptureMonitor<S> {
    /// Wraps a negotiated source running at `device_rate`.
    pub fn new(
        source: S,
        device_rate: u32,
        record_rate: u32,
        channels: usize,
        latency_ms: u32,
        max_chunk_bytes: usize,
        quality: ResamplerQuality,
    ) -> Result<Self, EngineError> {
        let resampler = ResamplingAdapter::new(quality, channels).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to create capture resampler: {e}"))
        })?;

        Ok(Self {
            source,
            capturing: false,
            device_rate,
            record_rate,
            channels,
            latency_ms,
            max_chunk_bytes,
            resampler,
            read_buf: Vec::new(),
            ready: None,
        })
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.source.state() != DeviceState::Prepared {
            self.source.prepare()?;
        }
        self.source.start()?;
        self.capturing = true;
        log::info!(
            "Capture started ({} ch@{} Hz → {} Hz)",
            self.channels,
            self.device_rate,
            self.record_rate
        );
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DeviceError> {
        self.capturing = false;
        self.source.stop()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn record_rate(&self) -> u32 {
        self.record_rate
    }

    pub fn set_record_rate(&mut self, rate: u32) {
        self.record_rate = rate;
    }

    pub fn set_latency_ms(&mut self, latency_ms: u32) {
        self.latency_ms = latency_ms;
    }

    pub fn chunk_frames(&self) -> usize {
        capture_chunk_frames(
            self.device_rate,
            self.latency_ms,
            self.channels,
            self.max_chunk_bytes,
        )
    }

    /// Takes the chunk converted by the last [`tick`](Self::tick).
    pub fn take_chunk(&mut self) -> Option<CapturedChunk> {
        self.ready.take()
    }

    /// Runs one capture pass.
    ///
    /// An xrun re-prepares the source and returns without reading, so data
    /// from a broken period is never forwarded. A chunk not taken before the
    /// next pass is replaced.
    pub fn tick(&mut self, metrics: &EngineMetrics) -> Result<CaptureOutcome, DeviceError> {
        if !self.capturing {
            return Ok(CaptureOutcome::Idle);
        }

        match self.source.state() {
            DeviceState::Running => {}
            DeviceState::XRun => {
                bump(&metrics.capture_xruns);
                log::warn!("Capture xrun, re-preparing");
                self.source.prepare()?;
                return Ok(CaptureOutcome::Deferred);
            }
            DeviceState::Open | DeviceState::Setup => {
                self.source.prepare()?;
                return Ok(CaptureOutcome::Deferred);
            }
            DeviceState::Prepared => {
                self.source.start()?;
                return Ok(CaptureOutcome::Deferred);
            }
            DeviceState::Suspended => {
                let source = &mut self.source;
                if !resume_with_retry(|| source.resume()) {
                    self.source
                        .prepare()
                        .map_err(|_| DeviceError::ResumeFailed)?;
                }
                return Ok(CaptureOutcome::Deferred);
            }
            DeviceState::Disconnected => {
                log::error!("Capture device disconnected");
                return Err(DeviceError::Disconnected);
            }
            DeviceState::Draining | DeviceState::Paused => return Ok(CaptureOutcome::Deferred),
        }

        let chunk_frames = self.chunk_frames();
        if chunk_frames == 0 || self.source.available_frames()? < chunk_frames {
            return Ok(CaptureOutcome::Waiting);
        }

        let frame_bytes = self.channels * BYTES_PER_WORD;
        self.read_buf.resize(chunk_frames * frame_bytes, 0);
        let read = match self.source.read_interleaved(&mut self.read_buf) {
            ReadOutcome::Data(bytes) => bytes,
            ReadOutcome::Underrun => {
                bump(&metrics.capture_xruns);
                log::warn!("Capture overrun while reading, re-preparing");
                self.source.prepare()?;
                return Ok(CaptureOutcome::Deferred);
            }
            ReadOutcome::Fatal(e) => {
                log::error!("Capture read failed: {e}");
                return Err(e);
            }
        };

        let frames = read / frame_bytes;
        let target = ((frames as u64 * u64::from(self.record_rate)
            / u64::from(self.device_rate.max(1))) as usize)
            & !1;
        if frames == 0 || target == 0 {
            return Ok(CaptureOutcome::Waiting);
        }

        let resampled = match self.resampler.resample(
            &self.read_buf[..frames * frame_bytes],
            frames,
            target,
            BYTES_PER_WORD,
            self.channels,
        ) {
            Ok(resampled) => resampled,
            Err(e) => {
                log::debug!("Capture resample failed: {e}");
                return Ok(CaptureOutcome::Waiting);
            }
        };

        let len = resampled.len();
        let mut pcm = self.ready.take().map(|chunk| chunk.pcm).unwrap_or_default();
        pcm.clear();
        pcm.extend_from_slice(resampled);
        self.ready = Some(CapturedChunk {
            pcm,
            sample_rate: self.record_rate,
        });
        bump(&metrics.capture_chunks);
        Ok(CaptureOutcome::Delivered(len))
    }

    /// Stops and closes the source.
    pub fn close(mut self) {
        if self.capturing {
            if let Err(e) = self.source.stop() {
                log::debug!("Failed to stop capture source: {e}");
            }
        }
        self.source.close();
    }
}
