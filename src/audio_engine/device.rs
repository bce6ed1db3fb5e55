//! Device-facing contracts and the playback recovery state machine.
//!
//! Backends implement [`Sink`] and [`Source`]; everything above them (mixer,
//! capture monitor, engine) is written once against these traits.

use std::thread;

use crate::audio_engine::constants::{RESUME_RETRY_LIMIT, RESUME_RETRY_SLEEP, WRITE_RETRY_LIMIT};
use crate::audio_engine::errors::DeviceError;
use crate::audio_engine::metrics::{EngineMetrics, bump};

/// Observable state of a sink or source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Open,
    Setup,
    Prepared,
    Running,
    XRun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// Answer of [`Sink::write_interleaved`].
#[derive(Debug)]
pub enum WriteOutcome {
    /// Number of frames accepted; may be fewer than offered.
    Written(usize),
    /// Device buffer is full right now; try again.
    TransientFull,
    /// Underrun or overrun; the device needs to be re-prepared.
    Underrun,
    /// Device was suspended and needs to be resumed.
    Suspended,
    /// Unrecoverable.
    Fatal(DeviceError),
}

/// Answer of [`Source::read_interleaved`].
#[derive(Debug)]
pub enum ReadOutcome {
    /// Number of bytes written into the caller's buffer.
    Data(usize),
    Underrun,
    Fatal(DeviceError),
}

/// Answer of a single resume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    TryAgain,
    Failed,
}

/// Playback side of an audio backend.
///
/// Every call is expected to return promptly; waiting is the caller's job.
pub trait Sink: Send {
    /// Opens the named device, or the default one.
    fn open(&mut self, device_name: Option<&str>) -> Result<(), DeviceError>;

    /// Agrees on stream parameters and returns the rate actually in use.
    fn negotiate(
        &mut self,
        sample_rate: u32,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<u32, DeviceError>;

    fn state(&self) -> DeviceState;

    fn prepare(&mut self) -> Result<(), DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Queues interleaved little-endian 16-bit frames.
    fn write_interleaved(&mut self, pcm: &[u8]) -> WriteOutcome;

    /// Frames that can be written right now without blocking.
    fn available_frames(&mut self) -> Result<usize, DeviceError>;

    /// Total frames the device buffer holds.
    fn buffer_frames(&self) -> usize;

    fn resume(&mut self) -> ResumeOutcome;

    /// Discards queued frames and returns the sink to [`DeviceState::Setup`].
    fn drop_pending(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self);
}

/// Capture side of an audio backend.
pub trait Source: Send {
    fn open(&mut self, device_name: Option<&str>) -> Result<(), DeviceError>;

    fn negotiate(
        &mut self,
        sample_rate: u32,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<u32, DeviceError>;

    fn state(&self) -> DeviceState;

    fn prepare(&mut self) -> Result<(), DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Fills as much of `buf` as captured data allows.
    fn read_interleaved(&mut self, buf: &mut [u8]) -> ReadOutcome;

    /// Captured frames ready to be read.
    fn available_frames(&mut self) -> Result<usize, DeviceError>;

    fn resume(&mut self) -> ResumeOutcome;

    fn stop(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self);
}

/// Factory for sinks and sources of one audio API.
pub trait AudioBackend: Send + Sync + 'static {
    type Sink: Sink + 'static;
    type Source: Source + 'static;

    fn create_sink(&self) -> Result<Self::Sink, DeviceError>;

    fn create_source(&self) -> Result<Self::Source, DeviceError>;

    /// Names of the available output devices.
    fn enumerate_devices(&self) -> Result<Vec<String>, DeviceError>;
}

/// Whether the sink can take a mix this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Running; go ahead.
    Ready,
    /// A setup or priming step was taken; mix on the next tick.
    Deferred,
    /// An xrun was recovered; mix on the next tick.
    Recovered,
}

/// Drives the sink toward [`DeviceState::Running`].
///
/// `silence` is one latency interval of zeroed output, written before every
/// start so the device does not immediately run dry again.
pub fn ensure_running<S: Sink + ?Sized>(
    sink: &mut S,
    silence: &[u8],
    frame_bytes: usize,
    metrics: &EngineMetrics,
) -> Result<Readiness, DeviceError> {
    match sink.state() {
        DeviceState::Running => Ok(Readiness::Ready),
        DeviceState::Open | DeviceState::Setup => {
            log::debug!("Preparing playback device");
            sink.prepare()?;
            Ok(Readiness::Deferred)
        }
        DeviceState::Prepared => {
            log::debug!("Priming playback device with {} bytes of silence", silence.len());
            write_silence(sink, silence, frame_bytes, metrics)?;
            sink.start()?;
            Ok(Readiness::Deferred)
        }
        DeviceState::XRun => {
            bump(&metrics.playback_xruns);
            recover_xrun(sink, silence, frame_bytes, metrics)?;
            Ok(Readiness::Recovered)
        }
        DeviceState::Suspended => {
            recover_suspend(sink, metrics)?;
            Ok(Readiness::Deferred)
        }
        DeviceState::Disconnected => {
            log::error!("Playback device disconnected");
            Err(DeviceError::Disconnected)
        }
        state @ (DeviceState::Draining | DeviceState::Paused) => {
            log::debug!("Playback device is {state:?}, skipping tick");
            Ok(Readiness::Deferred)
        }
    }
}

/// Re-prepares the sink, re-primes it with silence and restarts it.
pub fn recover_xrun<S: Sink + ?Sized>(
    sink: &mut S,
    silence: &[u8],
    frame_bytes: usize,
    metrics: &EngineMetrics,
) -> Result<(), DeviceError> {
    log::warn!("Playback xrun, recovering");
    sink.prepare()?;
    write_silence(sink, silence, frame_bytes, metrics)?;
    sink.start()?;
    bump(&metrics.playback_recoveries);
    Ok(())
}

/// Resumes a suspended sink, falling back to prepare when resuming fails.
pub fn recover_suspend<S: Sink + ?Sized>(
    sink: &mut S,
    metrics: &EngineMetrics,
) -> Result<(), DeviceError> {
    log::warn!("Playback device suspended, resuming");
    bump(&metrics.suspend_resumes);
    if resume_with_retry(|| sink.resume()) {
        return Ok(());
    }

    log::warn!("Resume failed, re-preparing playback device");
    sink.prepare().map_err(|e| {
        log::error!("Failed to prepare after resume: {e}");
        DeviceError::ResumeFailed
    })
}

/// Polls `resume` until it succeeds, fails, or the retry budget runs out.
pub(crate) fn resume_with_retry(mut resume: impl FnMut() -> ResumeOutcome) -> bool {
    for attempt in 0..RESUME_RETRY_LIMIT {
        match resume() {
            ResumeOutcome::Resumed => return true,
            ResumeOutcome::Failed => return false,
            ResumeOutcome::TryAgain => {
                log::debug!("Device not ready to resume (attempt {})", attempt + 1);
                thread::sleep(RESUME_RETRY_SLEEP);
            }
        }
    }
    false
}

enum Pushed {
    All,
    Stalled { offset: usize, suspended: bool },
}

fn push<S: Sink + ?Sized>(
    sink: &mut S,
    pcm: &[u8],
    frame_bytes: usize,
    metrics: &EngineMetrics,
) -> Result<Pushed, DeviceError> {
    let mut offset = 0;
    let mut retries = 0;
    while offset < pcm.len() {
        match sink.write_interleaved(&pcm[offset..]) {
            WriteOutcome::Written(frames) if frames > 0 => {
                offset = (offset + frames * frame_bytes).min(pcm.len());
                retries = 0;
            }
            WriteOutcome::Written(_) | WriteOutcome::TransientFull => {
                bump(&metrics.write_retries);
                retries += 1;
                if retries > WRITE_RETRY_LIMIT {
                    bump(&metrics.dropped_writes);
                    log::warn!(
                        "Device kept refusing data, dropping {} bytes",
                        pcm.len() - offset
                    );
                    return Ok(Pushed::All);
                }
            }
            WriteOutcome::Underrun => {
                return Ok(Pushed::Stalled {
                    offset,
                    suspended: false,
                });
            }
            WriteOutcome::Suspended => {
                return Ok(Pushed::Stalled {
                    offset,
                    suspended: true,
                });
            }
            WriteOutcome::Fatal(e) => return Err(e),
        }
    }
    Ok(Pushed::All)
}

/// Writes priming silence. An interruption here is left for the next tick.
fn write_silence<S: Sink + ?Sized>(
    sink: &mut S,
    silence: &[u8],
    frame_bytes: usize,
    metrics: &EngineMetrics,
) -> Result<(), DeviceError> {
    if let Pushed::Stalled { .. } = push(sink, silence, frame_bytes, metrics)? {
        log::debug!("Silence write interrupted");
    }
    Ok(())
}

/// Writes one mixed frame buffer.
///
/// Transient "full" answers are retried. An underrun or suspend triggers
/// recovery and the unwritten remainder is retried once. Only fatal answers
/// become errors.
pub fn write_all<S: Sink + ?Sized>(
    sink: &mut S,
    pcm: &[u8],
    silence: &[u8],
    frame_bytes: usize,
    metrics: &EngineMetrics,
) -> Result<(), DeviceError> {
    let Pushed::Stalled { offset, suspended } = push(sink, pcm, frame_bytes, metrics)? else {
        return Ok(());
    };

    if suspended {
        recover_suspend(sink, metrics)?;
    } else {
        bump(&metrics.playback_xruns);
        recover_xrun(sink, silence, frame_bytes, metrics)?;
    }

    if let Pushed::Stalled { offset: again, .. } =
        push(sink, &pcm[offset..], frame_bytes, metrics)?
    {
        bump(&metrics.dropped_writes);
        log::warn!(
            "Write interrupted again after recovery, dropping {} bytes",
            pcm.len() - offset - again
        );
    }
    Ok(())
}
