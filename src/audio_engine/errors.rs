//! Audio-specific error types.

use thiserror::Error;

/// Errors surfaced by the public engine surface.
///
/// Recoverable device conditions (xruns, transient suspends, "try again"
/// answers) never show up here; they are absorbed by the tick loop and only
/// visible through logging and [`EngineMetrics`](crate::audio_engine::metrics::EngineMetrics).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Channel index does not name a secondary buffer.
    #[error("channel out of range (expected 0..{count}, got {channel})")]
    ChannelOutOfRange {
        /// Requested channel.
        channel: usize,
        /// Number of channels the engine was created with.
        count: usize,
    },

    /// Zero or otherwise unusable byte length.
    #[error("invalid length: {0}")]
    InvalidLength(usize),

    #[error("volume out of range (expected -9600..=0, got {0})")]
    VolumeOutOfRange(i32),

    #[error("pan out of range (expected -1000..=1000, got {0})")]
    PanOutOfRange(i32),

    #[error("buffer latency out of range (expected 1..=999 ms, got {0})")]
    LatencyOutOfRange(i64),

    #[error("sample rate out of range: {0}")]
    SampleRateOutOfRange(u32),

    /// Engine configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("audio engine not initialized")]
    NotInitialized,

    #[error("audio engine already initialized")]
    AlreadyInitialized,

    #[error("capture buffer not initialized")]
    CaptureNotInitialized,

    /// Operation requires the tick loop to be stopped first.
    #[error("tick loop is running")]
    TickLoopRunning,

    /// Ring buffer truncated the write; `written` bytes were kept.
    #[error("buffer overflow: wrote {written} of {requested} bytes")]
    BufferOverflow {
        /// Bytes accepted by the ring buffer.
        written: usize,
        /// Bytes the caller asked to write.
        requested: usize,
    },

    /// Fatal device error; the engine stays usable but needs `uninit`/`init`.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Errors reported by a [`Sink`](crate::audio_engine::device::Sink) or
/// [`Source`](crate::audio_engine::device::Source) implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio device not found: {0}")]
    NotFound(String),

    #[error("audio device unavailable")]
    Unavailable,

    /// Hardware parameters could not be agreed on.
    #[error("failed to negotiate stream parameters: {0}")]
    Negotiation(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    /// Operation is not valid in the device's current state.
    #[error("operation not valid in device state {0}")]
    BadState(String),

    #[error("audio device disconnected")]
    Disconnected,

    #[error("failed to resume suspended device")]
    ResumeFailed,

    /// Backend specific failure.
    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Errors from the resampling adapter and its engines.
#[derive(Debug, Error)]
pub enum ResampleError {
    /// Zero sample count, zero width, zero channels or empty input.
    #[error("invalid resample arguments")]
    InvalidArguments,

    /// Input and output plane counts disagree with the engine.
    #[error("channel mismatch: engine has {expected} planes, got {actual}")]
    ChannelMismatch {
        /// Planes the engine was built for.
        expected: usize,
        /// Planes passed in.
        actual: usize,
    },

    /// Failed to create resampler.
    #[error("failed to create resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    /// Failed to resample audio.
    #[error("failed to resample audio: {0}")]
    Process(#[from] rubato::ResampleError),

    /// Failed to wrap sample planes for the resampler.
    #[error("resampler buffer error: {0}")]
    Buffer(String),
}
