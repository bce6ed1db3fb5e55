//! Software mixer for 16-bit PCM secondary buffers.
//!
//! See [`audio_engine::AudioEngine`] for the entry point. Building with the
//! `python` feature also produces the `buffer_mixer` extension module.

pub mod audio_engine;

#[cfg(feature = "python")]
mod python;

pub use audio_engine::AudioEngine;
pub use audio_engine::config::{BufferMode, EngineConfig, MixSummation, ResamplerQuality};
pub use audio_engine::errors::{DeviceError, EngineError};

/// The Python module implemented in Rust.
#[cfg(feature = "python")]
#[pyo3::pymodule]
mod buffer_mixer {
    #[pymodule_export]
    use super::python::PyAudioEngine;
}
