//! Python bindings for [`AudioEngine`] on the CPAL backend.

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::audio_engine::AudioEngine;
use crate::audio_engine::audio_stream::CpalBackend;
use crate::audio_engine::config::{EngineConfig, ResamplerQuality};
use crate::audio_engine::errors::EngineError;

impl From<EngineError> for PyErr {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ChannelOutOfRange { .. }
            | EngineError::InvalidLength(_)
            | EngineError::VolumeOutOfRange(_)
            | EngineError::PanOutOfRange(_)
            | EngineError::LatencyOutOfRange(_)
            | EngineError::SampleRateOutOfRange(_)
            | EngineError::InvalidConfig(_) => PyValueError::new_err(e.to_string()),
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

/// Software mixer driving the default audio host.
///
/// Methods that wait on the device lock release the GIL first. The tick
/// thread needs the GIL to run the recording callback and may hold that lock
/// meanwhile.
#[pyclass(name = "AudioEngine")]
pub struct PyAudioEngine {
    engine: AudioEngine<CpalBackend>,
}

#[pymethods]
impl PyAudioEngine {
    /// Create an engine with `num_buffers` mono secondary buffers.
    ///
    /// Channels listed in `loop_channels` replay their clip until stopped.
    #[new]
    #[pyo3(signature = (
        num_buffers=8,
        sample_rate=44_100,
        latency_ms=50,
        loop_channels=Vec::new(),
        linear_resampler=false
    ))]
    pub fn new(
        num_buffers: usize,
        sample_rate: u32,
        latency_ms: u32,
        loop_channels: Vec<usize>,
        linear_resampler: bool,
    ) -> PyResult<Self> {
        let quality = if linear_resampler {
            ResamplerQuality::Linear
        } else {
            ResamplerQuality::Sinc
        };
        let config = loop_channels.into_iter().fold(
            EngineConfig::default()
                .with_num_buffers(num_buffers)
                .with_playback_sample_rate(sample_rate)
                .with_buffer_latency_ms(latency_ms)
                .with_resampler_quality(quality),
            EngineConfig::with_loop_channel,
        );

        Ok(Self {
            engine: AudioEngine::new(config, CpalBackend)?,
        })
    }

    #[pyo3(signature = (device_name=None))]
    pub fn init(&self, py: Python<'_>, device_name: Option<&str>) -> PyResult<()> {
        Ok(py.detach(|| self.engine.init(device_name))?)
    }

    pub fn uninit(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.engine.uninit())?)
    }

    pub fn is_initialized(&self, py: Python<'_>) -> bool {
        py.detach(|| self.engine.is_initialized())
    }

    /// Stop the tick loop and close all devices.
    pub fn shut_down(&self, py: Python<'_>) -> PyResult<()> {
        py.detach(|| {
            self.engine.stop_tick_loop();
            match self.engine.uninit() {
                Ok(()) | Err(EngineError::NotInitialized) => Ok(()),
                Err(e) => Err(e),
            }
        })?;
        Ok(())
    }

    /// Open the capture device; `callback(data: bytes, sample_rate: int)`
    /// receives every recorded chunk.
    #[pyo3(signature = (callback, device_name=None))]
    pub fn create_capture_buffer(
        &self,
        py: Python<'_>,
        callback: Py<PyAny>,
        device_name: Option<&str>,
    ) -> PyResult<()> {
        let forward = move |pcm: &[u8], sample_rate: u32| {
            Python::attach(|py| {
                if let Err(e) = callback.call1(py, (PyBytes::new(py, pcm), sample_rate)) {
                    log::error!("Recording callback raised: {e}");
                }
            });
        };
        Ok(py.detach(|| self.engine.create_capture_buffer(forward, device_name))?)
    }

    pub fn delete_capture_buffer(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.engine.delete_capture_buffer())?)
    }

    pub fn start_capture(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.engine.start_capture())?)
    }

    pub fn stop_capture(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.engine.stop_capture())?)
    }

    pub fn is_capturing(&self, py: Python<'_>) -> bool {
        py.detach(|| self.engine.is_capturing())
    }

    /// Start one channel, or all of them when `channel` is omitted.
    #[pyo3(signature = (channel=None))]
    pub fn play(&self, channel: Option<usize>) -> PyResult<()> {
        match channel {
            Some(channel) => self.engine.play_channel(channel)?,
            None => self.engine.play(),
        }
        Ok(())
    }

    /// Stop one channel, or all of them when `channel` is omitted.
    #[pyo3(signature = (channel=None))]
    pub fn stop(&self, py: Python<'_>, channel: Option<usize>) -> PyResult<()> {
        match channel {
            Some(channel) => self.engine.stop_channel(channel)?,
            None => py.detach(|| self.engine.stop())?,
        }
        Ok(())
    }

    pub fn fill_buffer(&self, channel: usize, data: &[u8], sample_rate: u32) -> PyResult<()> {
        Ok(self.engine.fill_buffer(channel, data, sample_rate)?)
    }

    pub fn fill_buffer_silence(&self, channel: usize, length: usize) -> PyResult<()> {
        Ok(self.engine.fill_buffer_silence(channel, length)?)
    }

    #[pyo3(signature = (channel, data, sample_rate, block_size, every_nth_block, initial_offset=0))]
    pub fn fill_buffer_interleaved(
        &self,
        channel: usize,
        data: &[u8],
        sample_rate: u32,
        block_size: usize,
        every_nth_block: usize,
        initial_offset: usize,
    ) -> PyResult<()> {
        Ok(self.engine.fill_buffer_interleaved(
            channel,
            data,
            sample_rate,
            block_size,
            every_nth_block,
            initial_offset,
        )?)
    }

    pub fn set_volume(&self, channel: usize, volume: i32) -> PyResult<()> {
        Ok(self.engine.set_volume(channel, volume)?)
    }

    pub fn get_volume(&self, channel: usize) -> PyResult<i32> {
        Ok(self.engine.volume(channel)?)
    }

    pub fn set_pan(&self, channel: usize, pan: i32) -> PyResult<()> {
        Ok(self.engine.set_pan(channel, pan)?)
    }

    pub fn get_pan(&self, channel: usize) -> PyResult<i32> {
        Ok(self.engine.pan(channel)?)
    }

    pub fn set_master_volume(&self, volume: i32) -> PyResult<()> {
        Ok(self.engine.set_master_volume(volume)?)
    }

    pub fn get_master_volume(&self) -> i32 {
        self.engine.master_volume()
    }

    pub fn set_sample_rate(&self, channel: usize, sample_rate: u32) -> PyResult<()> {
        Ok(self.engine.set_sample_rate(channel, sample_rate)?)
    }

    pub fn get_sample_rate(&self, channel: usize) -> PyResult<u32> {
        Ok(self.engine.sample_rate(channel)?)
    }

    pub fn set_record_sample_rate(&self, py: Python<'_>, sample_rate: u32) -> PyResult<()> {
        Ok(py.detach(|| self.engine.set_record_sample_rate(sample_rate))?)
    }

    pub fn get_record_sample_rate(&self) -> u32 {
        self.engine.record_sample_rate()
    }

    pub fn set_buffer_latency(&self, py: Python<'_>, milliseconds: i64) -> PyResult<()> {
        Ok(py.detach(|| self.engine.set_buffer_latency(milliseconds))?)
    }

    pub fn get_buffer_latency(&self) -> u32 {
        self.engine.buffer_latency_ms()
    }

    pub fn get_playback_sample_rate(&self) -> u32 {
        self.engine.playback_sample_rate()
    }

    pub fn get_peak(&self, channel: usize) -> PyResult<i32> {
        Ok(self.engine.peak(channel)?)
    }

    pub fn is_buffer_playing(&self, channel: usize) -> PyResult<bool> {
        Ok(self.engine.is_buffer_playing(channel)?)
    }

    pub fn queued_bytes(&self, channel: usize) -> PyResult<usize> {
        Ok(self.engine.queued_bytes(channel)?)
    }

    pub fn writable_bytes(&self, channel: usize) -> PyResult<usize> {
        Ok(self.engine.writable_bytes(channel)?)
    }

    /// Call `callback(name: str)` for every output device.
    pub fn enumerate_devices(&self, callback: Bound<'_, PyAny>) -> PyResult<usize> {
        let mut failure = None;
        let count = self.engine.enumerate_devices(|name| {
            if failure.is_none() {
                failure = callback.call1((name,)).err();
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Run one Monitor → Capture → Mixer pass; returns the mixer outcome.
    pub fn tick(&self, py: Python<'_>) -> PyResult<String> {
        let report = py.detach(|| self.engine.tick())?;
        Ok(format!("{:?}", report.mix).to_lowercase())
    }

    pub fn start_tick_loop(&self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.engine.start_tick_loop())?)
    }

    pub fn stop_tick_loop(&self, py: Python<'_>) {
        // The worker may be waiting on the GIL inside a recording callback.
        py.detach(|| self.engine.stop_tick_loop());
    }

    pub fn is_tick_loop_running(&self) -> bool {
        self.engine.is_tick_loop_running()
    }

    /// Engine counters as a dict.
    pub fn metrics(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let m = self.engine.metrics();
        let dict = PyDict::new(py);
        dict.set_item("ticks", m.ticks)?;
        dict.set_item("idle_ticks", m.idle_ticks)?;
        dict.set_item("deferred_ticks", m.deferred_ticks)?;
        dict.set_item("saturated_ticks", m.saturated_ticks)?;
        dict.set_item("mixed_ticks", m.mixed_ticks)?;
        dict.set_item("short_reads", m.short_reads)?;
        dict.set_item("empty_reads", m.empty_reads)?;
        dict.set_item("resample_failures", m.resample_failures)?;
        dict.set_item("silence_fills", m.silence_fills)?;
        dict.set_item("fill_overflows", m.fill_overflows)?;
        dict.set_item("playback_xruns", m.playback_xruns)?;
        dict.set_item("playback_recoveries", m.playback_recoveries)?;
        dict.set_item("suspend_resumes", m.suspend_resumes)?;
        dict.set_item("write_retries", m.write_retries)?;
        dict.set_item("dropped_writes", m.dropped_writes)?;
        dict.set_item("fatal_errors", m.fatal_errors)?;
        dict.set_item("capture_chunks", m.capture_chunks)?;
        dict.set_item("capture_xruns", m.capture_xruns)?;
        Ok(dict.into_any().unbind())
    }
}

impl Drop for PyAudioEngine {
    fn drop(&mut self) {
        // Join the worker before the engine closes its devices.
        Python::attach(|py| py.detach(|| self.engine.stop_tick_loop()));
    }
}
