//! Audio Engine Module
//!
//! This module provides a software mixer that feeds a fixed set of mono
//! secondary buffers into one stereo playback device, with an optional
//! capture path. It is organized into sub-modules, each with a specific
//! responsibility:
//!
//! - [`audio_stream`]: CPAL backend and logger setup
//! - [`capture`]: Capture path and recording callback
//! - [`channel`]: Secondary buffers
//! - [`config`]: Engine configuration
//! - [`constants`]: Configuration constants and limits
//! - [`device`]: Sink/Source contracts and device recovery
//! - [`errors`]: Audio-specific error types
//! - [`metrics`]: Engine counters
//! - [`mixer`]: The per-tick mixing pass
//! - [`mock`]: Scripted backend for tests and headless use
//! - [`monitor`]: Silence top-up of starving channels
//! - [`resampler`]: Rate conversion of 16-bit PCM
//! - [`ring_buffer`]: Byte rings backing the secondary buffers
//!
//! The main [`AudioEngine`] struct owns the channels and the devices and
//! drives them from a single tick loop.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::audio_engine::audio_stream::setup_logger;
use crate::audio_engine::capture::{
    CaptureMonitor, CaptureOutcome, CapturedChunk, RecordingCallback,
};
use crate::audio_engine::channel::Channel;
use crate::audio_engine::config::{EngineConfig, validate_latency_ms, validate_sample_rate};
use crate::audio_engine::constants::{BYTES_PER_WORD, STEREO, VOLUME_MAX, VOLUME_MIN};
use crate::audio_engine::device::{AudioBackend, Sink, Source};
use crate::audio_engine::errors::{DeviceError, EngineError};
use crate::audio_engine::metrics::{EngineMetrics, MetricsSnapshot};
use crate::audio_engine::mixer::{MixParams, Mixer, TickOutcome};
use crate::audio_engine::monitor::BufferMonitor;

pub mod audio_stream;
pub mod capture;
pub mod channel;
pub mod config;
pub mod constants;
pub mod device;
pub mod errors;
pub mod metrics;
pub mod mixer;
pub mod mock;
pub mod monitor;
pub mod resampler;
pub mod ring_buffer;

/// What one pass of the tick loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Channels topped up with silence.
    pub monitor_fills: usize,
    pub capture: CaptureOutcome,
    /// Mixer result; `Idle` when no playback device is open.
    pub mix: TickOutcome,
}

/// Recording callback, locked on its own so it never runs under the device
/// lock.
type Recorder = Arc<Mutex<dyn RecordingCallback>>;

/// Everything that talks to a device. Only the tick and lifecycle calls
/// take this lock.
struct DeviceSide<B: AudioBackend> {
    sink: Option<B::Sink>,
    capture: Option<CaptureMonitor<B::Source>>,
    recorder: Option<Recorder>,
    mixer: Mixer,
    monitor: BufferMonitor,
}

struct EngineShared<B: AudioBackend> {
    config: EngineConfig,
    backend: B,
    channels: Vec<Channel>,
    master_volume: AtomicI32,
    latency_ms: AtomicU32,
    playback_rate: AtomicU32,
    record_rate: AtomicU32,
    device: Mutex<DeviceSide<B>>,
    metrics: EngineMetrics,
    running: AtomicBool,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: AudioBackend> EngineShared<B> {
    fn device(&self) -> MutexGuard<'_, DeviceSide<B>> {
        lock(&self.device)
    }

    fn mix_params(&self) -> MixParams {
        MixParams {
            playback_sample_rate: self.playback_rate.load(Ordering::Acquire),
            latency_ms: self.latency_ms.load(Ordering::Acquire),
            master_volume: self.master_volume.load(Ordering::Acquire),
        }
    }

    /// Monitor, then capture, then mixer. The captured chunk reaches the
    /// recording callback after the device lock is released.
    fn tick(&self) -> Result<TickReport, EngineError> {
        let (report, captured) = self.tick_devices()?;
        if let Some((recorder, chunk)) = captured {
            lock(&recorder).forward(&chunk.pcm, chunk.sample_rate);
        }
        Ok(report)
    }

    fn tick_devices(&self) -> Result<(TickReport, Option<(Recorder, CapturedChunk)>), EngineError> {
        let mut device = self.device();
        let DeviceSide {
            sink,
            capture,
            recorder,
            mixer,
            monitor,
        } = &mut *device;
        if sink.is_none() && capture.is_none() {
            return Err(EngineError::NotInitialized);
        }

        let monitor_fills = monitor.run(&self.channels, &self.metrics);

        let (capture, captured) = match capture.as_mut() {
            Some(capture) => {
                let outcome = capture.tick(&self.metrics)?;
                let chunk = capture.take_chunk();
                (outcome, recorder.clone().zip(chunk))
            }
            None => (CaptureOutcome::Idle, None),
        };

        let mix = match sink.as_mut() {
            Some(sink) => {
                mixer.process_sound_buffer(&self.channels, sink, self.mix_params(), &self.metrics)?
            }
            None => TickOutcome::Idle,
        };

        let report = TickReport {
            monitor_fills,
            capture,
            mix,
        };
        Ok((report, captured))
    }

    fn open_sink(&self, device_name: Option<&str>) -> Result<(B::Sink, u32), DeviceError> {
        let mut sink = self.backend.create_sink()?;
        sink.open(device_name)?;
        let negotiated = sink
            .negotiate(self.config.playback_sample_rate, STEREO, BYTES_PER_WORD)
            .and_then(|rate| {
                if rate == 0 {
                    return Err(DeviceError::Negotiation("device reported 0 Hz".to_string()));
                }
                sink.prepare().map(|()| rate)
            });
        match negotiated {
            Ok(rate) => Ok((sink, rate)),
            Err(e) => {
                sink.close();
                Err(e)
            }
        }
    }

    fn open_source(&self, device_name: Option<&str>) -> Result<(B::Source, u32), DeviceError> {
        let mut source = self.backend.create_source()?;
        source.open(device_name)?;
        match source.negotiate(
            self.config.capture_sample_rate,
            self.config.capture_channels,
            BYTES_PER_WORD,
        ) {
            Ok(rate) if rate > 0 => Ok((source, rate)),
            Ok(_) => {
                source.close();
                Err(DeviceError::Negotiation("device reported 0 Hz".to_string()))
            }
            Err(e) => {
                source.close();
                Err(e)
            }
        }
    }
}

fn run_tick_loop<B: AudioBackend>(shared: Arc<EngineShared<B>>) {
    log::info!("Tick loop started");
    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = shared.tick() {
            log::error!("Tick loop stopped: {e}");
            break;
        }
        thread::sleep(shared.config.tick_interval);
    }
    shared.running.store(false, Ordering::Release);
    log::info!("Tick loop exited");
}

/// Software mixing engine.
///
/// Channel operations take `&self` and may be called from any thread while
/// the tick loop runs. Latency changes and `uninit` require the loop to be
/// stopped first.
pub struct AudioEngine<B: AudioBackend> {
    shared: Arc<EngineShared<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: AudioBackend> AudioEngine<B> {
    /// Creates the engine and all of its channels. No device is opened yet.
    pub fn new(config: EngineConfig, backend: B) -> Result<Self, EngineError> {
        config.validate()?;

        let channels = (0..config.num_buffers)
            .map(|index| {
                Channel::new(
                    index,
                    config.mode_for(index),
                    config.secondary_buffer_size,
                    config.resampler_quality,
                    config.buffer_latency_ms,
                )
                .map_err(|e| {
                    EngineError::InvalidConfig(format!("failed to create channel {index}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let shared = EngineShared {
            master_volume: AtomicI32::new(VOLUME_MAX),
            latency_ms: AtomicU32::new(config.buffer_latency_ms),
            playback_rate: AtomicU32::new(config.playback_sample_rate),
            record_rate: AtomicU32::new(config.record_sample_rate),
            device: Mutex::new(DeviceSide {
                sink: None,
                capture: None,
                recorder: None,
                mixer: Mixer::new(config.mix_summation),
                monitor: BufferMonitor::new(),
            }),
            metrics: EngineMetrics::new(),
            running: AtomicBool::new(false),
            channels,
            backend,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        })
    }

    /// Opens and prepares the playback device.
    ///
    /// # Parameters
    ///
    /// - `device_name`: Output device to open, or `None` for the default.
    pub fn init(&self, device_name: Option<&str>) -> Result<(), EngineError> {
        setup_logger();

        let mut device = self.shared.device();
        if device.sink.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }

        let (sink, rate) = self.shared.open_sink(device_name).inspect_err(|e| {
            log::error!("Failed to open playback device: {e}");
        })?;
        self.shared.playback_rate.store(rate, Ordering::Release);
        device.sink = Some(sink);

        log::info!(
            "Audio engine initialized ({} buffers, {} Hz, {} ms latency)",
            self.shared.channels.len(),
            rate,
            self.buffer_latency_ms()
        );
        Ok(())
    }

    /// Closes the playback and capture devices.
    pub fn uninit(&self) -> Result<(), EngineError> {
        if self.is_tick_loop_running() {
            return Err(EngineError::TickLoopRunning);
        }

        let mut device = self.shared.device();
        let mut sink = device.sink.take().ok_or(EngineError::NotInitialized)?;
        if let Some(capture) = device.capture.take() {
            capture.close();
        }
        device.recorder = None;
        sink.close();
        log::info!("Audio engine uninitialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.device().sink.is_some()
    }

    /// Opens the capture device and routes its output to `callback`.
    ///
    /// The callback runs on the ticking thread without the device lock held,
    /// so it may call any engine method except [`tick`](Self::tick).
    pub fn create_capture_buffer(
        &self,
        callback: impl RecordingCallback + 'static,
        device_name: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut device = self.shared.device();
        if device.capture.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }

        let (source, device_rate) = self.shared.open_source(device_name).inspect_err(|e| {
            log::error!("Failed to open capture device: {e}");
        })?;
        let config = &self.shared.config;
        let monitor = CaptureMonitor::new(
            source,
            device_rate,
            self.record_sample_rate(),
            config.capture_channels,
            self.buffer_latency_ms(),
            config.max_capture_chunk_bytes,
            config.resampler_quality,
        )?;
        device.capture = Some(monitor);
        device.recorder = Some(Arc::new(Mutex::new(callback)));
        log::info!("Capture buffer created at {device_rate} Hz");
        Ok(())
    }

    pub fn delete_capture_buffer(&self) -> Result<(), EngineError> {
        let mut device = self.shared.device();
        let capture = device
            .capture
            .take()
            .ok_or(EngineError::CaptureNotInitialized)?;
        device.recorder = None;
        capture.close();
        Ok(())
    }

    pub fn start_capture(&self) -> Result<(), EngineError> {
        let mut device = self.shared.device();
        let capture = device
            .capture
            .as_mut()
            .ok_or(EngineError::CaptureNotInitialized)?;
        capture.start()?;
        Ok(())
    }

    pub fn stop_capture(&self) -> Result<(), EngineError> {
        let mut device = self.shared.device();
        let capture = device
            .capture
            .as_mut()
            .ok_or(EngineError::CaptureNotInitialized)?;
        capture.stop()?;
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.shared
            .device()
            .capture
            .as_ref()
            .is_some_and(CaptureMonitor::is_capturing)
    }

    fn channel(&self, channel: usize) -> Result<&Channel, EngineError> {
        self.shared
            .channels
            .get(channel)
            .ok_or(EngineError::ChannelOutOfRange {
                channel,
                count: self.shared.channels.len(),
            })
    }

    /// Starts every channel.
    pub fn play(&self) {
        self.shared.channels.iter().for_each(Channel::play);
    }

    pub fn play_channel(&self, channel: usize) -> Result<(), EngineError> {
        self.channel(channel)?.play();
        Ok(())
    }

    /// Stops every channel and drops whatever the device still has queued.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.shared.channels.iter().for_each(Channel::stop);
        if let Some(sink) = self.shared.device().sink.as_mut() {
            sink.drop_pending()?;
        }
        Ok(())
    }

    pub fn stop_channel(&self, channel: usize) -> Result<(), EngineError> {
        self.channel(channel)?.stop();
        Ok(())
    }

    pub fn is_buffer_playing(&self, channel: usize) -> Result<bool, EngineError> {
        Ok(self.channel(channel)?.is_playing())
    }

    /// Queues 16-bit mono PCM on `channel`.
    ///
    /// # Parameters
    ///
    /// - `data`: Little-endian samples, non-empty and of even length.
    /// - `source_sample_rate`: Rate of `data`; the channel switches to it
    ///   when it differs.
    ///
    /// # Returns
    ///
    /// [`EngineError::BufferOverflow`] when the ring filled up. The bytes
    /// that fit stay queued.
    pub fn fill_buffer(
        &self,
        channel: usize,
        data: &[u8],
        source_sample_rate: u32,
    ) -> Result<(), EngineError> {
        let result = self.channel(channel)?.fill(data, source_sample_rate);
        if let Err(EngineError::BufferOverflow { written, requested }) = &result {
            log::debug!("Channel {channel}: overflow, kept {written} of {requested} bytes");
        }
        result
    }

    pub fn fill_buffer_silence(&self, channel: usize, len: usize) -> Result<(), EngineError> {
        self.channel(channel)?.fill_silence(len)
    }

    /// Queues one channel out of an interleaved multi-channel buffer.
    ///
    /// Takes `block_size` bytes, skips the next `every_nth_block - 1`
    /// blocks, and repeats, starting at `initial_offset`. A trailing partial
    /// block is ignored.
    pub fn fill_buffer_interleaved(
        &self,
        channel: usize,
        data: &[u8],
        sample_rate: u32,
        block_size: usize,
        every_nth_block: usize,
        initial_offset: usize,
    ) -> Result<(), EngineError> {
        if block_size == 0 || block_size % 2 != 0 {
            return Err(EngineError::InvalidLength(block_size));
        }
        if every_nth_block == 0 {
            return Err(EngineError::InvalidLength(every_nth_block));
        }

        let stride = block_size * every_nth_block;
        let extracted: Vec<u8> = data
            .get(initial_offset..)
            .unwrap_or_default()
            .chunks(stride)
            .filter_map(|frame| frame.get(..block_size))
            .flatten()
            .copied()
            .collect();
        self.fill_buffer(channel, &extracted, sample_rate)
    }

    pub fn set_volume(&self, channel: usize, volume: i32) -> Result<(), EngineError> {
        self.channel(channel)?.set_volume(volume)
    }

    pub fn volume(&self, channel: usize) -> Result<i32, EngineError> {
        Ok(self.channel(channel)?.volume())
    }

    pub fn set_pan(&self, channel: usize, pan: i32) -> Result<(), EngineError> {
        self.channel(channel)?.set_pan(pan)
    }

    pub fn pan(&self, channel: usize) -> Result<i32, EngineError> {
        Ok(self.channel(channel)?.pan())
    }

    /// Volume applied on top of every channel, in hundredths of a dB.
    pub fn set_master_volume(&self, volume: i32) -> Result<(), EngineError> {
        if !(VOLUME_MIN..=VOLUME_MAX).contains(&volume) {
            return Err(EngineError::VolumeOutOfRange(volume));
        }
        self.shared.master_volume.store(volume, Ordering::Release);
        Ok(())
    }

    pub fn master_volume(&self) -> i32 {
        self.shared.master_volume.load(Ordering::Acquire)
    }

    pub fn set_sample_rate(&self, channel: usize, rate: u32) -> Result<(), EngineError> {
        self.channel(channel)?.set_sample_rate(rate)
    }

    pub fn sample_rate(&self, channel: usize) -> Result<u32, EngineError> {
        Ok(self.channel(channel)?.sample_rate())
    }

    /// Rate handed to the recording callback.
    pub fn set_record_sample_rate(&self, rate: u32) -> Result<(), EngineError> {
        let rate = validate_sample_rate(rate)?;
        self.shared.record_rate.store(rate, Ordering::Release);
        if let Some(capture) = self.shared.device().capture.as_mut() {
            capture.set_record_rate(rate);
        }
        Ok(())
    }

    pub fn record_sample_rate(&self) -> u32 {
        self.shared.record_rate.load(Ordering::Acquire)
    }

    /// Changes the latency interval of every channel and of capture.
    ///
    /// Refused while the tick loop runs.
    pub fn set_buffer_latency(&self, milliseconds: i64) -> Result<(), EngineError> {
        if self.is_tick_loop_running() {
            return Err(EngineError::TickLoopRunning);
        }
        let latency_ms = validate_latency_ms(milliseconds)?;

        let mut device = self.shared.device();
        self.shared.latency_ms.store(latency_ms, Ordering::Release);
        for channel in &self.shared.channels {
            channel.set_latency_ms(latency_ms);
        }
        if let Some(capture) = device.capture.as_mut() {
            capture.set_latency_ms(latency_ms);
        }
        log::info!("Buffer latency set to {latency_ms} ms");
        Ok(())
    }

    pub fn buffer_latency_ms(&self) -> u32 {
        self.shared.latency_ms.load(Ordering::Acquire)
    }

    /// Rate the playback device agreed to.
    pub fn playback_sample_rate(&self) -> u32 {
        self.shared.playback_rate.load(Ordering::Acquire)
    }

    pub fn peak(&self, channel: usize) -> Result<i32, EngineError> {
        Ok(self.channel(channel)?.peak())
    }

    pub fn queued_bytes(&self, channel: usize) -> Result<usize, EngineError> {
        Ok(self.channel(channel)?.queued_bytes())
    }

    pub fn writable_bytes(&self, channel: usize) -> Result<usize, EngineError> {
        Ok(self.channel(channel)?.writable_bytes())
    }

    pub fn num_buffers(&self) -> usize {
        self.shared.channels.len()
    }

    /// Calls `callback` with each output device name and returns the count.
    pub fn enumerate_devices(&self, mut callback: impl FnMut(&str)) -> Result<usize, EngineError> {
        let devices = self.shared.backend.enumerate_devices()?;
        for name in &devices {
            callback(name);
        }
        Ok(devices.len())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Runs one pass by hand.
    pub fn tick(&self) -> Result<TickReport, EngineError> {
        self.shared.tick()
    }

    /// Spawns the worker that ticks every `tick_interval` until stopped or
    /// until a fatal device error.
    pub fn start_tick_loop(&self) -> Result<(), EngineError> {
        let mut worker = lock(&self.worker);
        if self.shared.running.load(Ordering::Acquire) {
            return Err(EngineError::TickLoopRunning);
        }
        {
            let device = self.shared.device();
            if device.sink.is_none() && device.capture.is_none() {
                return Err(EngineError::NotInitialized);
            }
        }
        if let Some(stale) = worker.take() {
            // Previous loop died on its own.
            let _ = stale.join();
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("buffer-mixer-tick".to_string())
            .spawn(move || run_tick_loop(shared))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                DeviceError::Backend(format!("failed to spawn tick thread: {e}"))
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops the worker and waits for its current pass to finish.
    pub fn stop_tick_loop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("Tick thread panicked");
            }
        }
    }

    pub fn is_tick_loop_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl<B: AudioBackend> Drop for AudioEngine<B> {
    fn drop(&mut self) {
        self.stop_tick_loop();
        let mut device = self.shared.device();
        if let Some(capture) = device.capture.take() {
            capture.close();
        }
        device.recorder = None;
        if let Some(mut sink) = device.sink.take() {
            sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::config::ResamplerQuality;
    use crate::audio_engine::device::DeviceState;
    use crate::audio_engine::mock::{MockBackend, MockSinkHandle, MockSourceHandle, SinkCall};
    use std::sync::mpsc;
    use std::time::Duration;

    const RATE: u32 = 50_000;
    const LATENCY_MS: u32 = 2;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_num_buffers(2)
            .with_playback_sample_rate(RATE)
            .with_buffer_latency_ms(LATENCY_MS)
            .with_resampler_quality(ResamplerQuality::Linear)
    }

    fn engine() -> (AudioEngine<MockBackend>, MockSinkHandle) {
        let backend = MockBackend::new();
        let sink = backend.sink_handle();
        let engine = AudioEngine::new(config(), backend).unwrap();
        engine.init(None).unwrap();
        sink.clear_calls();
        (engine, sink)
    }

    fn pcm(value: i16, count: usize) -> Vec<u8> {
        std::iter::repeat_n(value.to_le_bytes(), count)
            .flatten()
            .collect()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = EngineConfig::default().with_num_buffers(0);
        let result = AudioEngine::new(config, MockBackend::new());
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_init_lifecycle() {
        let backend = MockBackend::new();
        let sink = backend.sink_handle();
        let engine = AudioEngine::new(config(), backend).unwrap();

        assert!(matches!(engine.tick(), Err(EngineError::NotInitialized)));
        engine.init(Some("mock output")).unwrap();
        assert!(engine.is_initialized());
        assert_eq!(sink.state(), DeviceState::Prepared);
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Open(Some("mock output".to_string())),
                SinkCall::Negotiate(RATE),
                SinkCall::Prepare,
            ]
        );
        assert!(matches!(engine.init(None), Err(EngineError::AlreadyInitialized)));

        engine.uninit().unwrap();
        assert!(!engine.is_initialized());
        assert!(matches!(engine.uninit(), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn test_negotiated_rate_is_used() {
        let backend = MockBackend::new();
        backend.sink_handle().set_negotiated_rate(Some(48_000));
        let engine = AudioEngine::new(config(), backend).unwrap();
        engine.init(None).unwrap();
        assert_eq!(engine.playback_sample_rate(), 48_000);
    }

    #[test]
    fn test_idle_tick_leaves_sink_alone() {
        let (engine, sink) = engine();
        let report = engine.tick().unwrap();
        assert_eq!(report.mix, TickOutcome::Idle);
        assert_eq!(report.monitor_fills, 0);
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_underrun_recovery() {
        let (engine, sink) = engine();
        engine.fill_buffer(0, &pcm(1000, 100), RATE).unwrap();
        engine.play_channel(0).unwrap();

        // Prime and start.
        assert_eq!(engine.tick().unwrap().mix, TickOutcome::Deferred);
        assert_eq!(sink.state(), DeviceState::Running);

        sink.set_state(DeviceState::XRun);
        sink.clear_calls();
        assert_eq!(engine.tick().unwrap().mix, TickOutcome::Recovered);
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Prepare,
                SinkCall::Write {
                    bytes: 400,
                    silent: true
                },
                SinkCall::Start,
            ]
        );

        // Real data goes out on the next tick.
        sink.clear_calls();
        assert_eq!(engine.tick().unwrap().mix, TickOutcome::Mixed);
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), 400);
        assert!(payloads[0].chunks_exact(2).all(|b| i16::from_le_bytes([b[0], b[1]]) == 1000));
        assert_eq!(engine.peak(0).unwrap(), 1000);

        let metrics = engine.metrics();
        assert_eq!(metrics.playback_xruns, 1);
        assert_eq!(metrics.playback_recoveries, 1);
        assert_eq!(metrics.mixed_ticks, 1);
    }

    #[test]
    fn test_monitor_runs_before_mix() {
        let (engine, _sink) = engine();
        engine.play_channel(1).unwrap();
        let report = engine.tick().unwrap();
        assert_eq!(report.monitor_fills, 1);
        // One chunk at 44.1 kHz, 2 ms: 176 bytes.
        assert_eq!(engine.queued_bytes(1).unwrap(), 176);
    }

    #[test]
    fn test_loop_channel_skips_monitor_and_replays() {
        let backend = MockBackend::new();
        let sink = backend.sink_handle();
        let engine = AudioEngine::new(config().with_loop_channel(0), backend).unwrap();
        engine.init(None).unwrap();

        let clip = [300i16, -300];
        let bytes: Vec<u8> = clip.iter().flat_map(|s| s.to_le_bytes()).collect();
        engine.fill_buffer(0, &bytes, RATE).unwrap();
        engine.play_channel(0).unwrap();

        assert_eq!(engine.tick().unwrap().mix, TickOutcome::Deferred);
        sink.clear_calls();
        let report = engine.tick().unwrap();
        assert_eq!(report.mix, TickOutcome::Mixed);
        assert_eq!(report.monitor_fills, 0);

        let payloads = sink.payloads();
        let samples: Vec<i16> = payloads[0]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples.len(), 200);
        for (i, pair) in samples.chunks_exact(2).enumerate() {
            assert_eq!(pair, [clip[i % 2], clip[i % 2]]);
        }
        assert_eq!(engine.queued_bytes(0).unwrap(), 4);
    }

    #[test]
    fn test_fill_overflow_keeps_written_bytes() {
        let (engine, _sink) = engine();
        let result = engine.fill_buffer(0, &vec![0u8; 40000], 44_100);
        assert!(matches!(
            result,
            Err(EngineError::BufferOverflow {
                written: 32768,
                requested: 40000
            })
        ));
        assert_eq!(engine.queued_bytes(0).unwrap(), 32768);
        assert_eq!(engine.writable_bytes(0).unwrap(), 0);
    }

    #[test]
    fn test_fill_switches_source_rate() {
        let (engine, _sink) = engine();
        engine.fill_buffer(0, &pcm(1, 10), 22_050).unwrap();
        assert_eq!(engine.sample_rate(0).unwrap(), 22_050);
    }

    #[test]
    fn test_channel_bounds_checked() {
        let (engine, _sink) = engine();
        assert!(matches!(
            engine.set_volume(2, 0),
            Err(EngineError::ChannelOutOfRange { channel: 2, count: 2 })
        ));
        assert!(engine.fill_buffer_silence(5, 10).is_err());
        assert!(engine.play_channel(9).is_err());
        assert!(matches!(
            engine.fill_buffer_silence(0, 0),
            Err(EngineError::InvalidLength(0))
        ));
    }

    #[test]
    fn test_volume_pan_and_master() {
        let (engine, _sink) = engine();
        engine.set_volume(0, -1200).unwrap();
        engine.set_pan(0, 300).unwrap();
        assert_eq!(engine.volume(0).unwrap(), -1200);
        assert_eq!(engine.pan(0).unwrap(), 300);
        assert!(matches!(
            engine.set_volume(0, 1),
            Err(EngineError::VolumeOutOfRange(1))
        ));
        assert!(matches!(
            engine.set_pan(0, -1001),
            Err(EngineError::PanOutOfRange(-1001))
        ));

        engine.set_master_volume(-600).unwrap();
        assert_eq!(engine.master_volume(), -600);
        assert!(engine.set_master_volume(-9601).is_err());
        assert_eq!(engine.master_volume(), -600);
    }

    #[test]
    fn test_fill_interleaved_extracts_blocks() {
        let (engine, _sink) = engine();
        let data: Vec<u8> = (0..16).collect();
        engine
            .fill_buffer_interleaved(0, &data, 44_100, 2, 2, 2)
            .unwrap();
        assert_eq!(engine.queued_bytes(0).unwrap(), 8);

        let mut out = [0u8; 8];
        engine.shared.channels[0].lock().ring.read(&mut out);
        assert_eq!(out, [2, 3, 6, 7, 10, 11, 14, 15]);

        assert!(engine.fill_buffer_interleaved(0, &data, 44_100, 0, 2, 0).is_err());
        assert!(engine.fill_buffer_interleaved(0, &data, 44_100, 2, 0, 0).is_err());
    }

    #[test]
    fn test_stop_drops_pending_frames() {
        let (engine, sink) = engine();
        engine.play();
        assert!(engine.is_buffer_playing(0).unwrap());
        assert!(engine.is_buffer_playing(1).unwrap());

        engine.stop().unwrap();
        assert!(!engine.is_buffer_playing(0).unwrap());
        assert_eq!(sink.calls(), vec![SinkCall::DropPending]);
        assert_eq!(sink.state(), DeviceState::Setup);
    }

    #[test]
    fn test_latency_change_requires_stopped_loop() {
        let (engine, _sink) = engine();
        engine.start_tick_loop().unwrap();
        assert!(engine.is_tick_loop_running());
        assert!(matches!(
            engine.start_tick_loop(),
            Err(EngineError::TickLoopRunning)
        ));
        assert!(matches!(
            engine.set_buffer_latency(20),
            Err(EngineError::TickLoopRunning)
        ));
        assert!(matches!(engine.uninit(), Err(EngineError::TickLoopRunning)));

        engine.stop_tick_loop();
        assert!(!engine.is_tick_loop_running());
        engine.set_buffer_latency(20).unwrap();
        assert_eq!(engine.buffer_latency_ms(), 20);
        assert_eq!(engine.shared.channels[0].chunk_size(), 1764);

        assert!(matches!(
            engine.set_buffer_latency(1000),
            Err(EngineError::LatencyOutOfRange(1000))
        ));
        assert!(engine.set_buffer_latency(0).is_err());
        assert_eq!(engine.buffer_latency_ms(), 20);
    }

    #[test]
    fn test_tick_loop_exits_on_fatal_error() {
        let (engine, sink) = engine();
        engine.play_channel(0).unwrap();
        sink.set_state(DeviceState::Disconnected);
        engine.start_tick_loop().unwrap();

        for _ in 0..200 {
            if !engine.is_tick_loop_running() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.is_tick_loop_running());
        assert!(engine.metrics().fatal_errors >= 1);
        engine.stop_tick_loop();
    }

    #[test]
    fn test_capture_path() {
        let backend = MockBackend::new();
        let source = backend.source_handle();
        let engine = AudioEngine::new(
            config().with_buffer_latency_ms(50).with_capture(8_000, 16_000, 1),
            backend,
        )
        .unwrap();

        assert!(matches!(
            engine.start_capture(),
            Err(EngineError::CaptureNotInitialized)
        ));

        let received = Arc::new(Mutex::new(Vec::new()));
        let recorder = received.clone();
        engine
            .create_capture_buffer(
                move |pcm: &[u8], rate: u32| recorder.lock().unwrap().push((pcm.len(), rate)),
                None,
            )
            .unwrap();
        engine.start_capture().unwrap();
        assert!(engine.is_capturing());

        source.push_captured(&[0; 1000]);
        let report = engine.tick().unwrap();
        assert_eq!(report.capture, CaptureOutcome::Delivered(1600));
        assert_eq!(report.mix, TickOutcome::Idle);
        assert_eq!(*received.lock().unwrap(), vec![(1600, 16_000)]);

        engine.stop_capture().unwrap();
        assert!(!engine.is_capturing());
        engine.delete_capture_buffer().unwrap();
        assert!(matches!(
            engine.delete_capture_buffer(),
            Err(EngineError::CaptureNotInitialized)
        ));
    }

    fn capture_engine() -> (AudioEngine<MockBackend>, MockSourceHandle) {
        let backend = MockBackend::new();
        let source = backend.source_handle();
        let config = config().with_buffer_latency_ms(50).with_capture(8_000, 8_000, 1);
        (AudioEngine::new(config, backend).unwrap(), source)
    }

    #[test]
    fn test_uninit_without_playback_keeps_capture() {
        let (engine, source) = capture_engine();
        engine.create_capture_buffer(|_: &[u8], _: u32| {}, None).unwrap();
        engine.start_capture().unwrap();
        source.clear_calls();

        assert!(matches!(engine.uninit(), Err(EngineError::NotInitialized)));
        assert!(engine.is_capturing());
        assert!(source.calls().is_empty());

        source.push_captured(&[0; 800]);
        assert_eq!(engine.tick().unwrap().capture, CaptureOutcome::Delivered(800));
        engine.delete_capture_buffer().unwrap();
    }

    #[test]
    fn test_recording_callback_may_call_engine() {
        let (engine, source) = capture_engine();
        let engine = Arc::new(engine);
        let weak = Arc::downgrade(&engine);
        let answers = Arc::new(Mutex::new(Vec::new()));
        let recorded = answers.clone();
        engine
            .create_capture_buffer(
                move |_: &[u8], _: u32| {
                    let Some(engine) = weak.upgrade() else {
                        return;
                    };
                    let (tx, rx) = mpsc::channel();
                    thread::spawn(move || {
                        let _ = tx.send(engine.is_capturing());
                    });
                    recorded
                        .lock()
                        .unwrap()
                        .push(rx.recv_timeout(Duration::from_secs(2)).ok());
                },
                None,
            )
            .unwrap();
        engine.start_capture().unwrap();

        source.push_captured(&[0; 800]);
        engine.tick().unwrap();
        assert_eq!(*answers.lock().unwrap(), vec![Some(true)]);
    }

    #[test]
    fn test_record_rate_validated() {
        let (engine, _sink) = engine();
        assert!(engine.set_record_sample_rate(0).is_err());
        engine.set_record_sample_rate(16_000).unwrap();
        assert_eq!(engine.record_sample_rate(), 16_000);
    }

    #[test]
    fn test_enumerate_devices() {
        let backend = MockBackend::new().with_devices(vec!["one".to_string(), "two".to_string()]);
        let engine = AudioEngine::new(config(), backend).unwrap();
        let mut names = Vec::new();
        let count = engine
            .enumerate_devices(|name| names.push(name.to_string()))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(names, vec!["one", "two"]);
    }
}
