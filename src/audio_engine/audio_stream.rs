//! Audio Stream Module
//!
//! This module bridges CPAL's callback-driven streams to the push-style
//! [`Sink`]/[`Source`] contracts:
//! - Device lookup and enumeration
//! - Stream configuration and negotiation
//! - Lock-free sample rings between the tick thread and the audio callback
//! - Xrun and disconnect detection for the recovery state machine

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, Stream, StreamConfig, StreamError};
use env_logger::{Builder, Env};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::audio_engine::constants::{BYTES_PER_WORD, MONO, STEREO};
use crate::audio_engine::device::{
    AudioBackend, DeviceState, ReadOutcome, ResumeOutcome, Sink, Source, WriteOutcome,
};
use crate::audio_engine::errors::DeviceError;

/// Setup and configure the logger for audio operations
pub fn setup_logger() {
    // Default to `info`; override via `RUST_LOG`, e.g. `RUST_LOG=debug` to see per-tick detail.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .try_init()
        .unwrap_or(()); // Ignore initialization errors
}

fn device_name(device: &Device) -> Option<String> {
    device.description().ok().map(|desc| desc.name().to_string())
}

fn find_device(name: Option<&str>, output: bool) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    let Some(name) = name else {
        let default = if output {
            host.default_output_device()
        } else {
            host.default_input_device()
        };
        return default.ok_or(DeviceError::Unavailable);
    };

    let devices = if output {
        host.output_devices()
    } else {
        host.input_devices()
    }
    .map_err(|e| DeviceError::Backend(e.to_string()))?;

    devices
        .into_iter()
        .find(|device| device_name(device).as_deref() == Some(name))
        .ok_or_else(|| DeviceError::NotFound(name.to_string()))
}

/// Flags shared between a stream callback and its owner.
#[derive(Default)]
struct StreamFlags {
    running: AtomicBool,
    xrun: AtomicBool,
    disconnected: AtomicBool,
}

impl StreamFlags {
    fn error_callback(
        self: &Arc<Self>,
        direction: &'static str,
    ) -> impl FnMut(StreamError) + Send + 'static {
        let flags = self.clone();
        move |err| {
            log::error!("Audio {direction} stream error: {err}");
            if matches!(err, StreamError::DeviceNotAvailable) {
                flags.disconnected.store(true, Ordering::Release);
            }
        }
    }
}

/// Messages from the owner to the output callback.
enum StreamCommand {
    /// Replace the sample ring, dropping everything still queued.
    SwapRing(Consumer<i16>),
}

/// Swaps the callback has not picked up yet. Only reached when a paused
/// stream is written and reset over and over.
const PENDING_COMMANDS: usize = 8;

/// Owner side of the output sample ring.
///
/// A reset hands the callback a fresh ring through the command queue. Resets
/// with nothing written since the previous one are no-ops, so a paused stream
/// that never drains the queue can be reset any number of times.
struct OutputRing {
    producer: Producer<i16>,
    commands: Producer<StreamCommand>,
    capacity: usize,
    dirty: bool,
}

/// Callback side of [`OutputRing`].
struct RingReader {
    consumer: Consumer<i16>,
    commands: Consumer<StreamCommand>,
}

/// Creates a ring of `capacity` samples and its reader.
fn output_ring(capacity: usize) -> (OutputRing, RingReader) {
    let (producer, consumer) = RingBuffer::new(capacity);
    let (commands, command_rx) = RingBuffer::new(PENDING_COMMANDS);
    let ring = OutputRing {
        producer,
        commands,
        capacity,
        dirty: false,
    };
    let reader = RingReader {
        consumer,
        commands: command_rx,
    };
    (ring, reader)
}

impl OutputRing {
    /// Drops everything queued so far.
    fn reset(&mut self) -> Result<(), DeviceError> {
        if !self.dirty {
            return Ok(());
        }
        let (producer, consumer) = RingBuffer::new(self.capacity);
        self.commands
            .push(StreamCommand::SwapRing(consumer))
            .map_err(|_| DeviceError::Stream("command queue full".to_string()))?;
        self.producer = producer;
        self.dirty = false;
        Ok(())
    }

    /// Frames that fit right now.
    fn free_frames(&self) -> usize {
        self.producer.slots() / STEREO
    }

    /// Queues whole stereo frames of `pcm` and returns how many fit.
    fn push_frames(&mut self, pcm: &[u8]) -> usize {
        let frame_bytes = STEREO * BYTES_PER_WORD;
        let frames = (pcm.len() / frame_bytes).min(self.free_frames());
        for bytes in pcm[..frames * frame_bytes].chunks_exact(BYTES_PER_WORD) {
            if self.producer.push(i16::from_le_bytes([bytes[0], bytes[1]])).is_err() {
                break;
            }
        }
        if frames > 0 {
            self.dirty = true;
        }
        frames
    }
}

impl RingReader {
    /// Applies pending swaps. Called at the top of every callback.
    fn sync(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                StreamCommand::SwapRing(next) => self.consumer = next,
            }
        }
    }

    fn pop_frame(&mut self) -> Option<(i16, i16)> {
        if self.consumer.slots() < STEREO {
            return None;
        }
        match (self.consumer.pop(), self.consumer.pop()) {
            (Ok(left), Ok(right)) => Some((left, right)),
            _ => None,
        }
    }
}

/// Playback through a CPAL output stream.
///
/// Mixed frames go into an SPSC ring drained by the callback. A running
/// stream whose ring runs dry flags an xrun and plays silence until it is
/// prepared again.
pub struct CpalSink {
    device: Option<Device>,
    stream: Option<Stream>,
    ring: Option<OutputRing>,
    flags: Arc<StreamFlags>,
    state: DeviceState,
    buffer_frames: usize,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            device: None,
            stream: None,
            ring: None,
            flags: Arc::new(StreamFlags::default()),
            state: DeviceState::Open,
            buffer_frames: 0,
        }
    }

    fn stream(&self) -> Result<&Stream, DeviceError> {
        self.stream
            .as_ref()
            .ok_or_else(|| DeviceError::BadState(format!("{:?}", self.state)))
    }

    fn ring(&mut self) -> Result<&mut OutputRing, DeviceError> {
        let state = self.state;
        self.ring
            .as_mut()
            .ok_or_else(|| DeviceError::BadState(format!("{state:?}")))
    }

    fn halt(&mut self) -> Result<(), DeviceError> {
        self.flags.running.store(false, Ordering::Release);
        if let Err(e) = self.stream()?.pause() {
            log::debug!("Failed to pause output stream: {e}");
        }
        self.ring()?.reset()?;
        self.flags.xrun.store(false, Ordering::Release);
        Ok(())
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for CpalSink {
    fn open(&mut self, device_name: Option<&str>) -> Result<(), DeviceError> {
        let device = find_device(device_name, true)?;
        log::info!(
            "Opened output device {}",
            self::device_name(&device).unwrap_or_else(|| "Unknown".to_string())
        );
        self.device = Some(device);
        self.state = DeviceState::Open;
        Ok(())
    }

    fn negotiate(
        &mut self,
        sample_rate: u32,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<u32, DeviceError> {
        if channels != STEREO || bytes_per_sample != BYTES_PER_WORD {
            return Err(DeviceError::Negotiation(format!(
                "only 16-bit stereo output is supported \
                 (got {channels} ch, {bytes_per_sample} bytes)"
            )));
        }
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| DeviceError::BadState(format!("{:?}", self.state)))?;

        let default = device
            .default_output_config()
            .map_err(|e| DeviceError::Negotiation(e.to_string()))?;
        let supported = device
            .supported_output_configs()
            .ok()
            .and_then(|mut configs| {
                configs.find(|c| {
                    c.channels() as usize >= channels
                        && c.min_sample_rate() <= sample_rate
                        && c.max_sample_rate() >= sample_rate
                })
            })
            .map(|c| c.with_sample_rate(sample_rate))
            .unwrap_or(default);

        let config: StreamConfig = supported.config();
        let actual_rate = config.sample_rate;
        let device_channels = usize::from(config.channels).max(1);

        self.buffer_frames = (actual_rate as usize / 4).max(1);
        let (ring, mut reader) = output_ring(self.buffer_frames * STEREO);

        let flags = self.flags.clone();
        flags.running.store(false, Ordering::Release);
        flags.xrun.store(false, Ordering::Release);
        flags.disconnected.store(false, Ordering::Release);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    reader.sync();

                    let live = flags.running.load(Ordering::Acquire)
                        && !flags.xrun.load(Ordering::Acquire);
                    for frame in data.chunks_mut(device_channels) {
                        let (left, right) = if live {
                            reader.pop_frame().unwrap_or_else(|| {
                                flags.xrun.store(true, Ordering::Release);
                                (0, 0)
                            })
                        } else {
                            (0, 0)
                        };

                        let left = left.to_sample::<f32>();
                        let right = right.to_sample::<f32>();
                        if frame.len() == MONO {
                            frame[0] = (left + right) * 0.5;
                        } else {
                            frame[0] = left;
                            frame[1] = right;
                            for sample in frame.iter_mut().skip(STEREO) {
                                *sample = f32::EQUILIBRIUM;
                            }
                        }
                    }
                },
                self.flags.error_callback("output"),
                None,
            )
            .map_err(|e| DeviceError::Negotiation(e.to_string()))?;

        if let Err(e) = stream.pause() {
            log::debug!("Failed to pause new output stream: {e}");
        }

        log::info!(
            "Negotiated output stream ({} ch@{} Hz, requested {} Hz)",
            device_channels,
            actual_rate,
            sample_rate
        );

        self.stream = Some(stream);
        self.ring = Some(ring);
        self.state = DeviceState::Setup;
        Ok(actual_rate)
    }

    fn state(&self) -> DeviceState {
        if self.flags.disconnected.load(Ordering::Acquire) {
            DeviceState::Disconnected
        } else if self.state == DeviceState::Running && self.flags.xrun.load(Ordering::Acquire) {
            DeviceState::XRun
        } else {
            self.state
        }
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.halt()?;
        self.state = DeviceState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream()?
            .play()
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        self.flags.running.store(true, Ordering::Release);
        self.state = DeviceState::Running;
        Ok(())
    }

    fn write_interleaved(&mut self, pcm: &[u8]) -> WriteOutcome {
        if self.flags.disconnected.load(Ordering::Acquire) {
            return WriteOutcome::Fatal(DeviceError::Disconnected);
        }
        if self.state == DeviceState::Running && self.flags.xrun.load(Ordering::Acquire) {
            return WriteOutcome::Underrun;
        }
        let ring = match self.ring() {
            Ok(ring) => ring,
            Err(e) => return WriteOutcome::Fatal(e),
        };
        match ring.push_frames(pcm) {
            0 => WriteOutcome::TransientFull,
            frames => WriteOutcome::Written(frames),
        }
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        Ok(self.ring()?.free_frames())
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn resume(&mut self) -> ResumeOutcome {
        match self.stream.as_ref().map(|stream| stream.play()) {
            Some(Ok(())) => {
                self.state = DeviceState::Running;
                ResumeOutcome::Resumed
            }
            Some(Err(e)) => {
                log::warn!("Failed to resume output stream: {e}");
                ResumeOutcome::Failed
            }
            None => ResumeOutcome::Failed,
        }
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        self.halt()?;
        self.state = DeviceState::Setup;
        Ok(())
    }

    fn close(&mut self) {
        self.flags.running.store(false, Ordering::Release);
        self.stream = None;
        self.ring = None;
        self.device = None;
        self.state = DeviceState::Open;
    }
}

/// Capture through a CPAL input stream.
pub struct CpalSource {
    device: Option<Device>,
    stream: Option<Stream>,
    consumer: Option<Consumer<i16>>,
    flags: Arc<StreamFlags>,
    state: DeviceState,
    channels: usize,
}

impl CpalSource {
    pub fn new() -> Self {
        Self {
            device: None,
            stream: None,
            consumer: None,
            flags: Arc::new(StreamFlags::default()),
            state: DeviceState::Open,
            channels: MONO,
        }
    }

    fn stream(&self) -> Result<&Stream, DeviceError> {
        self.stream
            .as_ref()
            .ok_or_else(|| DeviceError::BadState(format!("{:?}", self.state)))
    }

    fn discard_queued(&mut self) {
        if let Some(consumer) = self.consumer.as_mut() {
            while consumer.pop().is_ok() {}
        }
    }
}

impl Default for CpalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for CpalSource {
    fn open(&mut self, device_name: Option<&str>) -> Result<(), DeviceError> {
        let device = find_device(device_name, false)?;
        log::info!(
            "Opened input device {}",
            self::device_name(&device).unwrap_or_else(|| "Unknown".to_string())
        );
        self.device = Some(device);
        self.state = DeviceState::Open;
        Ok(())
    }

    fn negotiate(
        &mut self,
        sample_rate: u32,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<u32, DeviceError> {
        if !(MONO..=STEREO).contains(&channels) || bytes_per_sample != BYTES_PER_WORD {
            return Err(DeviceError::Negotiation(format!(
                "only 16-bit mono or stereo capture is supported \
                 (got {channels} ch, {bytes_per_sample} bytes)"
            )));
        }
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| DeviceError::BadState(format!("{:?}", self.state)))?;

        let default = device
            .default_input_config()
            .map_err(|e| DeviceError::Negotiation(e.to_string()))?;
        let supported = device
            .supported_input_configs()
            .ok()
            .and_then(|mut configs| {
                configs.find(|c| {
                    c.min_sample_rate() <= sample_rate && c.max_sample_rate() >= sample_rate
                })
            })
            .map(|c| c.with_sample_rate(sample_rate))
            .unwrap_or(default);

        let config: StreamConfig = supported.config();
        let actual_rate = config.sample_rate;
        let device_channels = usize::from(config.channels).max(1);

        // Half a second of headroom.
        let capacity = (actual_rate as usize / 2).max(1) * channels;
        let (mut producer, consumer) = RingBuffer::<i16>::new(capacity);

        let flags = self.flags.clone();
        flags.running.store(false, Ordering::Release);
        flags.xrun.store(false, Ordering::Release);
        flags.disconnected.store(false, Ordering::Release);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !flags.running.load(Ordering::Acquire) {
                        return;
                    }
                    for frame in data.chunks(device_channels) {
                        let pushed = if channels == MONO {
                            let sum: f32 = frame.iter().sum();
                            producer.push(i16::from_sample(sum / frame.len() as f32))
                        } else {
                            let left = frame[0];
                            let right = frame.get(1).copied().unwrap_or(left);
                            producer
                                .push(i16::from_sample(left))
                                .and_then(|()| producer.push(i16::from_sample(right)))
                        };
                        if pushed.is_err() {
                            flags.xrun.store(true, Ordering::Release);
                            break;
                        }
                    }
                },
                self.flags.error_callback("input"),
                None,
            )
            .map_err(|e| DeviceError::Negotiation(e.to_string()))?;

        if let Err(e) = stream.pause() {
            log::debug!("Failed to pause new input stream: {e}");
        }

        log::info!(
            "Negotiated input stream ({} ch@{} Hz, delivering {} ch)",
            device_channels,
            actual_rate,
            channels
        );

        self.channels = channels;
        self.stream = Some(stream);
        self.consumer = Some(consumer);
        self.state = DeviceState::Setup;
        Ok(actual_rate)
    }

    fn state(&self) -> DeviceState {
        if self.flags.disconnected.load(Ordering::Acquire) {
            DeviceState::Disconnected
        } else if self.state == DeviceState::Running && self.flags.xrun.load(Ordering::Acquire) {
            DeviceState::XRun
        } else {
            self.state
        }
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.flags.running.store(false, Ordering::Release);
        self.discard_queued();
        self.flags.xrun.store(false, Ordering::Release);
        self.state = DeviceState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream()?
            .play()
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        self.flags.running.store(true, Ordering::Release);
        self.state = DeviceState::Running;
        Ok(())
    }

    fn read_interleaved(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.flags.disconnected.load(Ordering::Acquire) {
            return ReadOutcome::Fatal(DeviceError::Disconnected);
        }
        if self.flags.xrun.load(Ordering::Acquire) {
            return ReadOutcome::Underrun;
        }
        let Some(consumer) = self.consumer.as_mut() else {
            return ReadOutcome::Fatal(DeviceError::BadState(format!("{:?}", self.state)));
        };

        let frame_bytes = self.channels * BYTES_PER_WORD;
        let frames = (buf.len() / frame_bytes).min(consumer.slots() / self.channels);
        let mut written = 0;
        for slot in buf[..frames * frame_bytes].chunks_exact_mut(BYTES_PER_WORD) {
            let Ok(sample) = consumer.pop() else { break };
            slot.copy_from_slice(&sample.to_le_bytes());
            written += BYTES_PER_WORD;
        }
        ReadOutcome::Data(written)
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| DeviceError::BadState(format!("{:?}", self.state)))?;
        Ok(consumer.slots() / self.channels)
    }

    fn resume(&mut self) -> ResumeOutcome {
        match self.stream.as_ref().map(|stream| stream.play()) {
            Some(Ok(())) => {
                self.state = DeviceState::Running;
                ResumeOutcome::Resumed
            }
            Some(Err(e)) => {
                log::warn!("Failed to resume input stream: {e}");
                ResumeOutcome::Failed
            }
            None => ResumeOutcome::Failed,
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.flags.running.store(false, Ordering::Release);
        self.stream()?
            .pause()
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        self.discard_queued();
        self.state = DeviceState::Setup;
        Ok(())
    }

    fn close(&mut self) {
        self.flags.running.store(false, Ordering::Release);
        self.stream = None;
        self.consumer = None;
        self.device = None;
        self.state = DeviceState::Open;
    }
}

/// Backend on the platform's default CPAL host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    type Sink = CpalSink;
    type Source = CpalSource;

    fn create_sink(&self) -> Result<CpalSink, DeviceError> {
        Ok(CpalSink::new())
    }

    fn create_source(&self) -> Result<CpalSource, DeviceError> {
        Ok(CpalSource::new())
    }

    fn enumerate_devices(&self) -> Result<Vec<String>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        Ok(devices.filter_map(|device| device_name(&device)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_setup() {
        // Multiple calls should be safe (though only the first takes effect)
        setup_logger();
        setup_logger();
    }

    #[test]
    fn test_unopened_sink_reports_bad_state() {
        let mut sink = CpalSink::new();
        assert_eq!(sink.state(), DeviceState::Open);
        assert!(sink.prepare().is_err());
        assert!(sink.available_frames().is_err());
        assert!(matches!(
            sink.write_interleaved(&[0; 4]),
            WriteOutcome::Fatal(DeviceError::BadState(_))
        ));
    }

    fn frame_bytes(left: i16, right: i16) -> Vec<u8> {
        left.to_le_bytes().into_iter().chain(right.to_le_bytes()).collect()
    }

    #[test]
    fn test_repeated_resets_without_callback() {
        let (mut ring, _reader) = output_ring(64);
        for _ in 0..PENDING_COMMANDS * 4 {
            ring.reset().unwrap();
        }
        assert_eq!(ring.free_frames(), 32);
    }

    #[test]
    fn test_reset_drops_queued_frames() {
        let (mut ring, mut reader) = output_ring(64);
        assert_eq!(ring.push_frames(&frame_bytes(5, 6).repeat(3)), 3);
        ring.reset().unwrap();
        assert_eq!(ring.free_frames(), 32);
        // A second reset with nothing written queues no swap.
        ring.reset().unwrap();

        reader.sync();
        assert_eq!(reader.pop_frame(), None);

        assert_eq!(ring.push_frames(&frame_bytes(1000, -1000)), 1);
        reader.sync();
        assert_eq!(reader.pop_frame(), Some((1000, -1000)));
        assert_eq!(reader.pop_frame(), None);
    }

    #[test]
    fn test_write_reset_cycles_survive_once_drained() {
        let (mut ring, mut reader) = output_ring(64);
        for _ in 0..PENDING_COMMANDS * 4 {
            ring.push_frames(&frame_bytes(1, 2));
            ring.reset().unwrap();
            reader.sync();
        }
        assert_eq!(reader.pop_frame(), None);
    }

    #[test]
    fn test_push_frames_stops_at_capacity() {
        let (mut ring, mut reader) = output_ring(4);
        assert_eq!(ring.push_frames(&frame_bytes(7, 8).repeat(3)), 2);
        assert_eq!(ring.free_frames(), 0);
        assert_eq!(ring.push_frames(&frame_bytes(7, 8)), 0);
        // A trailing partial frame is not queued.
        let (mut odd, _) = output_ring(8);
        assert_eq!(odd.push_frames(&[1, 0, 2]), 0);

        reader.sync();
        assert_eq!(reader.pop_frame(), Some((7, 8)));
        assert_eq!(reader.pop_frame(), Some((7, 8)));
        assert_eq!(reader.pop_frame(), None);
    }

    #[test]
    fn test_sink_rejects_unsupported_format() {
        let mut sink = CpalSink::new();
        assert!(matches!(
            sink.negotiate(44_100, 1, 2),
            Err(DeviceError::Negotiation(_))
        ));
    }

    #[test]
    fn test_output_stream_lifecycle() {
        if cpal::default_host().default_output_device().is_none() {
            return; // Skip test if no audio device available
        }

        let mut sink = CpalBackend.create_sink().unwrap();
        if sink.open(None).is_err() || sink.negotiate(44_100, 2, 2).is_err() {
            return; // Expected in many test environments
        }
        assert_eq!(sink.state(), DeviceState::Setup);
        assert!(sink.buffer_frames() > 0);
        assert_eq!(sink.available_frames().unwrap(), sink.buffer_frames());

        sink.prepare().unwrap();
        assert!(matches!(
            sink.write_interleaved(&[0; 64]),
            WriteOutcome::Written(16)
        ));
        sink.close();
        assert_eq!(sink.state(), DeviceState::Open);
    }
}
