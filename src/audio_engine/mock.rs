//! Scripted in-memory backend.
//!
//! [`MockSink`] and [`MockSource`] follow the device state machine without
//! touching hardware. Each shares its state with a handle, so a test (or a
//! headless caller) can script answers and inspect the calls the engine made.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::audio_engine::device::{
    AudioBackend, DeviceState, ReadOutcome, ResumeOutcome, Sink, Source, WriteOutcome,
};
use crate::audio_engine::errors::DeviceError;

/// Calls observed by a [`MockSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Open(Option<String>),
    Negotiate(u32),
    Prepare,
    Start,
    Write { bytes: usize, silent: bool },
    Resume,
    DropPending,
    Close,
}

/// Calls observed by a [`MockSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Open(Option<String>),
    Negotiate(u32),
    Prepare,
    Start,
    Read,
    Resume,
    Stop,
    Close,
}

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SinkShared {
    state: DeviceState,
    calls: Vec<SinkCall>,
    payloads: Vec<Vec<u8>>,
    written_bytes: usize,
    frame_bytes: usize,
    writes: VecDeque<WriteOutcome>,
    resumes: VecDeque<ResumeOutcome>,
    buffer_frames: usize,
    available_frames: Option<usize>,
    negotiated_rate: Option<u32>,
}

/// Control handle of a [`MockSink`].
#[derive(Clone)]
pub struct MockSinkHandle {
    shared: Arc<Mutex<SinkShared>>,
}

impl MockSinkHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SinkShared {
                state: DeviceState::Open,
                calls: Vec::new(),
                payloads: Vec::new(),
                written_bytes: 0,
                frame_bytes: 4,
                writes: VecDeque::new(),
                resumes: VecDeque::new(),
                buffer_frames: 8192,
                available_frames: None,
                negotiated_rate: None,
            })),
        }
    }

    /// Forces the state reported by the sink.
    pub fn set_state(&self, state: DeviceState) {
        lock(&self.shared).state = state;
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.shared).state
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn clear_calls(&self) {
        let mut shared = lock(&self.shared);
        shared.calls.clear();
        shared.payloads.clear();
    }

    /// Answers returned by the next write calls, in order. Unscripted writes
    /// accept everything.
    pub fn script_writes(&self, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        lock(&self.shared).writes.extend(outcomes);
    }

    pub fn script_resume(&self, outcomes: impl IntoIterator<Item = ResumeOutcome>) {
        lock(&self.shared).resumes.extend(outcomes);
    }

    /// Payload of every write call, accepted or not.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).payloads.clone()
    }

    /// Bytes the sink accepted in total.
    pub fn written_bytes(&self) -> usize {
        lock(&self.shared).written_bytes
    }

    /// Pins the value returned by `available_frames`; `None` means "empty".
    pub fn set_available_frames(&self, frames: Option<usize>) {
        lock(&self.shared).available_frames = frames;
    }

    pub fn set_buffer_frames(&self, frames: usize) {
        lock(&self.shared).buffer_frames = frames;
    }

    /// Rate reported back from `negotiate` instead of the requested one.
    pub fn set_negotiated_rate(&self, rate: Option<u32>) {
        lock(&self.shared).negotiated_rate = rate;
    }
}

/// In-memory [`Sink`].
pub struct MockSink {
    handle: MockSinkHandle,
}

impl MockSink {
    pub fn new() -> Self {
        Self::with_handle(MockSinkHandle::new())
    }

    pub fn with_handle(handle: MockSinkHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> MockSinkHandle {
        self.handle.clone()
    }

    fn shared(&self) -> MutexGuard<'_, SinkShared> {
        lock(&self.handle.shared)
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for MockSink {
    fn open(&mut self, device_name: Option<&str>) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Open(device_name.map(str::to_string)));
        shared.state = DeviceState::Open;
        Ok(())
    }

    fn negotiate(
        &mut self,
        sample_rate: u32,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<u32, DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Negotiate(sample_rate));
        shared.frame_bytes = channels * bytes_per_sample;
        shared.state = DeviceState::Setup;
        Ok(shared.negotiated_rate.unwrap_or(sample_rate))
    }

    fn state(&self) -> DeviceState {
        self.shared().state
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Prepare);
        shared.state = DeviceState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Start);
        shared.state = DeviceState::Running;
        Ok(())
    }

    fn write_interleaved(&mut self, pcm: &[u8]) -> WriteOutcome {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Write {
            bytes: pcm.len(),
            silent: pcm.iter().all(|b| *b == 0),
        });
        shared.payloads.push(pcm.to_vec());

        let frame_bytes = shared.frame_bytes.max(1);
        let outcome = shared
            .writes
            .pop_front()
            .unwrap_or(WriteOutcome::Written(pcm.len() / frame_bytes));
        if let WriteOutcome::Written(frames) = outcome {
            shared.written_bytes += (frames * frame_bytes).min(pcm.len());
        }
        outcome
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        let shared = self.shared();
        Ok(shared.available_frames.unwrap_or(shared.buffer_frames))
    }

    fn buffer_frames(&self) -> usize {
        self.shared().buffer_frames
    }

    fn resume(&mut self) -> ResumeOutcome {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Resume);
        let outcome = shared.resumes.pop_front().unwrap_or(ResumeOutcome::Resumed);
        if outcome == ResumeOutcome::Resumed {
            shared.state = DeviceState::Running;
        }
        outcome
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::DropPending);
        shared.state = DeviceState::Setup;
        Ok(())
    }

    fn close(&mut self) {
        let mut shared = self.shared();
        shared.calls.push(SinkCall::Close);
        shared.state = DeviceState::Open;
    }
}

struct SourceShared {
    state: DeviceState,
    calls: Vec<SourceCall>,
    frame_bytes: usize,
    pending: VecDeque<u8>,
    reads: VecDeque<ReadOutcome>,
    negotiated_rate: Option<u32>,
}

/// Control handle of a [`MockSource`].
#[derive(Clone)]
pub struct MockSourceHandle {
    shared: Arc<Mutex<SourceShared>>,
}

impl MockSourceHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SourceShared {
                state: DeviceState::Open,
                calls: Vec::new(),
                frame_bytes: 2,
                pending: VecDeque::new(),
                reads: VecDeque::new(),
                negotiated_rate: None,
            })),
        }
    }

    pub fn set_state(&self, state: DeviceState) {
        lock(&self.shared).state = state;
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.shared).state
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    /// Makes `pcm` available as captured data.
    pub fn push_captured(&self, pcm: &[u8]) {
        lock(&self.shared).pending.extend(pcm.iter().copied());
    }

    /// Answers returned by the next read calls before captured data is served.
    pub fn script_reads(&self, outcomes: impl IntoIterator<Item = ReadOutcome>) {
        lock(&self.shared).reads.extend(outcomes);
    }

    pub fn set_negotiated_rate(&self, rate: Option<u32>) {
        lock(&self.shared).negotiated_rate = rate;
    }
}

/// In-memory [`Source`].
pub struct MockSource {
    handle: MockSourceHandle,
}

impl MockSource {
    pub fn new() -> Self {
        Self::with_handle(MockSourceHandle::new())
    }

    pub fn with_handle(handle: MockSourceHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> MockSourceHandle {
        self.handle.clone()
    }

    fn shared(&self) -> MutexGuard<'_, SourceShared> {
        lock(&self.handle.shared)
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for MockSource {
    fn open(&mut self, device_name: Option<&str>) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Open(device_name.map(str::to_string)));
        shared.state = DeviceState::Open;
        Ok(())
    }

    fn negotiate(
        &mut self,
        sample_rate: u32,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<u32, DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Negotiate(sample_rate));
        shared.frame_bytes = channels * bytes_per_sample;
        shared.state = DeviceState::Setup;
        Ok(shared.negotiated_rate.unwrap_or(sample_rate))
    }

    fn state(&self) -> DeviceState {
        self.shared().state
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Prepare);
        shared.state = DeviceState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Start);
        shared.state = DeviceState::Running;
        Ok(())
    }

    fn read_interleaved(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Read);
        if let Some(outcome) = shared.reads.pop_front() {
            return outcome;
        }

        let len = buf.len().min(shared.pending.len());
        for (slot, byte) in buf.iter_mut().zip(shared.pending.drain(..len)) {
            *slot = byte;
        }
        ReadOutcome::Data(len)
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        let shared = self.shared();
        Ok(shared.pending.len() / shared.frame_bytes.max(1))
    }

    fn resume(&mut self) -> ResumeOutcome {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Resume);
        shared.state = DeviceState::Running;
        ResumeOutcome::Resumed
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Stop);
        shared.state = DeviceState::Setup;
        Ok(())
    }

    fn close(&mut self) {
        let mut shared = self.shared();
        shared.calls.push(SourceCall::Close);
        shared.state = DeviceState::Open;
    }
}

/// Backend handing out mock devices that share one pair of handles.
pub struct MockBackend {
    sink: MockSinkHandle,
    source: MockSourceHandle,
    devices: Vec<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            sink: MockSinkHandle::new(),
            source: MockSourceHandle::new(),
            devices: vec!["mock output".to_string()],
        }
    }

    #[must_use]
    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = devices;
        self
    }

    pub fn sink_handle(&self) -> MockSinkHandle {
        self.sink.clone()
    }

    pub fn source_handle(&self) -> MockSourceHandle {
        self.source.clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockBackend {
    type Sink = MockSink;
    type Source = MockSource;

    fn create_sink(&self) -> Result<MockSink, DeviceError> {
        Ok(MockSink::with_handle(self.sink.clone()))
    }

    fn create_source(&self) -> Result<MockSource, DeviceError> {
        Ok(MockSource::with_handle(self.source.clone()))
    }

    fn enumerate_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self.devices.clone())
    }
}
