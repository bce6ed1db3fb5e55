//! Byte rings backing the secondary buffers.
//!
//! Neither ring is synchronized on its own; the owning
//! [`Channel`](crate::audio_engine::channel::Channel) holds them behind its lock.

use crate::audio_engine::config::BufferMode;

/// Fixed-capacity circular byte buffer.
///
/// Writes past capacity are truncated and never overwrite unread bytes.
/// Short reads are normal and simply return fewer bytes.
pub struct RingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    filled: usize,
}

impl RingBuffer {
    /// Creates an empty ring holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copies as much of `src` as fits and returns the number of bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.write_available());
        if len == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = len.min(capacity - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        self.data[..len - first].copy_from_slice(&src[first..len]);

        self.write_pos = (self.write_pos + len) % capacity;
        self.filled += len;
        len
    }

    /// Copies up to `dst.len()` unread bytes into `dst` and returns the count.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let len = dst.len().min(self.filled);
        if len == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = len.min(capacity - self.read_pos);
        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        dst[first..len].copy_from_slice(&self.data[..len - first]);

        self.read_pos = (self.read_pos + len) % capacity;
        self.filled -= len;
        len
    }

    pub fn read_available(&self) -> usize {
        self.filled
    }

    pub fn write_available(&self) -> usize {
        self.capacity() - self.filled
    }

    /// Drops all unread data and zeroes the storage.
    pub fn empty(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
        self.filled = 0;
    }
}

/// Ring for pre-filled clips that replay in a loop.
///
/// Writes are linear and capped at the end of the storage. Reads cycle over
/// the bytes written so far, so a clip plays back-to-back without a gap.
pub struct StaticRingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl StaticRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn write(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.write_available());
        self.data[self.write_pos..self.write_pos + len].copy_from_slice(&src[..len]);
        self.write_pos += len;
        len
    }

    /// Fills `dst` by cycling over the written clip. Reads at most one
    /// capacity's worth per call.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let clip = self.write_pos;
        if clip == 0 {
            return 0;
        }

        let len = dst.len().min(self.capacity());
        let mut copied = 0;
        while copied < len {
            let n = (len - copied).min(clip - self.read_pos);
            dst[copied..copied + n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
            copied += n;
            self.read_pos = (self.read_pos + n) % clip;
        }
        len
    }

    /// Length of the stored clip.
    pub fn read_available(&self) -> usize {
        self.write_pos
    }

    pub fn write_available(&self) -> usize {
        self.capacity() - self.write_pos
    }

    pub fn empty(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

/// Storage of one secondary buffer.
pub enum SecondaryRing {
    Stream(RingBuffer),
    Loop(StaticRingBuffer),
}

impl SecondaryRing {
    pub fn new(mode: BufferMode, capacity: usize) -> Self {
        match mode {
            BufferMode::Stream => Self::Stream(RingBuffer::new(capacity)),
            BufferMode::Loop => Self::Loop(StaticRingBuffer::new(capacity)),
        }
    }

    pub fn mode(&self) -> BufferMode {
        match self {
            Self::Stream(_) => BufferMode::Stream,
            Self::Loop(_) => BufferMode::Loop,
        }
    }

    pub fn write(&mut self, src: &[u8]) -> usize {
        match self {
            Self::Stream(ring) => ring.write(src),
            Self::Loop(ring) => ring.write(src),
        }
    }

    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        match self {
            Self::Stream(ring) => ring.read(dst),
            Self::Loop(ring) => ring.read(dst),
        }
    }

    pub fn read_available(&self) -> usize {
        match self {
            Self::Stream(ring) => ring.read_available(),
            Self::Loop(ring) => ring.read_available(),
        }
    }

    pub fn write_available(&self) -> usize {
        match self {
            Self::Stream(ring) => ring.write_available(),
            Self::Loop(ring) => ring.write_available(),
        }
    }

    pub fn empty(&mut self) {
        match self {
            Self::Stream(ring) => ring.empty(),
            Self::Loop(ring) => ring.empty(),
        }
    }
}
