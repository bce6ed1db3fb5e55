//! Audio engine configuration constants and limits.

use std::time::Duration;

/// Capacity in bytes of every secondary buffer's ring.
pub const SECONDARY_BUFFER_SIZE: usize = 32768;

/// Upper bound in bytes for a single capture chunk handed to the recording callback.
pub const CAPTURE_CHUNK_SIZE: usize = 1400;

/// Highest sample rate accepted for a channel, the device or capture.
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Rate requested from the playback device when nothing else is configured.
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 44_100;

/// Initial source rate of every channel.
pub const DEFAULT_CHANNEL_SAMPLE_RATE: u32 = 44_100;

/// Default latency interval in milliseconds.
pub const DEFAULT_BUFFER_LATENCY_MS: u32 = 50;

/// Exclusive upper bound for the latency interval in milliseconds.
pub const MAX_BUFFER_LATENCY_MS: u32 = 1000;

/// Full attenuation, in hundredths of a decibel.
pub const VOLUME_MIN: i32 = -9600;

/// No attenuation.
pub const VOLUME_MAX: i32 = 0;

/// Hard left.
pub const PAN_MIN: i32 = -1000;

/// Hard right.
pub const PAN_MAX: i32 = 1000;

/// Bytes per 16-bit PCM word.
pub const BYTES_PER_WORD: usize = 2;

pub const MONO: usize = 1;
pub const STEREO: usize = 2;

/// Bytes in one interleaved stereo output frame.
pub const OUTPUT_FRAME_BYTES: usize = STEREO * BYTES_PER_WORD;

/// Sleep between two passes of the tick loop.
pub const TICK_INTERVAL: Duration = Duration::from_micros(500);

/// Attempts made to resume a suspended device before falling back to prepare.
pub const RESUME_RETRY_LIMIT: u32 = 10;

/// Sleep between two resume attempts.
pub const RESUME_RETRY_SLEEP: Duration = Duration::from_millis(50);

/// Consecutive "try again" answers tolerated from the sink within one write.
pub const WRITE_RETRY_LIMIT: u32 = 256;

/// Sample counts used for the throwaway priming conversions.
pub const PRIMING_SHORT_SAMPLES: usize = 256;
pub const PRIMING_LONG_SAMPLES: usize = 512;

/// Full-scale value used when converting between i16 PCM and normalized floats.
pub const PCM_FULL_SCALE: f32 = 32768.0;
