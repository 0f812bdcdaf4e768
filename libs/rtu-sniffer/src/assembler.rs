//! Silence-delimited frame assembly
//!
//! Bytes accumulate until a gap of at least the inter-frame timeout, then
//! the buffer is handed on as a [`CandidateFrame`]. Nothing about frame
//! length is assumed. Buffers too short to carry address, function code
//! and CRC are dropped here, which is how the stream resynchronizes after
//! noise or a capture that started mid-frame.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::constants::{MAX_ADU_SIZE, MIN_FRAME_LEN};

/// One octet as it came off the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawByte {
    pub value: u8,
    /// Monotonic arrival time
    pub at: Instant,
}

impl RawByte {
    pub fn new(value: u8, at: Instant) -> Self {
        Self { value, at }
    }
}

/// Bytes believed to form one Modbus unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFrame {
    pub bytes: Vec<u8>,
    /// Arrival of the first byte
    pub started_at: Instant,
    /// Arrival of the last byte
    pub last_byte_at: Instant,
    /// Moment the closing silence was complete
    pub closed_at: Instant,
}

impl CandidateFrame {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Accumulating,
}

/// Assembler diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub bytes_seen: u64,
    pub frames_emitted: u64,
    pub short_frames_dropped: u64,
    /// Emitted frames longer than an RTU ADU can be
    pub overlong_frames: u64,
}

/// Frame assembler driven by byte arrival times
#[derive(Debug)]
pub struct FrameAssembler {
    timeout: Duration,
    buffer: Vec<u8>,
    started_at: Option<Instant>,
    last_byte_at: Option<Instant>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(inter_frame_timeout: Duration) -> Self {
        Self {
            timeout: inter_frame_timeout,
            buffer: Vec::with_capacity(MAX_ADU_SIZE),
            started_at: None,
            last_byte_at: None,
            stats: AssemblerStats::default(),
        }
    }

    /// Feed one byte
    ///
    /// Returns the previous frame when this byte arrived after a silence
    /// of at least the inter-frame timeout. Timestamps that go backwards
    /// count as no gap.
    pub fn push(&mut self, byte: RawByte) -> Option<CandidateFrame> {
        self.stats.bytes_seen += 1;

        let closed = match self.last_byte_at {
            Some(last) if byte.at.saturating_duration_since(last) >= self.timeout => {
                self.take_frame()
            },
            _ => None,
        };

        if self.buffer.is_empty() {
            self.started_at = Some(byte.at);
        }
        self.buffer.push(byte.value);
        self.last_byte_at = Some(byte.at);

        closed
    }

    /// Emit whatever is buffered and return to idle
    pub fn flush(&mut self) -> Option<CandidateFrame> {
        self.take_frame()
    }

    /// Flush if the line has been quiet for the inter-frame timeout
    pub fn poll_idle(&mut self, now: Instant) -> Option<CandidateFrame> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take_frame(),
            _ => None,
        }
    }

    /// Instant at which the buffered frame is complete, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.last_byte_at.map(|last| last + self.timeout)
    }

    /// Arrival of the first byte of the frame in progress
    pub fn pending_since(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn state(&self) -> AssemblerState {
        if self.buffer.is_empty() {
            AssemblerState::Idle
        } else {
            AssemblerState::Accumulating
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    fn take_frame(&mut self) -> Option<CandidateFrame> {
        let started_at = self.started_at.take();
        let last_byte_at = self.last_byte_at.take();
        let bytes = std::mem::replace(&mut self.buffer, Vec::with_capacity(MAX_ADU_SIZE));

        let (Some(started_at), Some(last_byte_at)) = (started_at, last_byte_at) else {
            return None;
        };

        if bytes.len() < MIN_FRAME_LEN {
            self.stats.short_frames_dropped += 1;
            trace!("Short frame dropped: {}B {:02X?}", bytes.len(), bytes);
            return None;
        }

        if bytes.len() > MAX_ADU_SIZE {
            self.stats.overlong_frames += 1;
            debug!("Overlong frame: {}B (max {})", bytes.len(), MAX_ADU_SIZE);
        }

        self.stats.frames_emitted += 1;
        Some(CandidateFrame {
            bytes,
            started_at,
            last_byte_at,
            closed_at: last_byte_at + self.timeout,
        })
    }
}
