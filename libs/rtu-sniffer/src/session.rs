//! Capture session
//!
//! One task owns the whole pipeline (assembler, decoder, correlator) and
//! reacts to four things: transport events, the assembler's idle
//! deadline, the periodic timeout sweep, and cancellation. Nothing in the
//! pipeline is shared, so nothing is locked.
//!
//! Whatever ends the session, the in-progress frame is flushed and every
//! pending transaction is closed before consumers see `Ended`. `Ended`
//! uses the slot each consumer queue keeps for it, so it is never dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::assembler::{CandidateFrame, FrameAssembler, RawByte};
use crate::config::SessionConfig;
use crate::constants::MIN_SWEEP_INTERVAL;
use crate::correlator::{Correlator, TransactionEvent};
use crate::decoder::{CaptureClock, FrameDecoder};
use crate::error::Result;
use crate::fanout::{EventBus, Subscription};
use crate::timing::TimingConfig;
use crate::transport::{ByteReceiver, TransportEvent};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Stopped by the caller
    Stopped,
    /// Transport fault
    PortFailed(String),
    /// Source reached its end
    SourceClosed,
}

/// Event delivered to consumers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transaction(TransactionEvent),
    /// Last event of the session
    Ended(SessionEnd),
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters updated by the pipeline, readable while it runs
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes: AtomicU64,
    frames: AtomicU64,
    short_frames: AtomicU64,
    crc_errors: AtomicU64,
    transactions_opened: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    orphans: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub frames: u64,
    pub short_frames: u64,
    pub crc_errors: u64,
    pub transactions_opened: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub orphans: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            short_frames: self.short_frames.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            transactions_opened: self.transactions_opened.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
        }
    }

    fn record(&self, events: &[TransactionEvent]) {
        for event in events {
            let counter = match event {
                TransactionEvent::Opened(_) => &self.transactions_opened,
                TransactionEvent::Matched(_) => &self.matched,
                TransactionEvent::Unmatched(_) => &self.unmatched,
                TransactionEvent::Orphaned(_) => &self.orphans,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Pipeline core
// ============================================================================

/// Byte-to-event pipeline without a runtime
///
/// Drives the same stages as a running session and is usable directly
/// to replay a recorded capture.
#[derive(Debug)]
pub struct SessionPipeline {
    timing: TimingConfig,
    assembler: FrameAssembler,
    decoder: FrameDecoder,
    correlator: Correlator,
    stats: Arc<SessionStats>,
}

impl SessionPipeline {
    pub fn new(timing: TimingConfig, clock: CaptureClock) -> Self {
        Self::with_stats(timing, clock, Arc::new(SessionStats::default()))
    }

    fn with_stats(timing: TimingConfig, clock: CaptureClock, stats: Arc<SessionStats>) -> Self {
        Self {
            assembler: FrameAssembler::new(timing.inter_frame_timeout()),
            decoder: FrameDecoder::new(clock),
            correlator: Correlator::new(timing.transaction_timeout()),
            timing,
            stats,
        }
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub fn push_byte(&mut self, byte: RawByte, out: &mut Vec<TransactionEvent>) {
        let closed = self.assembler.push(byte);
        self.sync_assembler_stats();
        if let Some(frame) = closed {
            self.handle_frame(frame, out);
        }
    }

    /// Close the buffered frame if the line went quiet
    pub fn poll_idle(&mut self, now: Instant, out: &mut Vec<TransactionEvent>) {
        if let Some(frame) = self.assembler.poll_idle(now) {
            self.sync_assembler_stats();
            self.handle_frame(frame, out);
        }
    }

    /// Time out transactions whose window lapsed
    ///
    /// A frame still being assembled started before `now`; transactions
    /// it may answer are left for it to resolve.
    pub fn sweep(&mut self, now: Instant, out: &mut Vec<TransactionEvent>) {
        let horizon = match self.assembler.pending_since() {
            Some(started) if started < now => started,
            _ => now,
        };
        let start = out.len();
        self.correlator.sweep(horizon, out);
        self.stats.record(&out[start..]);
    }

    /// Flush the assembler and close every pending transaction at `at`
    pub fn finish(&mut self, at: Instant, out: &mut Vec<TransactionEvent>) {
        if let Some(frame) = self.assembler.flush() {
            self.handle_frame(frame, out);
        }
        self.sync_assembler_stats();
        let start = out.len();
        self.correlator.close_all(at, out);
        self.stats.record(&out[start..]);
    }

    /// Instant at which `poll_idle` will close the buffered frame
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.assembler.deadline()
    }

    /// Wall-clock instant at which a live session polls for idle
    ///
    /// The idle deadline plus the delivery lag allowance, so bytes stamped
    /// before the deadline but handed over late still join their frame.
    pub fn flush_deadline(&self) -> Option<Instant> {
        let lag = self.timing.delivery_lag();
        self.assembler
            .deadline()
            .map(|deadline| deadline.checked_add(lag).unwrap_or(deadline))
    }

    pub fn pending_transactions(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn handle_frame(&mut self, frame: CandidateFrame, out: &mut Vec<TransactionEvent>) {
        let decoded = self.decoder.decode(frame);
        if !decoded.crc_valid {
            self.stats.crc_errors.fetch_add(1, Ordering::Relaxed);
        }

        let start = out.len();
        // Expire other addresses first so events stay in time order
        self.correlator.sweep(decoded.timestamp, out);
        self.correlator.on_frame(decoded, out);
        self.stats.record(&out[start..]);
    }

    fn sync_assembler_stats(&self) {
        let assembler = self.assembler.stats();
        self.stats.bytes.store(assembler.bytes_seen, Ordering::Relaxed);
        self.stats.frames.store(assembler.frames_emitted, Ordering::Relaxed);
        self.stats
            .short_frames
            .store(assembler.short_frames_dropped, Ordering::Relaxed);
    }
}

// ============================================================================
// Running session
// ============================================================================

/// Final outcome of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: StatsSnapshot,
}

/// A capture session being set up
///
/// Subscribe consumers first, then `start` it with a byte source.
pub struct CaptureSession {
    config: SessionConfig,
    timing: TimingConfig,
    bus: EventBus<SessionEvent>,
    cancel: CancellationToken,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let timing = config.timing();
        let bus = EventBus::new(config.subscriber_capacity);
        Ok(Self {
            config,
            timing,
            bus,
            cancel: CancellationToken::new(),
        })
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub fn subscribe(&mut self, name: impl Into<String>) -> Subscription<SessionEvent> {
        self.bus.subscribe(name)
    }

    /// Token that stops the session when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn sweep_interval(&self) -> Duration {
        self.config
            .sweep_interval
            .unwrap_or(self.timing.inter_frame_timeout())
            .max(MIN_SWEEP_INTERVAL)
    }

    /// Spawn the pipeline task; must be called within a tokio runtime
    pub fn start(self, source: ByteReceiver) -> SessionHandle {
        self.spawn(source, None)
    }

    /// Open a serial port and capture from it
    #[cfg(feature = "serial")]
    pub fn start_serial(self, port: &str) -> Result<SessionHandle> {
        let transport = crate::transport::SerialTransport::open(port, &self.config.link)?;
        let (sender, receiver) = crate::transport::byte_channel(self.config.channel_capacity);
        let reader = transport.spawn_reader(sender);
        Ok(self.spawn(receiver, Some(reader)))
    }

    fn spawn(self, source: ByteReceiver, reader: Option<JoinHandle<()>>) -> SessionHandle {
        let stats = Arc::new(SessionStats::default());
        let pipeline =
            SessionPipeline::with_stats(self.timing.clone(), CaptureClock::start(), Arc::clone(&stats));
        let sweep_every = self.sweep_interval();

        info!(
            "Capture started: {}baud parity={} stop_bits={} silence={:?} window={:?} consumers={}",
            self.timing.baud_rate(),
            self.timing.parity(),
            self.timing.stop_bits(),
            self.timing.inter_frame_timeout(),
            self.timing.transaction_timeout(),
            self.bus.subscriber_count()
        );

        let cancel = self.cancel.clone();
        let task = tokio::spawn(run_pipeline(
            pipeline,
            source,
            self.bus,
            self.cancel,
            sweep_every,
        ));

        SessionHandle {
            cancel,
            task,
            reader,
            stats,
        }
    }
}

/// Control handle of a running session
#[derive(Debug)]
pub struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<SessionReport>,
    reader: Option<JoinHandle<()>>,
    stats: Arc<SessionStats>,
}

impl SessionHandle {
    /// Request a normal stop; use `join` to wait for the flush
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the session on Ctrl+C or SIGTERM
    pub fn stop_on_shutdown(&self) -> JoinHandle<()> {
        common::shutdown::cancel_on_shutdown(self.cancel.clone())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pipeline to end
    pub async fn join(self) -> Result<SessionReport> {
        let report = self.task.await;
        if let Some(reader) = self.reader {
            reader.abort();
        }
        Ok(report?)
    }
}

async fn run_pipeline(
    mut pipeline: SessionPipeline,
    mut source: ByteReceiver,
    mut bus: EventBus<SessionEvent>,
    cancel: CancellationToken,
    sweep_every: Duration,
) -> SessionReport {
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events = Vec::new();

    let end = loop {
        let deadline = pipeline.flush_deadline();
        let idle_at = deadline.unwrap_or_else(|| Instant::now() + sweep_every);

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                // Bytes already handed over still belong to this session
                while let Some(TransportEvent::Byte(byte)) = source.try_recv() {
                    pipeline.push_byte(byte, &mut events);
                }
                break SessionEnd::Stopped;
            }
            event = source.recv() => match event {
                Some(TransportEvent::Byte(byte)) => pipeline.push_byte(byte, &mut events),
                Some(TransportEvent::Closed) | None => break SessionEnd::SourceClosed,
                Some(TransportEvent::Failed(reason)) => {
                    error!("Capture source failed: {}", reason);
                    break SessionEnd::PortFailed(reason);
                },
            },
            () = tokio::time::sleep_until(idle_at), if deadline.is_some() => {
                pipeline.poll_idle(Instant::now(), &mut events);
            }
            _ = sweep.tick() => {
                pipeline.sweep(Instant::now(), &mut events);
            }
        }

        publish(&mut bus, &mut events);
    };

    pipeline.finish(Instant::now(), &mut events);
    publish(&mut bus, &mut events);
    bus.finish(&SessionEvent::Ended(end.clone()));

    let stats = pipeline.stats();
    info!(
        "Capture ended: {:?} bytes={} frames={} crc_errors={} matched={} unmatched={}",
        end, stats.bytes, stats.frames, stats.crc_errors, stats.matched, stats.unmatched
    );
    SessionReport { end, stats }
}

fn publish(bus: &mut EventBus<SessionEvent>, events: &mut Vec<TransactionEvent>) {
    for event in events.drain(..) {
        let delivered = bus.publish(&SessionEvent::Transaction(event));
        if delivered == 0 {
            debug!("Transaction event had no consumer");
        }
    }
}
