//! Request/response correlation
//!
//! RTU carries no transaction id, so pairing is inferred per slave
//! address from flow: at most one transaction is open per address, the
//! next frame with the same function code (or its exception form) and a
//! plausible response layout answers it, and anything else supersedes it.
//!
//! A transaction expires once the gap between the end of its request and
//! the start of the next frame (or the sweep instant) reaches the window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::constants::EXCEPTION_FLAG;
use crate::decoder::{DecodedFrame, FramePayload, FrameRole, FunctionCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Matched,
    /// Open, waiting for a response
    PendingTimeout,
    Unmatched,
}

/// Why a transaction was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Response,
    Broadcast,
    Timeout,
    Superseded,
    SessionStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Session-wide sequence number, starting at 1
    pub id: u64,
    pub request: DecodedFrame,
    pub response: Option<DecodedFrame>,
    pub status: TransactionStatus,
    pub close_reason: Option<CloseReason>,
    pub opened_at: Instant,
    pub closed_at: Option<Instant>,
}

impl Transaction {
    pub fn slave_address(&self) -> u8 {
        self.request.slave_address
    }

    pub fn is_closed(&self) -> bool {
        self.status != TransactionStatus::PendingTimeout
    }

    /// Silence between end of request and start of response
    pub fn latency(&self) -> Option<Duration> {
        self.response
            .as_ref()
            .map(|response| response.timestamp.saturating_duration_since(self.request.ended_at))
    }

    fn close(&mut self, status: TransactionStatus, reason: CloseReason, at: Instant) {
        self.status = status;
        self.close_reason = Some(reason);
        self.closed_at = Some(at);
    }
}

/// Transaction lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    /// Request seen; snapshot of the open transaction
    Opened(Arc<Transaction>),
    /// Closed with a response, or a broadcast
    Matched(Arc<Transaction>),
    /// Closed without a response
    Unmatched(Arc<Transaction>),
    /// Response with no open request (capture started mid-transaction)
    Orphaned(Arc<DecodedFrame>),
}

impl TransactionEvent {
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            TransactionEvent::Opened(tx)
            | TransactionEvent::Matched(tx)
            | TransactionEvent::Unmatched(tx) => Some(tx),
            TransactionEvent::Orphaned(_) => None,
        }
    }

    pub fn slave_address(&self) -> u8 {
        match self {
            TransactionEvent::Opened(tx)
            | TransactionEvent::Matched(tx)
            | TransactionEvent::Unmatched(tx) => tx.slave_address(),
            TransactionEvent::Orphaned(frame) => frame.slave_address,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub opened: u64,
    pub matched: u64,
    pub broadcasts: u64,
    pub unmatched: u64,
    pub timed_out: u64,
    pub superseded: u64,
    pub orphaned: u64,
}

/// Pending-transaction table of one capture session
#[derive(Debug)]
pub struct Correlator {
    window: Duration,
    pending: BTreeMap<u8, Transaction>,
    next_id: u64,
    stats: CorrelatorStats,
}

impl Correlator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
            next_id: 1,
            stats: CorrelatorStats::default(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, slave_address: u8) -> Option<&Transaction> {
        self.pending.get(&slave_address)
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    fn expired(&self, tx: &Transaction, at: Instant) -> bool {
        at.saturating_duration_since(tx.request.ended_at) >= self.window
    }

    /// Classify one decoded frame, appending resulting events to `out`
    pub fn on_frame(&mut self, mut frame: DecodedFrame, out: &mut Vec<TransactionEvent>) {
        let address = frame.slave_address;

        if let Some(tx) = self.pending.get(&address) {
            if self.expired(tx, frame.timestamp) {
                self.close_pending(address, CloseReason::Timeout, frame.timestamp, out);
            }
        }

        match self.pending.remove(&address) {
            Some(mut tx) if answers(&tx.request, &frame) => {
                frame.role = FrameRole::Response;
                let at = frame.ended_at;
                tx.response = Some(frame);
                tx.close(TransactionStatus::Matched, CloseReason::Response, at);
                self.stats.matched += 1;
                debug!(
                    "TX #{} matched: addr={} FC={:02X} latency={:?}",
                    tx.id,
                    address,
                    tx.request.function_code,
                    tx.latency()
                );
                out.push(TransactionEvent::Matched(Arc::new(tx)));
                return;
            },
            Some(tx) => self.close_unmatched(tx, CloseReason::Superseded, frame.timestamp, out),
            None => {},
        }

        if frame.is_exception() || frame.shapes.is_response_only() {
            frame.role = FrameRole::Response;
            self.stats.orphaned += 1;
            debug!(
                "Orphan response: addr={} FC={:02X}",
                address, frame.function_code
            );
            out.push(TransactionEvent::Orphaned(Arc::new(frame)));
            return;
        }

        self.open(frame, out);
    }

    fn open(&mut self, mut frame: DecodedFrame, out: &mut Vec<TransactionEvent>) {
        frame.role = FrameRole::Request;
        let address = frame.slave_address;
        let broadcast = frame.is_broadcast();
        let mut tx = Transaction {
            id: self.next_id,
            opened_at: frame.ended_at,
            request: frame,
            response: None,
            status: TransactionStatus::PendingTimeout,
            close_reason: None,
            closed_at: None,
        };
        self.next_id += 1;
        self.stats.opened += 1;
        debug!(
            "TX #{} opened: addr={} FC={:02X}",
            tx.id, address, tx.request.function_code
        );
        out.push(TransactionEvent::Opened(Arc::new(tx.clone())));

        if broadcast {
            let at = tx.opened_at;
            tx.close(TransactionStatus::Matched, CloseReason::Broadcast, at);
            self.stats.broadcasts += 1;
            out.push(TransactionEvent::Matched(Arc::new(tx)));
        } else {
            self.pending.insert(address, tx);
        }
    }

    fn close_pending(
        &mut self,
        address: u8,
        reason: CloseReason,
        at: Instant,
        out: &mut Vec<TransactionEvent>,
    ) {
        if let Some(tx) = self.pending.remove(&address) {
            self.close_unmatched(tx, reason, at, out);
        }
    }

    fn close_unmatched(
        &mut self,
        mut tx: Transaction,
        reason: CloseReason,
        at: Instant,
        out: &mut Vec<TransactionEvent>,
    ) {
        tx.close(TransactionStatus::Unmatched, reason, at);
        self.stats.unmatched += 1;
        match reason {
            CloseReason::Timeout => self.stats.timed_out += 1,
            CloseReason::Superseded => self.stats.superseded += 1,
            _ => {},
        }
        debug!(
            "TX #{} unmatched ({:?}): addr={} FC={:02X}",
            tx.id,
            reason,
            tx.slave_address(),
            tx.request.function_code
        );
        out.push(TransactionEvent::Unmatched(Arc::new(tx)));
    }

    /// Close every transaction whose window lapsed by `now`
    pub fn sweep(&mut self, now: Instant, out: &mut Vec<TransactionEvent>) {
        let expired: Vec<u8> = self
            .pending
            .iter()
            .filter(|(_, tx)| self.expired(tx, now))
            .map(|(address, _)| *address)
            .collect();
        for address in expired {
            self.close_pending(address, CloseReason::Timeout, now, out);
        }
    }

    /// Close everything still open at `at`, in ascending address order
    pub fn close_all(&mut self, at: Instant, out: &mut Vec<TransactionEvent>) {
        if !self.pending.is_empty() {
            info!("Closing {} pending transaction(s)", self.pending.len());
        }
        let pending = std::mem::take(&mut self.pending);
        for tx in pending.into_values() {
            self.close_unmatched(tx, CloseReason::SessionStopped, at, out);
        }
    }
}

/// Whether `frame` can be the response to `request`
///
/// Function codes must match (plain or exception form). When a layout can
/// be judged it must be a plausible response, sized for the request where
/// the request says how much data to expect.
fn answers(request: &DecodedFrame, frame: &DecodedFrame) -> bool {
    let function = request.function_code;
    if frame.function_code != function && frame.function_code != function | EXCEPTION_FLAG {
        return false;
    }
    if frame.is_exception() || !frame.crc_valid || !FunctionCode::from_u8(function).is_known() {
        return true;
    }

    let Some(response) = &frame.shapes.response else {
        return false;
    };
    match (request.shapes.request.as_ref(), response) {
        (
            Some(FramePayload::ReadRequest { quantity, .. }),
            FramePayload::ReadBitsResponse { byte_count, .. },
        ) => usize::from(*byte_count) == usize::from(*quantity).div_ceil(8),
        (
            Some(FramePayload::ReadRequest { quantity, .. }),
            FramePayload::ReadRegistersResponse { byte_count, .. },
        ) => usize::from(*byte_count) == usize::from(*quantity) * 2,
        (
            Some(FramePayload::ReadWriteRequest { read_quantity, .. }),
            FramePayload::ReadRegistersResponse { byte_count, .. },
        ) => usize::from(*byte_count) == usize::from(*read_quantity) * 2,
        _ => true,
    }
}
