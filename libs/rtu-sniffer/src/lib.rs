//! Passive Modbus RTU Sniffer Engine
//!
//! Turns the byte stream of a shared serial bus into validated, decoded,
//! timestamped Modbus frames and pairs requests with their responses.
//! Nothing is ever transmitted.
//!
//! # Pipeline
//!
//! ```text
//! transport ─▶ assembler ─▶ crc/decoder ─▶ correlator ─▶ fan-out ─▶ consumers
//! ```
//!
//! - **Timing**: inter-frame silence derived from baud, parity and stop bits
//! - **Assembler**: silence-delimited frames, short fragments dropped
//! - **Decoder**: every layout consistent with the function code
//! - **Correlator**: one open transaction per slave address
//! - **Session**: single task, flush on stop, per-consumer queues
//!
//! # Features
//!
//! - `serial` - capture from a serial port via `tokio-serial` (default)

pub mod assembler;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod crc;
pub mod decoder;
pub mod error;
pub mod fanout;
pub mod session;
pub mod timing;
pub mod transport;

// Re-export core types
pub use assembler::{AssemblerState, CandidateFrame, FrameAssembler, RawByte};
pub use config::{LinkConfig, Parity, SessionConfig};
pub use correlator::{CloseReason, Correlator, Transaction, TransactionEvent, TransactionStatus};
pub use decoder::{
    CaptureClock, DecodedFrame, ExceptionCode, FrameDecoder, FramePayload, FrameRole,
    FrameShapes, FunctionCode, WriteValues,
};
pub use error::{Result, SnifferError};
pub use fanout::{EventBus, Subscription};
pub use session::{
    CaptureSession, SessionEnd, SessionEvent, SessionHandle, SessionPipeline, SessionReport,
    SessionStats, StatsSnapshot,
};
pub use timing::TimingConfig;
pub use transport::{byte_channel, ByteReceiver, ByteSender, TransportEvent};

#[cfg(feature = "serial")]
pub use transport::SerialTransport;
