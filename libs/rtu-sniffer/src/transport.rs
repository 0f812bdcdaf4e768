//! Byte source feeding a capture session
//!
//! The transport is the single producer of a bounded channel of
//! timestamped bytes. Sending waits for room instead of dropping, since
//! a lost byte corrupts framing. The stream ends with an explicit
//! [`TransportEvent::Closed`] or [`TransportEvent::Failed`].

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::assembler::RawByte;
use crate::error::{Result, SnifferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Byte(RawByte),
    /// Source ended normally (EOF, replay finished)
    Closed,
    /// Port lost or read error
    Failed(String),
}

/// Create the transport → pipeline channel
pub fn byte_channel(capacity: usize) -> (ByteSender, ByteReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ByteSender { tx }, ByteReceiver { rx })
}

/// Producer half, owned by the transport
#[derive(Debug)]
pub struct ByteSender {
    tx: mpsc::Sender<TransportEvent>,
}

impl ByteSender {
    /// Forward one byte, waiting while the pipeline is behind
    pub async fn send(&self, value: u8, at: Instant) -> Result<()> {
        self.emit(TransportEvent::Byte(RawByte::new(value, at))).await
    }

    /// Forward bytes that share one arrival time
    pub async fn send_slice(&self, bytes: &[u8], at: Instant) -> Result<()> {
        for &value in bytes {
            self.send(value, at).await?;
        }
        Ok(())
    }

    /// Signal a normal end of input
    pub async fn close(self) -> Result<()> {
        self.emit(TransportEvent::Closed).await
    }

    /// Signal a transport fault
    pub async fn fail(self, reason: impl Into<String>) -> Result<()> {
        self.emit(TransportEvent::Failed(reason.into())).await
    }

    /// The pipeline has stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn emit(&self, event: TransportEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SnifferError::channel_closed("capture pipeline stopped"))
    }
}

/// Consumer half, owned by the pipeline
#[derive(Debug)]
pub struct ByteReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

impl ByteReceiver {
    /// Next event; `None` when the sender vanished without a terminal signal
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use std::io::ErrorKind;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;
    use tokio_serial::{SerialPortBuilderExt, SerialStream};
    use tracing::{debug, error, info, warn};

    use super::ByteSender;
    use crate::config::{LinkConfig, Parity};
    use crate::constants::SERIAL_READ_CHUNK;
    use crate::error::{Result, SnifferError};
    use crate::timing::char_time;

    /// Receive-only serial port
    pub struct SerialTransport {
        port_name: String,
        stream: SerialStream,
        char_time: Duration,
    }

    impl SerialTransport {
        /// Open `port` with the link parameters
        pub fn open(port: &str, link: &LinkConfig) -> Result<Self> {
            debug!("RTU: {} @{}baud {} {}", port, link.baud_rate, link.parity, link.stop_bits);

            let parity = match link.parity {
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::None => tokio_serial::Parity::None,
            };
            let stop_bits = match link.stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            match tokio_serial::new(port, link.baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(parity)
                .stop_bits(stop_bits)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
            {
                Ok(stream) => {
                    info!("RTU opened: {}", port);
                    Ok(Self {
                        port_name: port.to_string(),
                        stream,
                        char_time: char_time(link.baud_rate, link.parity, link.stop_bits),
                    })
                },
                Err(e) => {
                    error!("RTU err: {} - {}", port, e);
                    Err(SnifferError::transport(format!(
                        "Failed to open serial port {port}: {e}"
                    )))
                },
            }
        }

        pub fn port_name(&self) -> &str {
            &self.port_name
        }

        /// Read until EOF or error, forwarding every byte
        ///
        /// A read returns whatever the driver buffered, so bytes of one
        /// chunk are back-dated one character time apart from the read
        /// instant.
        pub fn spawn_reader(mut self, sender: ByteSender) -> JoinHandle<()> {
            tokio::spawn(async move {
                let mut buffer = [0u8; SERIAL_READ_CHUNK];
                loop {
                    match self.stream.read(&mut buffer).await {
                        Ok(0) => {
                            info!("RTU closed: {}", self.port_name);
                            let _ = sender.close().await;
                            break;
                        },
                        Ok(n) => {
                            let read_at = Instant::now();
                            let mut forwarded = true;
                            for (i, &value) in buffer[..n].iter().enumerate() {
                                let behind = u32::try_from(n - 1 - i).unwrap_or(u32::MAX);
                                let at = read_at
                                    .checked_sub(self.char_time.saturating_mul(behind))
                                    .unwrap_or(read_at);
                                if sender.send(value, at).await.is_err() {
                                    forwarded = false;
                                    break;
                                }
                            }
                            if !forwarded {
                                debug!("RTU reader stopped: pipeline gone");
                                break;
                            }
                        },
                        Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::TimedOut) => {
                            warn!("RTU RX retry: {}", e);
                        },
                        Err(e) => {
                            error!("RTU RX: {} - {}", self.port_name, e);
                            let _ = sender
                                .fail(format!("Serial read error on {}: {e}", self.port_name))
                                .await;
                            break;
                        },
                    }
                }
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bytes_arrive_in_order_then_terminal() {
        let (sender, mut receiver) = byte_channel(16);
        let t0 = Instant::now();

        sender.send_slice(&[0x01, 0x03], t0).await.unwrap();
        sender.send(0x00, t0 + Duration::from_millis(1)).await.unwrap();
        sender.close().await.unwrap();

        let mut values = Vec::new();
        while let Some(TransportEvent::Byte(byte)) = receiver.recv().await {
            values.push(byte.value);
        }
        assert_eq!(values, vec![0x01, 0x03, 0x00]);
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_fail_carries_reason() {
        let (sender, mut receiver) = byte_channel(4);
        sender.fail("port vanished").await.unwrap();
        assert_eq!(
            receiver.recv().await,
            Some(TransportEvent::Failed("port vanished".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_applies_backpressure() {
        let (sender, mut receiver) = byte_channel(1);
        let t0 = Instant::now();
        sender.send(0x01, t0).await.unwrap();

        // Second byte must wait for the consumer, not be dropped
        let blocked = tokio::time::timeout(Duration::from_millis(10), sender.send(0x02, t0)).await;
        assert!(blocked.is_err());

        let producer = tokio::spawn(async move {
            sender.send(0x02, t0).await.unwrap();
            sender.close().await.unwrap();
        });
        assert!(matches!(receiver.recv().await, Some(TransportEvent::Byte(b)) if b.value == 0x01));
        assert!(matches!(receiver.recv().await, Some(TransportEvent::Byte(b)) if b.value == 0x02));
        assert_eq!(receiver.recv().await, Some(TransportEvent::Closed));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_pipeline_gone_is_error() {
        let (sender, receiver) = byte_channel(4);
        drop(receiver);
        assert!(sender.is_closed());
        let err = sender.send(0x01, Instant::now()).await.unwrap_err();
        assert!(matches!(err, SnifferError::ChannelClosed(_)));
    }
}
