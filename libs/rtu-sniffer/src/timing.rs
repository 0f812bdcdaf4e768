//! Frame boundary timing
//!
//! RTU frames carry no delimiter; a silence of at least
//! `inter_frame_timeout` between two bytes ends a frame. The silence is
//! derived from the link parameters unless an explicit value is given.

use std::time::Duration;

use crate::config::{LinkConfig, Parity, SessionConfig};
use crate::constants::{
    DEFAULT_RESPONSE_TIMEOUT_FACTOR, HIGH_BAUD_INTER_FRAME, HIGH_BAUD_THRESHOLD,
    INTER_FRAME_CHARS, RTU_DATA_BITS,
};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Bits on the wire per character: start + data + parity + stop
pub fn char_bits(parity: Parity, stop_bits: u8) -> u32 {
    1 + u32::from(RTU_DATA_BITS) + u32::from(parity.bits()) + u32::from(stop_bits)
}

/// Duration of one character on the wire
pub fn char_time(baud_rate: u32, parity: Parity, stop_bits: u8) -> Duration {
    let bits = u64::from(char_bits(parity, stop_bits));
    Duration::from_nanos(bits * NANOS_PER_SEC / u64::from(baud_rate.max(1)))
}

/// Default inter-frame silence for a link
///
/// Below 19200 baud: three character times (3.4375 ms at 9600/even/1).
/// From 19200 baud up: the fixed 1.75 ms of the serial line guide.
pub fn default_inter_frame_timeout(baud_rate: u32, parity: Parity, stop_bits: u8) -> Duration {
    if baud_rate >= HIGH_BAUD_THRESHOLD {
        return HIGH_BAUD_INTER_FRAME;
    }
    let bits = u64::from(char_bits(parity, stop_bits));
    Duration::from_nanos(bits * INTER_FRAME_CHARS * NANOS_PER_SEC / u64::from(baud_rate.max(1)))
}

/// Timing parameters of one capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    link: LinkConfig,
    inter_frame_timeout: Duration,
    inter_frame_override: bool,
    transaction_timeout: Duration,
    transaction_override: bool,
    response_timeout_factor: u32,
    delivery_lag: Option<Duration>,
}

impl TimingConfig {
    /// Timing derived purely from link parameters
    pub fn new(link: &LinkConfig) -> Self {
        let inter_frame_timeout =
            default_inter_frame_timeout(link.baud_rate, link.parity, link.stop_bits);
        Self {
            link: link.clone(),
            inter_frame_timeout,
            inter_frame_override: false,
            transaction_timeout: inter_frame_timeout
                .saturating_mul(DEFAULT_RESPONSE_TIMEOUT_FACTOR),
            transaction_override: false,
            response_timeout_factor: DEFAULT_RESPONSE_TIMEOUT_FACTOR,
            delivery_lag: None,
        }
    }

    /// Timing for a session, honouring explicit overrides
    pub fn from_session(config: &SessionConfig) -> Self {
        let mut timing = Self::new(&config.link);
        timing.response_timeout_factor = config.response_timeout_factor.max(1);
        timing.delivery_lag = config.delivery_lag;
        if let Some(timeout) = config.inter_frame_timeout {
            timing.inter_frame_timeout = timeout;
            timing.inter_frame_override = true;
        }
        match config.transaction_timeout {
            Some(window) => {
                timing.transaction_timeout = window;
                timing.transaction_override = true;
            },
            None => timing.recompute_window(),
        }
        timing
    }

    /// Force the inter-frame silence; kept verbatim from now on
    pub fn with_inter_frame_timeout(mut self, timeout: Duration) -> Self {
        self.inter_frame_timeout = timeout;
        self.inter_frame_override = true;
        self.recompute_window();
        self
    }

    /// Force the transaction window
    pub fn with_transaction_timeout(mut self, window: Duration) -> Self {
        self.transaction_timeout = window;
        self.transaction_override = true;
        self
    }

    /// Force the delivery lag allowance
    pub fn with_delivery_lag(mut self, lag: Duration) -> Self {
        self.delivery_lag = Some(lag);
        self
    }

    /// Timing for new link parameters
    ///
    /// Derived values follow the new link; explicit overrides stay as set.
    pub fn with_link(mut self, link: &LinkConfig) -> Self {
        self.link = link.clone();
        if !self.inter_frame_override {
            self.inter_frame_timeout =
                default_inter_frame_timeout(link.baud_rate, link.parity, link.stop_bits);
        }
        self.recompute_window();
        self
    }

    fn recompute_window(&mut self) {
        if !self.transaction_override {
            self.transaction_timeout = self
                .inter_frame_timeout
                .saturating_mul(self.response_timeout_factor);
        }
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn baud_rate(&self) -> u32 {
        self.link.baud_rate
    }

    pub fn parity(&self) -> Parity {
        self.link.parity
    }

    pub fn stop_bits(&self) -> u8 {
        self.link.stop_bits
    }

    /// Silence that closes a frame
    pub fn inter_frame_timeout(&self) -> Duration {
        self.inter_frame_timeout
    }

    /// Window within which a response must start
    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    /// How long the session waits past an idle deadline before flushing
    ///
    /// Transports stamp bytes when they leave the UART but hand them over
    /// later, in chunks. A frame is only flushed on the wall clock once its
    /// last byte is this much older than the silence; bytes delivered
    /// within the allowance still join the frame by their timestamps.
    /// Defaults to one inter-frame silence.
    pub fn delivery_lag(&self) -> Duration {
        self.delivery_lag.unwrap_or(self.inter_frame_timeout)
    }

    pub fn is_inter_frame_overridden(&self) -> bool {
        self.inter_frame_override
    }

    /// Duration of one character at the configured link speed
    pub fn char_time(&self) -> Duration {
        char_time(self.link.baud_rate, self.link.parity, self.link.stop_bits)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::new(&LinkConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn link(baud_rate: u32, parity: Parity, stop_bits: u8) -> LinkConfig {
        LinkConfig {
            baud_rate,
            parity,
            stop_bits,
            data_bits: 8,
        }
    }

    #[test]
    fn test_char_bits() {
        assert_eq!(char_bits(Parity::Even, 1), 11);
        assert_eq!(char_bits(Parity::Odd, 1), 11);
        assert_eq!(char_bits(Parity::None, 1), 10);
        assert_eq!(char_bits(Parity::None, 2), 11);
    }

    #[test]
    fn test_documented_default_9600_even() {
        let timing = TimingConfig::default();
        assert_eq!(timing.inter_frame_timeout(), Duration::from_nanos(3_437_500));
        assert_eq!(timing.char_time(), Duration::from_nanos(1_145_833));
    }

    #[test]
    fn test_parity_none_shortens_silence() {
        let even = default_inter_frame_timeout(9600, Parity::Even, 1);
        let none = default_inter_frame_timeout(9600, Parity::None, 1);
        assert!(none < even);
        assert_eq!(none, Duration::from_nanos(3_125_000));
    }

    #[test]
    fn test_fixed_silence_from_19200() {
        assert_eq!(
            default_inter_frame_timeout(19200, Parity::Even, 1),
            Duration::from_micros(1750)
        );
        assert_eq!(
            default_inter_frame_timeout(115_200, Parity::None, 2),
            Duration::from_micros(1750)
        );
        assert!(default_inter_frame_timeout(14_400, Parity::Even, 1) > Duration::from_micros(1750));
    }

    #[test]
    fn test_default_window_is_factor_of_silence() {
        let timing = TimingConfig::default();
        assert_eq!(
            timing.transaction_timeout(),
            timing.inter_frame_timeout() * DEFAULT_RESPONSE_TIMEOUT_FACTOR
        );
    }

    #[test]
    fn test_override_survives_link_change() {
        let forced = Duration::from_millis(5);
        let timing = TimingConfig::default()
            .with_inter_frame_timeout(forced)
            .with_link(&link(1200, Parity::None, 1));

        assert!(timing.is_inter_frame_overridden());
        assert_eq!(timing.inter_frame_timeout(), forced);
        assert_eq!(timing.baud_rate(), 1200);
        assert_eq!(timing.transaction_timeout(), forced * DEFAULT_RESPONSE_TIMEOUT_FACTOR);
    }

    #[test]
    fn test_derived_value_follows_link_change() {
        let timing = TimingConfig::default().with_link(&link(4800, Parity::Even, 1));
        assert_eq!(timing.inter_frame_timeout(), Duration::from_nanos(6_875_000));
    }

    #[test]
    fn test_from_session_overrides() {
        let config = SessionConfig {
            inter_frame_timeout: Some(Duration::from_millis(2)),
            transaction_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let timing = TimingConfig::from_session(&config);
        assert_eq!(timing.inter_frame_timeout(), Duration::from_millis(2));
        assert_eq!(timing.transaction_timeout(), Duration::from_millis(500));

        let config = SessionConfig {
            response_timeout_factor: 4,
            ..Default::default()
        };
        let timing = TimingConfig::from_session(&config);
        assert_eq!(timing.transaction_timeout(), Duration::from_nanos(3_437_500 * 4));
    }

    #[test]
    fn test_delivery_lag_defaults_to_silence() {
        let timing = TimingConfig::default();
        assert_eq!(timing.delivery_lag(), timing.inter_frame_timeout());

        let timing = timing.with_inter_frame_timeout(Duration::from_millis(2));
        assert_eq!(timing.delivery_lag(), Duration::from_millis(2));

        let config = SessionConfig {
            delivery_lag: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        assert_eq!(config.timing().delivery_lag(), Duration::from_millis(20));
    }

    #[test]
    fn test_huge_values_saturate_window() {
        let config = SessionConfig {
            inter_frame_timeout: Some(Duration::MAX / 2),
            response_timeout_factor: u32::MAX,
            ..Default::default()
        };
        let timing = TimingConfig::from_session(&config);
        assert_eq!(timing.transaction_timeout(), Duration::MAX);
    }
}
