use std::net::IpAddr;
use std::time::Duration;

use anyhow::bail;
use tracing::debug;

pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;

pub struct TcpTransportConfig {
    /// address of the local network interface to bind the listening socket to
    pub bind_addr: IpAddr,

    /// The first port to try binding to. Port 0 means an OS-assigned ephemeral port.
    pub bind_port: u16,

    /// Number of ports above `bind_port` to try if `bind_port` itself is taken.
    ///  Binding fails for good - and transport startup with it - once the whole
    ///  range is exhausted.
    pub port_range: u16,

    /// Timeout for outbound connection attempts. The send that triggered the attempt
    ///  is dropped on timeout; there are no retries at this level.
    pub connect_timeout: Duration,

    /// When the pending bytes queued for a sender drop below this after having
    ///  exceeded `high_watermark`, reads for that sender are resumed. A value of 0
    ///  reverts to the built-in default.
    pub low_watermark: usize,

    /// When the pending bytes queued for a sender exceed this, reads on that
    ///  sender's connection are paused until the total drops below `low_watermark`.
    ///  A value of 0 reverts to the built-in default.
    pub high_watermark: usize,

    /// Upper bound for a single frame on the wire. Frames announcing a bigger total
    ///  length are treated as a protocol error and the connection is closed.
    pub max_frame_len: usize,

    /// initial capacity of pooled receive / send buffers
    pub buffer_capacity: usize,

    /// number of buffers retained in the pool - buffers in excess of this are
    ///  discarded when they are returned
    pub buffer_pool_size: usize,

    pub tcp_nodelay: bool,
}

impl TcpTransportConfig {
    pub fn new(bind_addr: IpAddr, bind_port: u16) -> TcpTransportConfig {
        TcpTransportConfig {
            bind_addr,
            bind_port,
            port_range: 0,
            connect_timeout: Duration::from_millis(1000),
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            max_frame_len: 16 * 1024 * 1024,
            buffer_capacity: 64 * 1024,
            buffer_pool_size: 1024,
            tcp_nodelay: true,
        }
    }

    /// The watermarks actually used: configured values of 0 revert to the defaults.
    pub fn effective_watermarks(&self) -> (usize, usize) {
        let low = if self.low_watermark == 0 {
            debug!(
                "low_watermark was set to 0, reverting to default of {}",
                DEFAULT_LOW_WATERMARK
            );
            DEFAULT_LOW_WATERMARK
        } else {
            self.low_watermark
        };
        let high = if self.high_watermark == 0 {
            debug!(
                "high_watermark was set to 0, reverting to default of {}",
                DEFAULT_HIGH_WATERMARK
            );
            DEFAULT_HIGH_WATERMARK
        } else {
            self.high_watermark
        };
        (low, high)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let (low, high) = self.effective_watermarks();
        if low >= high {
            bail!(
                "low watermark {} must be less than high watermark {}",
                low,
                high
            );
        }
        if self.max_frame_len < 16 {
            bail!("max frame length {} is too small to hold a frame", self.max_frame_len);
        }
        if self.buffer_capacity == 0 {
            bail!("buffer capacity must be greater than 0");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::Ipv4Addr;

    fn config() -> TcpTransportConfig {
        TcpTransportConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn test_defaults_valid() {
        assert!(config().validate().is_ok());
    }

    #[rstest]
    #[case::both_zero(0, 0, DEFAULT_LOW_WATERMARK, DEFAULT_HIGH_WATERMARK)]
    #[case::low_zero(0, 500_000, DEFAULT_LOW_WATERMARK, 500_000)]
    #[case::high_zero(100, 0, 100, DEFAULT_HIGH_WATERMARK)]
    #[case::explicit(100, 200, 100, 200)]
    fn test_effective_watermarks(
        #[case] low: usize,
        #[case] high: usize,
        #[case] expected_low: usize,
        #[case] expected_high: usize,
    ) {
        let mut config = config();
        config.low_watermark = low;
        config.high_watermark = high;
        assert_eq!(config.effective_watermarks(), (expected_low, expected_high));
    }

    #[rstest]
    #[case::inverted(200, 100)]
    #[case::equal(100, 100)]
    #[case::low_zero_defaults_above_high(0, 100)]
    fn test_validate_rejects_watermarks(#[case] low: usize, #[case] high: usize) {
        let mut config = config();
        config.low_watermark = low;
        config.high_watermark = high;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_frame_limit() {
        let mut config = config();
        config.max_frame_len = 8;
        assert!(config.validate().is_err());
    }
}
