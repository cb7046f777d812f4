use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::packet_header::PacketHeader;

pub struct PeerConfig {
    /// The local address the UDP socket binds to. Supplied by the surrounding application's
    ///  configuration layer.
    pub self_addr: SocketAddr,

    /// The maximum size of one UDP datagram, header included. Frames are never fragmented at
    ///  the IP level on typical Ethernet paths with the 1400-byte default, which leaves
    ///  headroom below the usual 1500-byte link MTU for IP/UDP headers and the occasional
    ///  tunnel. There is no path-MTU discovery; choosing this too big silently drops frames
    ///  on constrained routes, choosing it too small wastes bandwidth on header overhead.
    pub mtu: usize,

    /// The number of send/receive buffers retained by the pool; buffers in excess of this
    ///  are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// The number of data chunks protected by one parity frame. Sender and receiver must
    ///  agree on this value - the receiver derives batch membership from it. Must be at
    ///  least 2: a parity frame over a single chunk would just duplicate it.
    pub fec_group_size: u16,

    /// Upper bound on concurrently tracked reassembly groups (and, independently, FEC
    ///  batches). When the bound is hit, the oldest group is evicted.
    pub max_tracked_groups: usize,

    /// Incomplete groups older than this are evicted. A few frame intervals is plenty: a
    ///  chunk that has not arrived within that window is not coming anymore.
    pub group_max_age: Duration,
}

impl PeerConfig {
    pub fn new(self_addr: SocketAddr) -> PeerConfig {
        PeerConfig {
            self_addr,
            mtu: 1400,
            buffer_pool_size: 1024,
            fec_group_size: 4,
            max_tracked_groups: 256,
            group_max_age: Duration::from_secs(3),
        }
    }

    /// payload bytes available in one frame after the header
    pub fn max_payload(&self) -> usize {
        self.mtu - PacketHeader::SERIALIZED_LEN
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= PacketHeader::SERIALIZED_LEN {
            bail!("MTU of {} leaves no room for payload after the {}-byte header", self.mtu, PacketHeader::SERIALIZED_LEN);
        }
        if self.mtu > u16::MAX as usize {
            bail!("MTU of {} exceeds the maximum UDP datagram size", self.mtu);
        }
        if self.fec_group_size < 2 {
            bail!("FEC group size must be at least 2, was {}", self.fec_group_size);
        }
        if self.max_tracked_groups == 0 {
            bail!("at least one tracked group is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;
    use super::*;

    fn config() -> PeerConfig {
        PeerConfig::new(SocketAddr::from_str("127.0.0.1:0").unwrap())
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_max_payload() {
        assert_eq!(config().max_payload(), 1400 - 29);
    }

    #[rstest]
    #[case::mtu_below_header(|c: &mut PeerConfig| c.mtu = 29)]
    #[case::mtu_too_big(|c: &mut PeerConfig| c.mtu = 100_000)]
    #[case::fec_group_of_one(|c: &mut PeerConfig| c.fec_group_size = 1)]
    #[case::no_tracked_groups(|c: &mut PeerConfig| c.max_tracked_groups = 0)]
    fn test_validate_rejects(#[case] break_it: fn(&mut PeerConfig)) {
        let mut config = config();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
