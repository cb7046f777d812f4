use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::packet::Packet;

/// Delivery callback for fully reassembled application-level packets.
///
/// Invoked exactly once per completed message, on the receive loop's task - implementations
///  must hand the packet off (e.g. into a channel) rather than doing blocking work inline,
///  or datagram processing stalls.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketDispatcher: Send + Sync + 'static {
    async fn on_packet(&self, packet: Packet);
}
