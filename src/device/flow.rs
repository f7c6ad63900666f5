//! Point-to-point flows between DMA channels.
//!
//! A flow is a static circuit-switched route from one tile's MM2S channel
//! to another tile's S2MM channel:
//!
//! ```text
//!   Shim MM2S0 ──► MemTile S2MM0      MemTile MM2S0 ──► Compute S2MM0
//!   Shim MM2S1 ──► MemTile S2MM1      MemTile MM2S1 ──► Compute S2MM1
//!   Shim S2MM0 ◄── MemTile MM2S2      MemTile S2MM2 ◄── Compute MM2S0
//! ```
//!
//! Delivery is in order and lossless. Independent flows are never merged
//! or reordered relative to themselves, but nothing orders one flow
//! against another.

use std::collections::VecDeque;

use super::dma::ChannelId;

/// Whole tiles a flow can hold before the sender sees back-pressure.
pub const FLOW_DEPTH_TILES: usize = 1;

/// A configured route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRoute {
    /// Sending (MM2S) channel.
    pub source: ChannelId,
    /// Receiving (S2MM) channel.
    pub dest: ChannelId,
}

impl FlowRoute {
    pub fn new(source: ChannelId, dest: ChannelId) -> Self {
        Self { source, dest }
    }
}

impl std::fmt::Display for FlowRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.dest)
    }
}

/// One tile's worth of data in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePacket {
    pub data: Vec<i32>,
}

/// FIFO of tiles travelling along one flow.
#[derive(Debug, Clone)]
pub struct FlowQueue {
    data: VecDeque<TilePacket>,
    capacity: usize,
    /// Tiles delivered so far.
    pub delivered: u64,
}

impl FlowQueue {
    pub fn new(capacity: usize) -> Self {
        Self { data: VecDeque::with_capacity(capacity), capacity, delivered: 0 }
    }

    /// Enqueue a tile. Returns the packet back on back-pressure.
    pub fn push(&mut self, packet: TilePacket) -> Result<(), TilePacket> {
        if self.is_full() {
            return Err(packet);
        }
        self.data.push_back(packet);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<TilePacket> {
        let packet = self.data.pop_front();
        if packet.is_some() {
            self.delivered += 1;
        }
        packet
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl Default for FlowQueue {
    fn default() -> Self {
        Self::new(FLOW_DEPTH_TILES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TileCoord;

    #[test]
    fn test_queue_backpressure_and_order() {
        let mut q = FlowQueue::new(2);
        assert!(q.push(TilePacket { data: vec![1] }).is_ok());
        assert!(q.push(TilePacket { data: vec![2] }).is_ok());
        let rejected = q.push(TilePacket { data: vec![3] }).unwrap_err();
        assert_eq!(rejected.data, vec![3]);

        assert_eq!(q.pop().unwrap().data, vec![1]);
        assert_eq!(q.pop().unwrap().data, vec![2]);
        assert!(q.pop().is_none());
        assert_eq!(q.delivered, 2);
    }

    #[test]
    fn test_route_display() {
        let route = FlowRoute::new(ChannelId::mm2s(TileCoord::new(0, 1), 0), ChannelId::s2mm(TileCoord::new(0, 2), 1));
        assert_eq!(route.to_string(), "(0,1)MM2S0 -> (0,2)S2MM1");
    }

    #[test]
    fn test_default_depth_is_one_tile() {
        let mut q = FlowQueue::default();
        q.push(TilePacket { data: vec![0; 64] }).unwrap();
        assert!(q.is_full());
    }
}
