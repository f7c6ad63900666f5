//! DMA channel programs.
//!
//! Each tile has S2MM (stream to memory, inbound) and MM2S (memory to
//! stream, outbound) channels. A channel runs a program of steps:
//!
//! ```text
//!   acquire(lock) -> move one descriptor's worth of data -> release(lock)
//! ```
//!
//! Tile-resident programs loop forever once started, cycling their steps
//! one per invocation (N-buffering is just N steps). Shim channels have
//! no static program: the host queues buffer descriptors on them through
//! the instruction stream.
//!
//! ```text
//! ┌──────────────────────── Tile DMA ────────────────────────┐
//! │  S2MM_0  S2MM_1 ...        <- flows into the tile          │
//! │  MM2S_0  MM2S_1 ...        -> flows out of the tile        │
//! │  step: [acq] descriptor(buffer) [rel]                      │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod addressing;
pub mod descriptor;

pub use addressing::{gather, scatter, AddressGenerator};
pub use descriptor::{make_descriptor, BufferDescriptor, QuadrantGrid};

use super::{BufferId, LockUse, TileCoord};

/// Transfer direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelDirection {
    /// Stream to memory (inbound).
    S2MM,
    /// Memory to stream (outbound).
    MM2S,
}

impl ChannelDirection {
    /// Encoding used by the host instruction stream (0 = S2MM, 1 = MM2S).
    pub fn as_bit(self) -> u32 {
        match self {
            ChannelDirection::S2MM => 0,
            ChannelDirection::MM2S => 1,
        }
    }

    pub fn from_bit(bit: u32) -> Self {
        if bit & 1 == 0 {
            ChannelDirection::S2MM
        } else {
            ChannelDirection::MM2S
        }
    }
}

impl std::fmt::Display for ChannelDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelDirection::S2MM => write!(f, "S2MM"),
            ChannelDirection::MM2S => write!(f, "MM2S"),
        }
    }
}

/// Channel identifier: tile, direction and index within that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    pub tile: TileCoord,
    pub direction: ChannelDirection,
    pub index: u8,
}

impl ChannelId {
    pub const fn new(tile: TileCoord, direction: ChannelDirection, index: u8) -> Self {
        Self { tile, direction, index }
    }

    pub const fn s2mm(tile: TileCoord, index: u8) -> Self {
        Self::new(tile, ChannelDirection::S2MM, index)
    }

    pub const fn mm2s(tile: TileCoord, index: u8) -> Self {
        Self::new(tile, ChannelDirection::MM2S, index)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.tile, self.direction, self.index)
    }
}

/// One resolved step of a tile-resident channel program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaStep {
    /// Lock taken before the transfer.
    pub acquire: Option<LockUse>,
    /// Buffer read (MM2S) or written (S2MM).
    pub buffer: BufferId,
    /// Region of the buffer moved.
    pub descriptor: BufferDescriptor,
    /// Lock given after the transfer.
    pub release: Option<LockUse>,
}

/// What drives a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelProgram {
    /// Steps cycled forever.
    Looping(Vec<DmaStep>),
    /// Descriptors queued by the host (shim tiles only).
    HostQueued,
}

/// A configured DMA channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaChannel {
    pub id: ChannelId,
    pub program: ChannelProgram,
}

impl DmaChannel {
    /// Element counts moved by each step, if the program is static.
    pub fn step_lengths(&self) -> Vec<usize> {
        match &self.program {
            ChannelProgram::Looping(steps) => steps.iter().map(|s| s.descriptor.element_count()).collect(),
            ChannelProgram::HostQueued => Vec::new(),
        }
    }

    #[inline]
    pub fn is_host_queued(&self) -> bool {
        matches!(self.program, ChannelProgram::HostQueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_bits() {
        assert_eq!(ChannelDirection::S2MM.as_bit(), 0);
        assert_eq!(ChannelDirection::MM2S.as_bit(), 1);
        assert_eq!(ChannelDirection::from_bit(1), ChannelDirection::MM2S);
        assert_eq!(ChannelDirection::from_bit(0), ChannelDirection::S2MM);
    }

    #[test]
    fn test_channel_display() {
        let ch = ChannelId::mm2s(TileCoord::new(0, 1), 2);
        assert_eq!(ch.to_string(), "(0,1)MM2S2");
    }
}
