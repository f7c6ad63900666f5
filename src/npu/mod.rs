//! Host instruction stream.
//!
//! The host drives the shim DMAs with a short program of 32-bit words:
//!
//! | Opcode | Instruction   | Words | Effect                                   |
//! |--------|---------------|-------|------------------------------------------|
//! | 0x06   | `WriteBdShim` | 10    | store a buffer descriptor in a shim table |
//! | 0x02   | `Write32`     | 3     | push a descriptor onto a channel queue    |
//! | 0x03   | `Sync`        | 2     | wait until a channel's queue drains       |
//!
//! Word layouts (little-endian on the wire, no stream header):
//!
//! ```text
//! WriteBdShim  w0 = op<<24 | column<<16 | column_num<<8 | ddr_id
//!              w1 = bd_id   w2 = buffer_length   w3 = buffer_offset
//!              w4 = 0       w5 = inner_count<<20 | inner_stride
//!              w6 = outer_count<<20 | outer_stride
//!              w7 = 0       w8 = 0 (next bd)     w9 = 0 (lock word)
//! Write32      w0 = op<<24 | column<<16 | row<<8
//!              w1 = queue register   w2 = bd_id
//! Sync         w0 = op<<24 | column<<16 | row<<8 | direction
//!              w1 = channel<<24 | column_num<<16 | row_num<<8
//! ```
//!
//! Queue registers: S2MM channel `n` at `0x1D204 + 8n`, MM2S channel `n`
//! at `0x1D214 + 8n`. Direction bit: 0 = S2MM, 1 = MM2S.

pub mod encoder;
pub mod parser;

pub use parser::{parse_bytes, parse_words};

use std::collections::BTreeMap;

use crate::device::aie2_spec;
use crate::device::dma::{BufferDescriptor, ChannelDirection, ChannelId};
use crate::device::{ShimBd, TileCoord};
use crate::error::ConfigError;
use crate::topology::PipelineTopology;

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NpuOpcode {
    Write32 = 0x02,
    Sync = 0x03,
    WriteBdShim = 0x06,
}

impl NpuOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(NpuOpcode::Write32),
            0x03 => Some(NpuOpcode::Sync),
            0x06 => Some(NpuOpcode::WriteBdShim),
            _ => None,
        }
    }

    /// Encoded size in words.
    pub fn words(self) -> usize {
        match self {
            NpuOpcode::Write32 => 3,
            NpuOpcode::Sync => 2,
            NpuOpcode::WriteBdShim => 10,
        }
    }
}

/// Bits available for the count fields of a shim descriptor.
pub const BD_COUNT_BITS: u32 = 12;
/// Bits available for the stride fields of a shim descriptor.
pub const BD_STRIDE_BITS: u32 = 20;

/// A decoded host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpuInstruction {
    /// Store a buffer descriptor in a shim column's table.
    WriteBdShim {
        column: u8,
        column_num: u8,
        ddr_id: u8,
        bd_id: u32,
        buffer_length: u32,
        buffer_offset: u32,
        inner_count: u32,
        inner_stride: u32,
        outer_count: u32,
        outer_stride: u32,
    },

    /// Push a stored descriptor onto a shim channel's queue.
    QueuePush { column: u8, row: u8, direction: ChannelDirection, channel: u8, bd_id: u32 },

    /// Wait until a shim channel has completed everything queued on it.
    Sync { column: u8, row: u8, direction: ChannelDirection, channel: u8, column_num: u8, row_num: u8 },
}

impl NpuInstruction {
    /// `WriteBdShim` for a descriptor over host buffer `ddr_id`.
    pub fn write_bd(column: u8, ddr_id: u8, bd_id: u32, descriptor: &BufferDescriptor) -> Result<Self, ConfigError> {
        Ok(NpuInstruction::WriteBdShim {
            column,
            column_num: 1,
            ddr_id,
            bd_id,
            buffer_length: to_u32("buffer_length", descriptor.element_count())?,
            buffer_offset: to_u32("buffer_offset", descriptor.base_offset)?,
            inner_count: to_u32("inner_count", descriptor.inner_count)?,
            inner_stride: to_u32("inner_stride", descriptor.inner_stride)?,
            outer_count: to_u32("outer_count", descriptor.outer_count)?,
            outer_stride: to_u32("outer_stride", descriptor.outer_stride)?,
        })
    }

    /// `Write32` to the queue register of a shim channel.
    pub fn queue_push(channel: ChannelId, bd_id: u32) -> Self {
        NpuInstruction::QueuePush {
            column: channel.tile.col,
            row: channel.tile.row,
            direction: channel.direction,
            channel: channel.index,
            bd_id,
        }
    }

    /// `Sync` on a shim channel.
    pub fn sync(channel: ChannelId) -> Self {
        NpuInstruction::Sync {
            column: channel.tile.col,
            row: channel.tile.row,
            direction: channel.direction,
            channel: channel.index,
            column_num: 1,
            row_num: 1,
        }
    }

    pub fn opcode(&self) -> NpuOpcode {
        match self {
            NpuInstruction::WriteBdShim { .. } => NpuOpcode::WriteBdShim,
            NpuInstruction::QueuePush { .. } => NpuOpcode::Write32,
            NpuInstruction::Sync { .. } => NpuOpcode::Sync,
        }
    }

    /// Channel a queue push or sync targets.
    pub fn channel(&self) -> Option<ChannelId> {
        match *self {
            NpuInstruction::QueuePush { column, row, direction, channel, .. }
            | NpuInstruction::Sync { column, row, direction, channel, .. } => {
                Some(ChannelId::new(TileCoord::new(column, row), direction, channel))
            }
            NpuInstruction::WriteBdShim { .. } => None,
        }
    }

    /// Descriptor stored by a `WriteBdShim`.
    pub fn shim_bd(&self) -> Option<ShimBd> {
        match *self {
            NpuInstruction::WriteBdShim {
                ddr_id,
                buffer_offset,
                inner_count,
                inner_stride,
                outer_count,
                outer_stride,
                ..
            } => Some(ShimBd {
                ddr_id: ddr_id as usize,
                descriptor: BufferDescriptor::new(
                    buffer_offset as usize,
                    outer_count as usize,
                    outer_stride as usize,
                    inner_count as usize,
                    inner_stride as usize,
                ),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for NpuInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NpuInstruction::WriteBdShim {
                column,
                ddr_id,
                bd_id,
                buffer_length,
                buffer_offset,
                inner_count,
                inner_stride,
                outer_count,
                outer_stride,
                ..
            } => write!(
                f,
                "WriteBdShim col={} bd={} ddr={} len={} off={} outer={}/{} inner={}/{}",
                column, bd_id, ddr_id, buffer_length, buffer_offset, outer_count, outer_stride, inner_count,
                inner_stride
            ),
            NpuInstruction::QueuePush { bd_id, .. } => {
                let ch = self.channel().map(|c| c.to_string()).unwrap_or_default();
                write!(f, "Write32 queue {} <- bd {}", ch, bd_id)
            }
            NpuInstruction::Sync { .. } => {
                let ch = self.channel().map(|c| c.to_string()).unwrap_or_default();
                write!(f, "Sync {}", ch)
            }
        }
    }
}

/// Queue register offset of a shim channel.
pub fn queue_register(direction: ChannelDirection, channel: u8) -> u32 {
    let base = match direction {
        ChannelDirection::S2MM => aie2_spec::SHIM_DMA_S2MM_QUEUE_CH0,
        ChannelDirection::MM2S => aie2_spec::SHIM_DMA_MM2S_QUEUE_CH0,
    };
    base + channel as u32 * aie2_spec::SHIM_DMA_QUEUE_STRIDE
}

/// Inverse of [`queue_register`].
pub fn queue_channel(register: u32) -> Option<(ChannelDirection, u8)> {
    let channels = aie2_spec::SHIM_TILE_DMA_CHANNELS as u32;
    [ChannelDirection::S2MM, ChannelDirection::MM2S].into_iter().find_map(|direction| {
        let base = queue_register(direction, 0);
        let offset = register.checked_sub(base)?;
        let index = offset / aie2_spec::SHIM_DMA_QUEUE_STRIDE;
        (offset % aie2_spec::SHIM_DMA_QUEUE_STRIDE == 0 && index < channels).then_some((direction, index as u8))
    })
}

fn to_u32(field: &'static str, value: usize) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::FieldOverflow { field, value: value as u64, bits: 32 })
}

/// An ordered host instruction program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostProgram {
    instructions: Vec<NpuInstruction>,
}

impl HostProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instructions(instructions: Vec<NpuInstruction>) -> Self {
        Self { instructions }
    }

    pub fn push(&mut self, instruction: NpuInstruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Write a descriptor and immediately queue it on `channel`.
    pub fn enqueue(
        &mut self,
        channel: ChannelId,
        ddr_id: u8,
        bd_id: u32,
        descriptor: &BufferDescriptor,
    ) -> Result<&mut Self, ConfigError> {
        self.push(NpuInstruction::write_bd(channel.tile.col, ddr_id, bd_id, descriptor)?);
        self.push(NpuInstruction::queue_push(channel, bd_id));
        Ok(self)
    }

    pub fn instructions(&self) -> &[NpuInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Check the program against a topology and the extents of the host
    /// buffers it will run with (indexed by ddr id).
    ///
    /// - every queue push and sync targets a host-queued shim channel
    /// - every pushed bd was written earlier on that column
    /// - every descriptor fits its host buffer and its declared length
    /// - every pushed bd moves as many elements as the tile channel at
    ///   the other end of the flow
    pub fn validate(&self, topology: &PipelineTopology, ddr_extents: &[usize]) -> Result<(), ConfigError> {
        // (column, bd id) -> element count of the latest write
        let mut written: BTreeMap<(u8, u32), usize> = BTreeMap::new();

        for instruction in &self.instructions {
            match *instruction {
                NpuInstruction::WriteBdShim { column, ddr_id, bd_id, buffer_length, .. } => {
                    if bd_id as usize >= aie2_spec::SHIM_NUM_BUFFER_DESCRIPTORS {
                        return Err(ConfigError::FieldOverflow { field: "bd_id", value: bd_id as u64, bits: 4 });
                    }
                    let extent = *ddr_extents.get(ddr_id as usize).ok_or(ConfigError::UnknownDdrBuffer {
                        ddr_id: ddr_id as u32,
                        available: ddr_extents.len(),
                    })?;
                    let Some(bd) = instruction.shim_bd() else { continue };
                    bd.descriptor.validate(extent)?;
                    if bd.descriptor.element_count() != buffer_length as usize {
                        return Err(ConfigError::InvalidDescriptor {
                            descriptor: bd.descriptor.to_string(),
                            reason: format!("buffer_length {} does not match the element count", buffer_length),
                        });
                    }
                    written.insert((column, bd_id), bd.descriptor.element_count());
                }
                NpuInstruction::QueuePush { column, bd_id, .. } => {
                    let channel = self.check_channel(topology, instruction)?;
                    let len = *written.get(&(column, bd_id)).ok_or(ConfigError::UnwrittenBd { column, bd_id })?;
                    if let Some(id) = channel {
                        check_peer_length(topology, id, len)?;
                    }
                }
                NpuInstruction::Sync { .. } => {
                    self.check_channel(topology, instruction)?;
                }
            }
        }
        Ok(())
    }

    fn check_channel(
        &self,
        topology: &PipelineTopology,
        instruction: &NpuInstruction,
    ) -> Result<Option<ChannelId>, ConfigError> {
        let Some(id) = instruction.channel() else { return Ok(None) };
        match topology.channel(id) {
            Some(channel) if channel.is_host_queued() => Ok(Some(id)),
            _ => Err(ConfigError::UnknownShimChannel(id)),
        }
    }
}

/// A shim transfer of `len` elements must match every step of the tile
/// channel across its flow.
fn check_peer_length(topology: &PipelineTopology, shim: ChannelId, len: usize) -> Result<(), ConfigError> {
    let Some(peer) = topology.flow_peer(shim) else { return Ok(()) };
    let Some(&peer_len) = peer.step_lengths().iter().find(|&&n| n != len) else { return Ok(()) };
    let (src, dest, src_len, dest_len) = match shim.direction {
        ChannelDirection::MM2S => (shim, peer.id, len, peer_len),
        ChannelDirection::S2MM => (peer.id, shim, peer_len, len),
    };
    Err(ConfigError::FlowSizeMismatch { src, dest, src_len, dest_len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_registers() {
        assert_eq!(queue_register(ChannelDirection::S2MM, 0), 0x1D204);
        assert_eq!(queue_register(ChannelDirection::S2MM, 1), 0x1D20C);
        assert_eq!(queue_register(ChannelDirection::MM2S, 0), 0x1D214);
        assert_eq!(queue_register(ChannelDirection::MM2S, 1), 0x1D21C);

        assert_eq!(queue_channel(0x1D21C), Some((ChannelDirection::MM2S, 1)));
        assert_eq!(queue_channel(0x1D204), Some((ChannelDirection::S2MM, 0)));
        assert_eq!(queue_channel(0x1D208), None);
        assert_eq!(queue_channel(0x1D224), None);
        assert_eq!(queue_channel(0x100), None);
    }

    #[test]
    fn test_write_bd_round_trips_descriptor() {
        let desc = BufferDescriptor::new(136, 8, 16, 8, 1);
        let instr = NpuInstruction::write_bd(0, 2, 11, &desc).unwrap();
        let bd = instr.shim_bd().unwrap();
        assert_eq!(bd.ddr_id, 2);
        assert_eq!(bd.descriptor, desc);
        assert!(instr.channel().is_none());
    }

    #[test]
    fn test_opcode_lookup() {
        assert_eq!(NpuOpcode::from_u8(0x06), Some(NpuOpcode::WriteBdShim));
        assert_eq!(NpuOpcode::from_u8(0x02), Some(NpuOpcode::Write32));
        assert_eq!(NpuOpcode::from_u8(0x03), Some(NpuOpcode::Sync));
        assert_eq!(NpuOpcode::from_u8(0x80), None);
        assert_eq!(NpuOpcode::WriteBdShim.words(), 10);
    }
}
