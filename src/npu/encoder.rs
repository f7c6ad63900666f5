//! Instruction stream encoder.
//!
//! Packs [`NpuInstruction`]s into 32-bit words. Every packed field is
//! range-checked; a value that does not fit its slot is a
//! [`ConfigError::FieldOverflow`], never truncated.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{queue_register, HostProgram, NpuInstruction, NpuOpcode, BD_COUNT_BITS, BD_STRIDE_BITS};
use crate::device::aie2_spec;
use crate::error::ConfigError;

fn check(field: &'static str, value: u32, bits: u32) -> Result<u32, ConfigError> {
    if bits < 32 && value >> bits != 0 {
        return Err(ConfigError::FieldOverflow { field, value: value as u64, bits });
    }
    Ok(value)
}

fn header(opcode: NpuOpcode, column: u8, byte1: u8, byte0: u8) -> u32 {
    (opcode as u32) << 24 | (column as u32) << 16 | (byte1 as u32) << 8 | byte0 as u32
}

/// Append one instruction's words to `out`.
pub fn encode_instruction(instruction: &NpuInstruction, out: &mut Vec<u32>) -> Result<(), ConfigError> {
    match *instruction {
        NpuInstruction::WriteBdShim {
            column,
            column_num,
            ddr_id,
            bd_id,
            buffer_length,
            buffer_offset,
            inner_count,
            inner_stride,
            outer_count,
            outer_stride,
        } => {
            let inner = check("inner_count", inner_count, BD_COUNT_BITS)? << BD_STRIDE_BITS
                | check("inner_stride", inner_stride, BD_STRIDE_BITS)?;
            let outer = check("outer_count", outer_count, BD_COUNT_BITS)? << BD_STRIDE_BITS
                | check("outer_stride", outer_stride, BD_STRIDE_BITS)?;
            out.extend_from_slice(&[
                header(NpuOpcode::WriteBdShim, column, column_num, ddr_id),
                bd_id,
                buffer_length,
                buffer_offset,
                0,
                inner,
                outer,
                0,
                0,
                0,
            ]);
        }
        NpuInstruction::QueuePush { column, row, direction, channel, bd_id } => {
            check("channel", channel as u32, channel_bits())?;
            out.extend_from_slice(&[
                header(NpuOpcode::Write32, column, row, 0),
                queue_register(direction, channel),
                bd_id,
            ]);
        }
        NpuInstruction::Sync { column, row, direction, channel, column_num, row_num } => {
            out.extend_from_slice(&[
                header(NpuOpcode::Sync, column, row, direction.as_bit() as u8),
                (channel as u32) << 24 | (column_num as u32) << 16 | (row_num as u32) << 8,
            ]);
        }
    }
    Ok(())
}

/// Bits needed to index the shim channels of one direction.
fn channel_bits() -> u32 {
    usize::BITS - (aie2_spec::SHIM_TILE_DMA_CHANNELS - 1).leading_zeros()
}

impl HostProgram {
    /// Encode as 32-bit words.
    pub fn to_words(&self) -> Result<Vec<u32>, ConfigError> {
        let mut words = Vec::with_capacity(self.instructions().iter().map(|i| i.opcode().words()).sum());
        for instruction in self.instructions() {
            encode_instruction(instruction, &mut words)?;
        }
        Ok(words)
    }

    /// Encode as little-endian bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let words = self.to_words()?;
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            // Writing into a Vec cannot fail.
            let _ = bytes.write_u32::<LittleEndian>(word);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::{BufferDescriptor, ChannelId};
    use crate::device::{MatrixShape, TileCoord};

    const SHIM: TileCoord = TileCoord::new(0, 0);

    #[test]
    fn test_write_bd_layout() {
        let desc = BufferDescriptor::new(136, 8, 16, 8, 1);
        let mut words = Vec::new();
        encode_instruction(&NpuInstruction::write_bd(0, 1, 7, &desc).unwrap(), &mut words).unwrap();
        assert_eq!(
            words,
            vec![
                0x0600_0101, // op=6, col=0, col_num=1, ddr=1
                7,
                64,
                136,
                0,
                8 << 20 | 1,
                8 << 20 | 16,
                0,
                0,
                0,
            ]
        );
    }

    #[test]
    fn test_queue_push_layout() {
        let mut words = Vec::new();
        encode_instruction(&NpuInstruction::queue_push(ChannelId::mm2s(SHIM, 1), 4), &mut words).unwrap();
        assert_eq!(words, vec![0x0200_0000, 0x1D21C, 4]);
    }

    #[test]
    fn test_sync_layout() {
        let mut words = Vec::new();
        encode_instruction(&NpuInstruction::sync(ChannelId::s2mm(SHIM, 0)), &mut words).unwrap();
        assert_eq!(words, vec![0x0300_0000, 0x0001_0100]);

        words.clear();
        encode_instruction(&NpuInstruction::sync(ChannelId::mm2s(SHIM, 1)), &mut words).unwrap();
        assert_eq!(words, vec![0x0300_0001, 0x0101_0100]);
    }

    #[test]
    fn test_quadrant_program_bit_exact() {
        let grid = MatrixShape::new(16, 16).partition(2, 2).unwrap();
        let mut program = HostProgram::new();
        for (bd_id, desc) in grid.descriptors().iter().enumerate() {
            program.enqueue(ChannelId::mm2s(SHIM, 0), 0, bd_id as u32, desc).unwrap();
        }

        let words = program.to_words().unwrap();
        assert_eq!(words.len(), 4 * (10 + 3));

        let offsets: Vec<u32> = words.chunks(13).map(|w| w[3]).collect();
        assert_eq!(offsets, vec![0, 8, 128, 136]);
        for chunk in words.chunks(13) {
            assert_eq!(chunk[2], 64, "buffer_length");
            assert_eq!(chunk[5], 8 << 20 | 1, "inner count/stride");
            assert_eq!(chunk[6], 8 << 20 | 16, "outer count/stride");
        }
    }

    #[test]
    fn test_field_overflow() {
        // 4096 rows do not fit the 12-bit count field.
        let desc = BufferDescriptor::new(0, 4096, 1, 1, 1);
        let program = HostProgram::from_instructions(vec![NpuInstruction::write_bd(0, 0, 0, &desc).unwrap()]);
        assert_eq!(
            program.to_words(),
            Err(ConfigError::FieldOverflow { field: "outer_count", value: 4096, bits: 12 })
        );

        let desc = BufferDescriptor::new(0, 1, 1 << 20, 1, 1);
        let program = HostProgram::from_instructions(vec![NpuInstruction::write_bd(0, 0, 0, &desc).unwrap()]);
        assert!(matches!(program.to_words(), Err(ConfigError::FieldOverflow { field: "outer_stride", .. })));
    }

    #[test]
    fn test_bytes_are_little_endian() {
        let program = HostProgram::from_instructions(vec![NpuInstruction::sync(ChannelId::s2mm(SHIM, 0))]);
        let bytes = program.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x03, 0x00, 0x01, 0x01, 0x00]);
    }
}
