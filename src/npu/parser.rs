//! Instruction stream parser.
//!
//! Decodes the word format produced by [`HostProgram::to_words`] back into
//! instructions. The stream has no header; instructions are read back to
//! back until the words run out.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::{queue_channel, HostProgram, NpuInstruction, NpuOpcode, BD_STRIDE_BITS};
use crate::device::dma::ChannelDirection;
use crate::error::DecodeError;

const STRIDE_MASK: u32 = (1 << BD_STRIDE_BITS) - 1;

/// Parse little-endian bytes.
pub fn parse_bytes(data: &[u8]) -> Result<HostProgram, DecodeError> {
    if data.len() % 4 != 0 {
        return Err(DecodeError::Unaligned(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut words = Vec::with_capacity(data.len() / 4);
    while let Ok(word) = cursor.read_u32::<LittleEndian>() {
        words.push(word);
    }
    parse_words(&words)
}

/// Parse a word stream.
pub fn parse_words(words: &[u32]) -> Result<HostProgram, DecodeError> {
    let mut instructions = Vec::new();
    let mut offset = 0;

    while offset < words.len() {
        let opcode_byte = (words[offset] >> 24) as u8;
        let opcode =
            NpuOpcode::from_u8(opcode_byte).ok_or(DecodeError::UnknownOpcode { opcode: opcode_byte, offset })?;

        let needed = opcode.words();
        let available = words.len() - offset;
        if available < needed {
            return Err(DecodeError::Truncated { offset, needed, available });
        }

        let w = &words[offset..offset + needed];
        let instruction = parse_instruction(opcode, w, offset)?;
        log::trace!("word {}: {}", offset, instruction);
        instructions.push(instruction);
        offset += needed;
    }

    log::debug!("Parsed {} host instructions from {} words", instructions.len(), words.len());
    Ok(HostProgram::from_instructions(instructions))
}

fn byte(word: u32, index: u32) -> u8 {
    (word >> (index * 8)) as u8
}

fn parse_instruction(opcode: NpuOpcode, w: &[u32], offset: usize) -> Result<NpuInstruction, DecodeError> {
    let column = byte(w[0], 2);

    let instruction = match opcode {
        NpuOpcode::WriteBdShim => NpuInstruction::WriteBdShim {
            column,
            column_num: byte(w[0], 1),
            ddr_id: byte(w[0], 0),
            bd_id: w[1],
            buffer_length: w[2],
            buffer_offset: w[3],
            inner_count: w[5] >> BD_STRIDE_BITS,
            inner_stride: w[5] & STRIDE_MASK,
            outer_count: w[6] >> BD_STRIDE_BITS,
            outer_stride: w[6] & STRIDE_MASK,
        },
        NpuOpcode::Write32 => {
            let register = w[1];
            let (direction, channel) =
                queue_channel(register).ok_or(DecodeError::UnknownRegister { register, offset })?;
            NpuInstruction::QueuePush { column, row: byte(w[0], 1), direction, channel, bd_id: w[2] }
        }
        NpuOpcode::Sync => NpuInstruction::Sync {
            column,
            row: byte(w[0], 1),
            direction: ChannelDirection::from_bit(w[0]),
            channel: byte(w[1], 3),
            column_num: byte(w[1], 2),
            row_num: byte(w[1], 1),
        },
    };
    Ok(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::{BufferDescriptor, ChannelId};
    use crate::device::TileCoord;

    const SHIM: TileCoord = TileCoord::new(0, 0);

    fn sample() -> HostProgram {
        let mut program = HostProgram::new();
        let desc = BufferDescriptor::new(128, 8, 16, 8, 1);
        program.enqueue(ChannelId::s2mm(SHIM, 0), 2, 10, &desc).unwrap();
        program.push(NpuInstruction::sync(ChannelId::s2mm(SHIM, 0)));
        program
    }

    #[test]
    fn test_parse_encoded_program() {
        let program = sample();
        let parsed = parse_words(&program.to_words().unwrap()).unwrap();
        assert_eq!(parsed, program);

        let parsed = parse_bytes(&program.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_parse_empty_stream() {
        assert!(parse_words(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_opcode() {
        let mut words = sample().to_words().unwrap();
        words.push(0x8000_0000);
        assert_eq!(parse_words(&words), Err(DecodeError::UnknownOpcode { opcode: 0x80, offset: 15 }));
    }

    #[test]
    fn test_truncated() {
        let words = sample().to_words().unwrap();
        assert_eq!(
            parse_words(&words[..6]),
            Err(DecodeError::Truncated { offset: 0, needed: 10, available: 6 })
        );
    }

    #[test]
    fn test_unknown_register() {
        let words = [0x0200_0000, 0x1D000, 0];
        assert_eq!(parse_words(&words), Err(DecodeError::UnknownRegister { register: 0x1D000, offset: 0 }));
    }

    #[test]
    fn test_unaligned_bytes() {
        assert_eq!(parse_bytes(&[0, 0, 0]), Err(DecodeError::Unaligned(3)));
    }
}
