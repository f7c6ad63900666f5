//! Host command processor.
//!
//! Executes the host instruction stream against the device, one
//! instruction per turn:
//!
//! - `WriteBdShim` stores a descriptor in the shim column's table
//! - `Write32` to a queue register pushes a stored descriptor onto that
//!   shim channel
//! - `Sync` holds the stream until the channel has drained its queue
//!
//! The pipeline is complete once the last instruction has retired.

use super::{BlockReason, Executor, Phase, Progress};
use crate::device::{DeviceState, LockId};
use crate::error::{ConfigError, RunError};
use crate::npu::{HostProgram, NpuInstruction};

/// Executes a [`HostProgram`].
#[derive(Debug)]
pub struct CommandProcessor {
    program: HostProgram,
    pc: usize,
    phase: Phase,
    /// Instructions retired.
    pub executed: usize,
    /// Turns spent waiting in a `Sync`.
    pub sync_wait_turns: u64,
}

impl CommandProcessor {
    pub fn new(program: HostProgram) -> Self {
        Self { program, pc: 0, phase: Phase::Idle, executed: 0, sync_wait_turns: 0 }
    }

    /// Begin executing on the next turn.
    pub fn start(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Run;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn program(&self) -> &HostProgram {
        &self.program
    }

    fn execute(&mut self, instruction: NpuInstruction, state: &mut DeviceState) -> Result<Progress, RunError> {
        match instruction {
            NpuInstruction::WriteBdShim { column, bd_id, .. } => {
                if let Some(bd) = instruction.shim_bd() {
                    state.write_shim_bd(column, bd_id, bd);
                }
            }
            NpuInstruction::QueuePush { column, bd_id, .. } => {
                let bd = state.shim_bd(column, bd_id).ok_or(ConfigError::UnwrittenBd { column, bd_id })?;
                if let Some(channel) = instruction.channel() {
                    state.push_shim_bd(channel, bd)?;
                }
            }
            NpuInstruction::Sync { .. } => {
                if let Some(channel) = instruction.channel() {
                    if !state.shim_channel_idle(channel)? {
                        self.sync_wait_turns += 1;
                        return Ok(Progress::Blocked(BlockReason::Sync(channel)));
                    }
                    log::debug!("Sync on {} passed", channel);
                }
            }
        }
        Ok(Progress::Advanced)
    }
}

impl Executor for CommandProcessor {
    fn name(&self) -> String {
        "host".to_string()
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn step(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        match self.phase {
            Phase::Idle => return Ok(Progress::Blocked(BlockReason::NotStarted)),
            Phase::Done => return Ok(Progress::Finished),
            _ => {}
        }

        let Some(&instruction) = self.program.instructions().get(self.pc) else {
            self.phase = Phase::Done;
            return Ok(Progress::Advanced);
        };

        let progress = self.execute(instruction, state)?;
        if progress == Progress::Advanced {
            log::trace!("host [{}] {}", self.pc, instruction);
            self.pc += 1;
            self.executed += 1;
            if self.pc == self.program.len() {
                log::debug!("Host program retired {} instructions", self.executed);
                self.phase = Phase::Done;
            }
        }
        Ok(progress)
    }

    fn held_locks(&self) -> Vec<LockId> {
        Vec::new()
    }

    fn reset(&mut self) {
        self.pc = 0;
        self.phase = Phase::Idle;
        self.executed = 0;
        self.sync_wait_turns = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::{BufferDescriptor, ChannelDirection, ChannelId};
    use crate::device::{DataDirection, MatrixShape, TileCoord};
    use crate::topology::{PipelineTopology, StepSpec, TopologyBuilder};
    use std::sync::Arc;

    const SHIM: TileCoord = TileCoord::new(0, 0);
    const MEM: TileCoord = TileCoord::new(0, 1);

    fn topology() -> Arc<PipelineTopology> {
        let mut b = TopologyBuilder::new();
        b.tile(SHIM).tile(MEM);
        b.lock(MEM, "empty", 1).lock(MEM, "full", 0);
        b.buffer(MEM, "buf", MatrixShape::new(2, 2));
        b.guard(MEM, "buf", "empty", "full");
        b.shim_channel(SHIM, ChannelDirection::MM2S, 0);
        b.shim_channel(SHIM, ChannelDirection::S2MM, 0);
        b.s2mm(MEM, 0, vec![StepSpec::new("buf").acquire("empty", 1).release("full", 1)]);
        b.mm2s(MEM, 0, vec![StepSpec::new("buf").acquire("full", 1).release("empty", 1)]);
        b.flow_mm2s_to_s2mm((SHIM, 0), (MEM, 0));
        b.flow_mm2s_to_s2mm((MEM, 0), (SHIM, 0));
        Arc::new(b.build().unwrap())
    }

    fn state() -> DeviceState {
        let mut state = DeviceState::new(topology());
        state.host.allocate(MatrixShape::new(2, 2), DataDirection::Input);
        state
    }

    #[test]
    fn test_not_started() {
        let mut host = CommandProcessor::new(HostProgram::new());
        assert_eq!(host.step(&mut state()).unwrap(), Progress::Blocked(BlockReason::NotStarted));
        host.start();
        assert_eq!(host.step(&mut state()).unwrap(), Progress::Advanced);
        assert!(host.is_finished());
    }

    #[test]
    fn test_write_push_sync() {
        let ch = ChannelId::mm2s(SHIM, 0);
        let mut program = HostProgram::new();
        program.enqueue(ch, 0, 3, &BufferDescriptor::contiguous(4)).unwrap();
        program.push(NpuInstruction::sync(ch));

        let mut state = state();
        let mut host = CommandProcessor::new(program);
        host.start();

        assert_eq!(host.step(&mut state).unwrap(), Progress::Advanced);
        assert!(state.shim_bd(0, 3).is_some());
        assert_eq!(host.step(&mut state).unwrap(), Progress::Advanced);
        assert!(!state.shim_channel_idle(ch).unwrap());

        assert_eq!(host.step(&mut state).unwrap(), Progress::Blocked(BlockReason::Sync(ch)));
        assert_eq!(host.sync_wait_turns, 1);

        // Play the channel: take and complete the descriptor.
        state.take_shim_bd(ch).unwrap();
        state.complete_shim_bd(ch);
        assert_eq!(host.step(&mut state).unwrap(), Progress::Advanced);
        assert!(host.is_finished());
        assert_eq!(host.executed, 3);
    }

    #[test]
    fn test_push_of_unwritten_bd() {
        let program = HostProgram::from_instructions(vec![NpuInstruction::queue_push(ChannelId::mm2s(SHIM, 0), 9)]);
        let mut host = CommandProcessor::new(program);
        host.start();
        assert!(matches!(
            host.step(&mut state()),
            Err(RunError::Config(ConfigError::UnwrittenBd { column: 0, bd_id: 9 }))
        ));
    }
}
