//! DMA channel executor.
//!
//! Runs one channel's program against the device state:
//!
//! - tile channels cycle their steps forever, one step per
//!   `WaitLock -> Run -> Signal` pass
//! - shim channels take descriptors from their host queue and move data
//!   between host memory and the flow, reporting completion back to the
//!   queue in `Signal`
//!
//! An MM2S channel pushes one whole tile into its flow and is
//! back-pressured while the flow is occupied. An S2MM channel waits until
//! its flow delivers a tile.

use super::{BlockReason, Executor, Phase, Progress};
use crate::device::dma::{gather, scatter, BufferDescriptor, ChannelDirection, ChannelProgram, DmaChannel, DmaStep};
use crate::device::{DeviceState, LockId, LockResult, ShimBd, TilePacket};
use crate::error::{ConfigError, RunError};

/// Per-channel statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Tiles moved.
    pub transfers: u64,
    /// Elements moved.
    pub elements: u64,
    /// Turns spent blocked on a lock.
    pub lock_wait_turns: u64,
    /// Turns spent blocked on a flow (full outbound or empty inbound).
    pub flow_wait_turns: u64,
}

/// Executor for one DMA channel.
#[derive(Debug)]
pub struct ChannelExecutor {
    channel: DmaChannel,
    phase: Phase,
    /// Index of the current step (tile channels).
    step_index: usize,
    /// Descriptor being processed (shim channels).
    active_bd: Option<ShimBd>,
    pub stats: ChannelStats,
}

impl ChannelExecutor {
    pub fn new(channel: DmaChannel) -> Self {
        let phase = Self::initial_phase(&channel);
        Self { channel, phase, step_index: 0, active_bd: None, stats: ChannelStats::default() }
    }

    fn initial_phase(channel: &DmaChannel) -> Phase {
        if channel.is_host_queued() {
            Phase::Idle
        } else {
            Phase::WaitLock
        }
    }

    pub fn channel(&self) -> &DmaChannel {
        &self.channel
    }

    /// Current step of a tile program.
    fn current_step(&self) -> Option<&DmaStep> {
        match &self.channel.program {
            ChannelProgram::Looping(steps) => steps.get(self.step_index),
            ChannelProgram::HostQueued => None,
        }
    }

    fn wait_lock(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        let acquire = self.current_step().and_then(|s| s.acquire);
        if let Some(lock_use) = acquire {
            if state.apply_lock(lock_use)? == LockResult::WouldBlock {
                self.stats.lock_wait_turns += 1;
                return Ok(Progress::Blocked(BlockReason::Lock(lock_use.lock)));
            }
        }
        self.phase = Phase::Run;
        Ok(Progress::Advanced)
    }

    fn take_descriptor(&mut self, state: &mut DeviceState) -> Progress {
        match state.take_shim_bd(self.channel.id) {
            Some(bd) => {
                log::debug!("{} starts ddr {} {}", self.channel.id, bd.ddr_id, bd.descriptor);
                self.active_bd = Some(bd);
                self.phase = Phase::Run;
                Progress::Advanced
            }
            None => Progress::Blocked(BlockReason::NoDescriptor(self.channel.id)),
        }
    }

    fn transfer(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        let id = self.channel.id;
        let progress = match id.direction {
            ChannelDirection::MM2S => self.send(state)?,
            ChannelDirection::S2MM => self.receive(state)?,
        };

        match progress {
            Progress::Advanced => {
                self.phase = Phase::Signal;
            }
            Progress::Blocked(_) => self.stats.flow_wait_turns += 1,
            Progress::Finished => {}
        }
        Ok(progress)
    }

    /// MM2S: gather one tile and push it into the flow.
    fn send(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        let id = self.channel.id;
        if state.outbound_flow(id)?.is_full() {
            return Ok(Progress::Blocked(BlockReason::FlowFull(id)));
        }

        let data = match (self.current_step(), self.active_bd) {
            (Some(step), _) => {
                let memory = state.buffer(step.buffer).ok_or_else(|| missing_buffer(step))?;
                gather(memory, &step.descriptor)
            }
            (None, Some(bd)) => {
                let available = state.host.len();
                let host = state
                    .host
                    .get_mut(bd.ddr_id)
                    .ok_or(ConfigError::UnknownDdrBuffer { ddr_id: bd.ddr_id as u32, available })?;
                let data = gather(&host.data, &bd.descriptor);
                host.dma_reads += data.len() as u64;
                data
            }
            (None, None) => return Err(RunError::NotReady("shim channel running without a descriptor")),
        };

        self.record(data.len());
        log::debug!("{} sent {} elements", id, data.len());
        // Fullness was checked above.
        let _ = state.outbound_flow(id)?.push(TilePacket { data });
        Ok(Progress::Advanced)
    }

    /// S2MM: take one tile from the flow and scatter it.
    fn receive(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        let id = self.channel.id;
        let descriptor = self.descriptor()?;
        let Some(packet) = state.inbound_flow(id)?.pop() else {
            return Ok(Progress::Blocked(BlockReason::FlowEmpty(id)));
        };

        if packet.data.len() != descriptor.element_count() {
            return Err(RunError::LengthMismatch {
                channel: id,
                expected: descriptor.element_count(),
                actual: packet.data.len(),
            });
        }

        let written = match (self.current_step(), self.active_bd) {
            (Some(step), _) => {
                let buffer = step.buffer;
                let memory = state.buffer_mut(buffer).ok_or_else(|| missing_buffer(step))?;
                scatter(memory, &descriptor, &packet.data)
            }
            (None, Some(bd)) => {
                let available = state.host.len();
                let host = state
                    .host
                    .get_mut(bd.ddr_id)
                    .ok_or(ConfigError::UnknownDdrBuffer { ddr_id: bd.ddr_id as u32, available })?;
                let written = scatter(&mut host.data, &descriptor, &packet.data);
                host.dma_writes += written as u64;
                written
            }
            (None, None) => return Err(RunError::NotReady("shim channel running without a descriptor")),
        };

        self.record(written);
        log::debug!("{} received {} elements", id, written);
        Ok(Progress::Advanced)
    }

    fn descriptor(&self) -> Result<BufferDescriptor, RunError> {
        self.current_step()
            .map(|s| s.descriptor)
            .or(self.active_bd.map(|bd| bd.descriptor))
            .ok_or(RunError::NotReady("shim channel running without a descriptor"))
    }

    fn record(&mut self, elements: usize) {
        self.stats.transfers += 1;
        self.stats.elements += elements as u64;
    }

    fn signal(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        match &self.channel.program {
            ChannelProgram::Looping(steps) => {
                if let Some(lock_use) = steps[self.step_index].release {
                    state.apply_lock(lock_use)?;
                }
                self.step_index = (self.step_index + 1) % steps.len();
                self.phase = Phase::WaitLock;
            }
            ChannelProgram::HostQueued => {
                state.complete_shim_bd(self.channel.id);
                self.active_bd = None;
                self.phase = Phase::Idle;
            }
        }
        Ok(Progress::Advanced)
    }
}

impl Executor for ChannelExecutor {
    fn name(&self) -> String {
        self.channel.id.to_string()
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn step(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        match self.phase {
            Phase::Idle => Ok(self.take_descriptor(state)),
            Phase::WaitLock => self.wait_lock(state),
            Phase::Run => self.transfer(state),
            Phase::Signal => self.signal(state),
            Phase::Done => Ok(Progress::Finished),
        }
    }

    fn held_locks(&self) -> Vec<LockId> {
        match self.phase {
            Phase::Run | Phase::Signal => self
                .current_step()
                .and_then(|s| s.acquire)
                .map(|u| vec![u.lock])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.phase = Self::initial_phase(&self.channel);
        self.step_index = 0;
        self.active_bd = None;
        self.stats = ChannelStats::default();
    }
}

fn missing_buffer(step: &DmaStep) -> ConfigError {
    ConfigError::MissingBuffer { tile: step.buffer.tile, name: step.buffer.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::ChannelId;
    use crate::device::{DataDirection, MatrixShape, TileCoord};
    use crate::topology::{PipelineTopology, StepSpec, TopologyBuilder};
    use std::sync::Arc;

    const SHIM: TileCoord = TileCoord::new(0, 0);
    const MEM: TileCoord = TileCoord::new(0, 1);

    /// Shim -> mem tile -> shim loopback over one 2x2 buffer.
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

    fn executor(topo: &PipelineTopology, id: ChannelId) -> ChannelExecutor {
        ChannelExecutor::new(topo.channel(id).unwrap().clone())
    }

    fn state_with_host(topo: &Arc<PipelineTopology>) -> DeviceState {
        let mut state = DeviceState::new(Arc::clone(topo));
        let input = state.host.allocate(MatrixShape::new(2, 2), DataDirection::Input);
        state.host.get_mut(input).unwrap().data = vec![5, 6, 7, 8];
        state.host.allocate(MatrixShape::new(2, 2), DataDirection::Output);
        state
    }

    #[test]
    fn test_shim_idle_without_descriptor() {
        let topo = topology();
        let mut state = state_with_host(&topo);
        let mut shim = executor(&topo, ChannelId::mm2s(SHIM, 0));

        assert_eq!(shim.phase(), Phase::Idle);
        assert_eq!(
            shim.step(&mut state).unwrap(),
            Progress::Blocked(BlockReason::NoDescriptor(ChannelId::mm2s(SHIM, 0)))
        );
    }

    #[test]
    fn test_shim_mm2s_pushes_tile() {
        let topo = topology();
        let mut state = state_with_host(&topo);
        let ch = ChannelId::mm2s(SHIM, 0);
        let mut shim = executor(&topo, ch);

        state.push_shim_bd(ch, ShimBd { ddr_id: 0, descriptor: BufferDescriptor::contiguous(4) }).unwrap();
        for _ in 0..3 {
            assert_eq!(shim.step(&mut state).unwrap(), Progress::Advanced);
        }
        assert_eq!(shim.phase(), Phase::Idle);
        assert!(state.shim_channel_idle(ch).unwrap());
        assert_eq!(state.host.get(0).unwrap().dma_reads, 4);
        assert_eq!(shim.stats.transfers, 1);

        // A second descriptor is back-pressured by the occupied flow.
        state.push_shim_bd(ch, ShimBd { ddr_id: 0, descriptor: BufferDescriptor::contiguous(4) }).unwrap();
        shim.step(&mut state).unwrap();
        assert_eq!(shim.step(&mut state).unwrap(), Progress::Blocked(BlockReason::FlowFull(ch)));
        assert_eq!(shim.stats.flow_wait_turns, 1);
    }

    #[test]
    fn test_tile_s2mm_waits_for_data_then_signals() {
        let topo = topology();
        let mut state = state_with_host(&topo);
        let ch = ChannelId::s2mm(MEM, 0);
        let mut s2mm = executor(&topo, ch);
        let empty = topo.lock_id(MEM, "empty").unwrap();
        let full = topo.lock_id(MEM, "full").unwrap();

        // Acquire the empty lock, then starve on the flow.
        assert_eq!(s2mm.step(&mut state).unwrap(), Progress::Advanced);
        assert_eq!(s2mm.held_locks(), vec![empty]);
        assert_eq!(s2mm.step(&mut state).unwrap(), Progress::Blocked(BlockReason::FlowEmpty(ch)));
        state.check_invariants(&s2mm.held_locks()).unwrap();

        state.inbound_flow(ch).unwrap().push(TilePacket { data: vec![1, 2, 3, 4] }).unwrap();
        assert_eq!(s2mm.step(&mut state).unwrap(), Progress::Advanced);
        assert_eq!(s2mm.step(&mut state).unwrap(), Progress::Advanced);

        let buf = topo.tile(MEM).unwrap().buffer("buf").unwrap().id;
        assert_eq!(state.buffer(buf).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(state.lock(full).unwrap().value, 1);
        assert!(s2mm.held_locks().is_empty());
        state.check_invariants(&[]).unwrap();

        // Loops back to the first step and blocks on the empty lock.
        assert_eq!(s2mm.step(&mut state).unwrap(), Progress::Blocked(BlockReason::Lock(empty)));
    }

    #[test]
    fn test_length_mismatch_is_fatal() {
        let topo = topology();
        let mut state = state_with_host(&topo);
        let ch = ChannelId::s2mm(MEM, 0);
        let mut s2mm = executor(&topo, ch);

        s2mm.step(&mut state).unwrap();
        state.inbound_flow(ch).unwrap().push(TilePacket { data: vec![1, 2] }).unwrap();
        assert!(matches!(
            s2mm.step(&mut state),
            Err(RunError::LengthMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn test_loopback_round_trip() {
        let topo = topology();
        let mut state = state_with_host(&topo);
        let mut engines: Vec<ChannelExecutor> = topo.channels().map(|c| ChannelExecutor::new(c.clone())).collect();

        let bd = ShimBd { ddr_id: 0, descriptor: BufferDescriptor::contiguous(4) };
        state.push_shim_bd(ChannelId::mm2s(SHIM, 0), bd).unwrap();
        state.push_shim_bd(ChannelId::s2mm(SHIM, 0), ShimBd { ddr_id: 1, ..bd }).unwrap();

        for _ in 0..10 {
            for engine in engines.iter_mut() {
                engine.step(&mut state).unwrap();
            }
        }

        assert_eq!(state.host.get(1).unwrap().data, vec![5, 6, 7, 8]);
        assert_eq!(state.guard_cycles(), &[1]);
    }

    #[test]
    fn test_reset() {
        let topo = topology();
        let mut state = state_with_host(&topo);
        let mut s2mm = executor(&topo, ChannelId::s2mm(MEM, 0));
        s2mm.step(&mut state).unwrap();
        s2mm.reset();
        assert_eq!(s2mm.phase(), Phase::WaitLock);
        assert!(s2mm.held_locks().is_empty());
    }
}
